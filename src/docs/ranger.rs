//! Range-based set reconciliation.
//!
//! Both sides hold a set of entries ordered by key. A side sends the fingerprint (XOR of the
//! entry hashes) of a range; the other side compares it against its own. Matching ranges are
//! done, small ranges are answered with their items, and everything else is split into
//! sub-ranges and recursed into. The exchange ends when neither side has anything to send.
//!
//! Ranges wrap around: `[x, y)` with `x < y` is the usual interval, `x > y` covers everything
//! outside `[y, x)`, and `x == y` covers the whole set.

use std::{cmp::Ordering, fmt::Debug};

use serde::{Deserialize, Serialize};

use super::ContentStatus;
use crate::error::Result;

/// Store entries that can be fingerprinted and put into ranges.
pub trait RangeEntry: Debug + Clone {
    /// The position of an entry in the ordered set. Distinct entries have distinct keys.
    type Key: Debug + Ord + Clone + Default;

    /// Get the key for this entry.
    fn key(&self) -> Self::Key;

    /// Get the fingerprint for this entry.
    fn as_fingerprint(&self) -> Fingerprint;
}

/// A range over the keys of a set. See the module docs for the wrap around semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Range<K> {
    x: K,
    y: K,
}

impl<K> Range<K> {
    /// Start of the range, inclusive.
    pub fn x(&self) -> &K {
        &self.x
    }

    /// End of the range, exclusive.
    pub fn y(&self) -> &K {
        &self.y
    }

    /// Creates a new range.
    pub fn new(x: K, y: K) -> Self {
        Range { x, y }
    }
}

impl<K: Ord> Range<K> {
    /// Whether this range covers the whole set.
    pub fn is_all(&self) -> bool {
        self.x() == self.y()
    }

    /// Whether `t` lies inside this range.
    pub fn contains(&self, t: &K) -> bool {
        match self.x().cmp(self.y()) {
            Ordering::Equal => true,
            Ordering::Less => self.x() <= t && t < self.y(),
            Ordering::Greater => self.x() <= t || t < self.y(),
        }
    }
}

/// XOR of the entry hashes of a range.
#[derive(Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; 32]);

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fp({})", blake3::Hash::from(self.0).to_hex())
    }
}

impl Fingerprint {
    /// The fingerprint of the empty set
    pub fn empty() -> Self {
        Fingerprint(*blake3::hash(&[]).as_bytes())
    }
}

impl std::ops::BitXorAssign for Fingerprint {
    fn bitxor_assign(&mut self, rhs: Self) {
        for (a, b) in self.0.iter_mut().zip(rhs.0.iter()) {
            *a ^= b;
        }
    }
}

/// Fingerprint of a range, sent when the range is too large to send the items directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeFingerprint<K> {
    /// The range.
    pub range: Range<K>,
    /// The fingerprint of `range`.
    pub fingerprint: Fingerprint,
}

/// Transfers items inside a range to the other participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeItem<E: RangeEntry> {
    /// The range out of which the elements are.
    #[serde(bound(
        serialize = "Range<E::Key>: Serialize",
        deserialize = "Range<E::Key>: Deserialize<'de>"
    ))]
    pub range: Range<E::Key>,
    /// The items, with the availability of their content at the sender.
    #[serde(bound(serialize = "E: Serialize", deserialize = "E: Deserialize<'de>"))]
    pub values: Vec<(E, ContentStatus)>,
    /// If false, requests to send local items in the range.
    /// Otherwise not.
    pub have_local: bool,
}

/// One part of a reconciliation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessagePart<E: RangeEntry> {
    /// A fingerprint to compare.
    #[serde(bound(
        serialize = "RangeFingerprint<E::Key>: Serialize",
        deserialize = "RangeFingerprint<E::Key>: Deserialize<'de>"
    ))]
    RangeFingerprint(RangeFingerprint<E::Key>),
    /// Items to merge.
    #[serde(bound(
        serialize = "RangeItem<E>: Serialize",
        deserialize = "RangeItem<E>: Deserialize<'de>"
    ))]
    RangeItem(RangeItem<E>),
}

impl<E: RangeEntry> MessagePart<E> {
    /// The items carried by this part.
    pub fn values(&self) -> Option<&[(E, ContentStatus)]> {
        match self {
            MessagePart::RangeFingerprint(_) => None,
            MessagePart::RangeItem(RangeItem { values, .. }) => Some(values),
        }
    }
}

/// A reconciliation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message<E: RangeEntry> {
    #[serde(bound(
        serialize = "MessagePart<E>: Serialize",
        deserialize = "MessagePart<E>: Deserialize<'de>"
    ))]
    parts: Vec<MessagePart<E>>,
}

impl<E: RangeEntry> Message<E> {
    /// The parts of this message.
    pub fn parts(&self) -> &[MessagePart<E>] {
        &self.parts
    }

    /// All items in this message.
    pub fn values(&self) -> impl Iterator<Item = &(E, ContentStatus)> {
        self.parts().iter().filter_map(|p| p.values()).flatten()
    }

    /// Number of items in this message.
    pub fn value_count(&self) -> usize {
        self.values().count()
    }
}

/// Ordered set storage the reconciliation runs against.
pub trait Store<E: RangeEntry> {
    /// Get the first key (or the default if none is available).
    fn get_first(&self) -> Result<E::Key>;

    /// Calculate the fingerprint of the given range.
    fn get_fingerprint(&self, range: &Range<E::Key>) -> Result<Fingerprint>;

    /// Returns all entries in the given range, ordered by key.
    fn get_range(&self, range: &Range<E::Key>) -> Result<Vec<E>>;

    /// Insert an entry. Returns `false` if an entry with the same key was already present.
    fn put(&mut self, entry: E) -> Result<bool>;
}

/// Computes the fingerprint of a sequence of entries.
pub fn fingerprint_of<'a, E: RangeEntry + 'a>(entries: impl IntoIterator<Item = &'a E>) -> Fingerprint {
    let mut fp = Fingerprint::empty();
    for entry in entries {
        fp ^= entry.as_fingerprint();
    }
    fp
}

/// Counters for one side of a reconciliation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
    /// Number of entries we received and inserted.
    pub num_recv: usize,
    /// Number of entries we sent.
    pub num_sent: usize,
}

/// One side of a reconciliation.
#[derive(Debug)]
pub struct Peer {
    /// Up to how many values to send immediately, before sending only a fingerprint.
    max_set_size: usize,
    /// `k` in the protocol, how many splits to generate. at least 2
    split_factor: usize,
}

impl Default for Peer {
    fn default() -> Self {
        Peer {
            max_set_size: 1,
            split_factor: 2,
        }
    }
}

impl Peer {
    /// Generates the initial message.
    pub fn initial_message<E: RangeEntry, S: Store<E>>(&self, store: &S) -> Result<Message<E>> {
        let x = store.get_first()?;
        let range = Range::new(x.clone(), x);
        let fingerprint = store.get_fingerprint(&range)?;
        let part = MessagePart::RangeFingerprint(RangeFingerprint { range, fingerprint });
        Ok(Message { parts: vec![part] })
    }

    /// Processes an incoming message and produces a response.
    /// If terminated, returns `None`
    ///
    /// `validate_cb` is called for each incoming entry before it is stored. An error aborts
    /// the reconciliation. `on_insert_cb` is called for each entry that was new to the store.
    /// `content_status_cb` is called for each outgoing entry.
    pub fn process_message<E, S, V, I, C>(
        &self,
        store: &mut S,
        message: Message<E>,
        mut validate_cb: V,
        mut on_insert_cb: I,
        content_status_cb: C,
        outcome: &mut SyncOutcome,
    ) -> Result<Option<Message<E>>>
    where
        E: RangeEntry,
        S: Store<E>,
        V: FnMut(&E) -> Result<()>,
        I: FnMut(E, ContentStatus),
        C: Fn(&E) -> ContentStatus,
    {
        let mut out = Vec::new();

        let mut items = Vec::new();
        let mut fingerprints = Vec::new();
        for part in message.parts {
            match part {
                MessagePart::RangeItem(item) => items.push(item),
                MessagePart::RangeFingerprint(fp) => fingerprints.push(fp),
            }
        }

        let with_status = |entries: Vec<E>| -> Vec<(E, ContentStatus)> {
            entries
                .into_iter()
                .map(|entry| {
                    let status = content_status_cb(&entry);
                    (entry, status)
                })
                .collect()
        };

        // Process item messages
        for RangeItem {
            range,
            values,
            have_local,
        } in items
        {
            let diff = if have_local {
                None
            } else {
                // everything we have in the range that the peer did not send
                let ours = store.get_range(&range)?;
                let diff: Vec<E> = ours
                    .into_iter()
                    .filter(|our_entry| {
                        let key = our_entry.key();
                        !values.iter().any(|(theirs, _)| theirs.key() == key)
                    })
                    .collect();
                Some(diff)
            };

            for (entry, content_status) in values {
                validate_cb(&entry)?;
                if store.put(entry.clone())? {
                    outcome.num_recv += 1;
                    on_insert_cb(entry, content_status);
                }
            }

            if let Some(diff) = diff {
                if !diff.is_empty() {
                    outcome.num_sent += diff.len();
                    out.push(MessagePart::RangeItem(RangeItem {
                        range,
                        values: with_status(diff),
                        have_local: true,
                    }));
                }
            }
        }

        // Process fingerprint messages
        for RangeFingerprint { range, fingerprint } in fingerprints {
            let local_fingerprint = store.get_fingerprint(&range)?;
            // Case1 Match, nothing to do
            if local_fingerprint == fingerprint {
                continue;
            }

            // Case2 Recursion Anchor
            let local_values = store.get_range(&range)?;
            if local_values.len() <= 1 || fingerprint == Fingerprint::empty() {
                outcome.num_sent += local_values.len();
                out.push(MessagePart::RangeItem(RangeItem {
                    range,
                    values: with_status(local_values),
                    have_local: false,
                }));
                continue;
            }

            // Case3 Recurse
            // m0 = x < m1 < .. < mk = y, with k >= 2, such that [ml, ml+1) is nonempty
            let mut ranges = Vec::with_capacity(self.split_factor);

            // first index whose key is not below the start of the range
            let start_index = local_values
                .iter()
                .position(|el| el.key() >= *range.x())
                .unwrap_or(0);
            // pivots repeat every split_factor; pivot(0) != x if local_values.len() >= 2
            let pivot = |i: usize| {
                let i = i % self.split_factor;
                let offset = (local_values.len() * (i + 1)) / self.split_factor;
                let offset = (start_index + offset) % local_values.len();
                local_values[offset].key()
            };
            if range.is_all() {
                // exactly one of the ranges wraps around, together they cover the set
                for i in 0..self.split_factor {
                    let (x, y) = (pivot(i), pivot(i + 1));
                    if x != y {
                        ranges.push(Range { x, y })
                    }
                }
            } else {
                ranges.push(Range {
                    x: range.x().clone(),
                    y: pivot(0),
                });
                for i in 0..self.split_factor - 2 {
                    let (x, y) = (pivot(i), pivot(i + 1));
                    if x != y {
                        ranges.push(Range { x, y })
                    }
                }
                ranges.push(Range {
                    x: pivot(self.split_factor - 2),
                    y: range.y().clone(),
                });
            }

            for range in ranges {
                let chunk = store.get_range(&range)?;
                if chunk.len() > self.max_set_size {
                    let fingerprint = fingerprint_of(&chunk);
                    out.push(MessagePart::RangeFingerprint(RangeFingerprint {
                        range,
                        fingerprint,
                    }));
                } else {
                    outcome.num_sent += chunk.len();
                    out.push(MessagePart::RangeItem(RangeItem {
                        range,
                        values: with_status(chunk),
                        have_local: false,
                    }));
                }
            }
        }

        if !out.is_empty() {
            Ok(Some(Message { parts: out }))
        } else {
            Ok(None)
        }
    }
}

/// Reconciliation helpers over an ordered map, shared by the document store and tests.
pub(crate) mod btree {
    use std::collections::BTreeMap;

    use super::*;

    /// Entries of `map` inside `range`, ordered by key.
    pub fn range<'a, K: Ord + Clone, V>(
        map: &'a BTreeMap<K, V>,
        range: &Range<K>,
    ) -> Box<dyn Iterator<Item = &'a V> + 'a> {
        let (x, y) = (range.x().clone(), range.y().clone());
        match x.cmp(&y) {
            Ordering::Equal => Box::new(map.values()),
            Ordering::Less => Box::new(map.range(x..y).map(|(_, v)| v)),
            Ordering::Greater => Box::new(
                map.range(x..)
                    .chain(map.range(..y))
                    .map(|(_, v)| v),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item(u32);

    impl RangeEntry for Item {
        type Key = u32;

        fn key(&self) -> u32 {
            self.0
        }

        fn as_fingerprint(&self) -> Fingerprint {
            Fingerprint(blake3::hash(&self.0.to_be_bytes()).into())
        }
    }

    #[derive(Debug, Default)]
    struct SimpleStore(BTreeMap<u32, Item>);

    impl Store<Item> for SimpleStore {
        fn get_first(&self) -> Result<u32> {
            Ok(self.0.keys().next().copied().unwrap_or_default())
        }

        fn get_fingerprint(&self, range: &Range<u32>) -> Result<Fingerprint> {
            Ok(fingerprint_of(btree::range(&self.0, range)))
        }

        fn get_range(&self, range: &Range<u32>) -> Result<Vec<Item>> {
            Ok(btree::range(&self.0, range).cloned().collect())
        }

        fn put(&mut self, entry: Item) -> Result<bool> {
            Ok(self.0.insert(entry.0, entry).is_none())
        }
    }

    struct SyncResult {
        alice: SyncOutcome,
        bob: SyncOutcome,
        rounds: usize,
    }

    fn sync(alice: &mut SimpleStore, bob: &mut SimpleStore) -> SyncResult {
        let peer = Peer::default();
        let mut res = SyncResult {
            alice: Default::default(),
            bob: Default::default(),
            rounds: 0,
        };
        let status = |_: &Item| ContentStatus::Complete;
        let mut next = Some(peer.initial_message(alice).unwrap());
        let mut to_bob = true;
        while let Some(msg) = next.take() {
            res.rounds += 1;
            assert!(res.rounds < 1000, "reconciliation does not terminate");
            let (store, outcome) = if to_bob {
                (&mut *bob, &mut res.bob)
            } else {
                (&mut *alice, &mut res.alice)
            };
            next = peer
                .process_message(store, msg, |_| Ok(()), |_, _| {}, status, outcome)
                .unwrap();
            to_bob = !to_bob;
        }
        res
    }

    fn store(items: impl IntoIterator<Item = u32>) -> SimpleStore {
        SimpleStore(items.into_iter().map(|i| (i, Item(i))).collect())
    }

    #[test]
    fn range_contains_wraps() {
        let r = Range::new(5, 2);
        assert!(r.contains(&7));
        assert!(r.contains(&1));
        assert!(!r.contains(&3));
        assert!(Range::new(3, 3).contains(&100));
        assert!(!Range::new(1, 3).contains(&3));
    }

    #[test]
    fn sync_empty() {
        let mut a = store([]);
        let mut b = store([]);
        let res = sync(&mut a, &mut b);
        assert_eq!(res.rounds, 1);
    }

    #[test]
    fn sync_disjoint() {
        let mut a = store([1, 3, 5]);
        let mut b = store([2, 4]);
        let res = sync(&mut a, &mut b);
        assert_eq!(a.0, b.0);
        assert_eq!(a.0.len(), 5);
        assert_eq!(res.alice.num_recv, 2);
        assert_eq!(res.bob.num_recv, 3);
    }

    #[test]
    fn sync_equal_sets_is_one_round() {
        let mut a = store(0..100);
        let mut b = store(0..100);
        let res = sync(&mut a, &mut b);
        assert_eq!(res.rounds, 1);
        assert_eq!(res.bob.num_sent, 0);
    }

    #[test]
    fn sync_few_differences_sends_few_items() {
        let mut a = store(0..1000);
        let mut b = store((0..1000).filter(|i| *i != 500));
        let res = sync(&mut a, &mut b);
        assert_eq!(a.0, b.0);
        assert_eq!(res.bob.num_recv, 1);
        // far less than the whole set travels
        assert!(res.alice.num_sent + res.bob.num_sent < 50);
    }

    proptest! {
        #[test]
        fn sync_converges(
            a in proptest::collection::btree_set(0u32..200, 0..60),
            b in proptest::collection::btree_set(0u32..200, 0..60),
        ) {
            let mut sa = store(a.iter().copied());
            let mut sb = store(b.iter().copied());
            sync(&mut sa, &mut sb);
            let expected: Vec<u32> = a.union(&b).copied().collect();
            prop_assert_eq!(sa.0.keys().copied().collect::<Vec<_>>(), expected.clone());
            prop_assert_eq!(sb.0.keys().copied().collect::<Vec<_>>(), expected);
        }

        #[test]
        fn disjoint_sets_converge_whoever_starts(
            items in proptest::collection::btree_set(0u32..10_000, 0..200),
            mask in any::<u64>(),
        ) {
            let (ours, theirs): (Vec<u32>, Vec<u32>) =
                items.iter().partition(|i| mask & (1 << (*i % 64)) != 0);
            let (mut a1, mut b1) = (store(ours.clone()), store(theirs.clone()));
            sync(&mut a1, &mut b1);
            let (mut a2, mut b2) = (store(ours), store(theirs));
            sync(&mut b2, &mut a2);
            let expected = store(items).0;
            prop_assert_eq!(&a1.0, &expected);
            prop_assert_eq!(&b1.0, &expected);
            prop_assert_eq!(&a2.0, &expected);
            prop_assert_eq!(&b2.0, &expected);
        }
    }
}
