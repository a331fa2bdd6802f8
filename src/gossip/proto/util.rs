//! Collections used by the protocol state machines.

use std::{
    collections::BTreeMap,
    hash::Hash,
    time::{Duration, Instant},
};

use rand::{
    Rng,
    seq::{IteratorRandom, SliceRandom},
};

/// A set with insertion order iteration and random picks.
///
/// Removal always shifts, so the order of the remaining elements is kept and runs with a
/// seeded rng are reproducible.
#[derive(Debug, Clone)]
pub(crate) struct IndexSet<T> {
    inner: indexmap::IndexSet<T>,
}

impl<T: Hash + Eq> Default for IndexSet<T> {
    fn default() -> Self {
        Self {
            inner: indexmap::IndexSet::new(),
        }
    }
}

impl<T: Hash + Eq> IndexSet<T> {
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn insert(&mut self, value: T) -> bool {
        self.inner.insert(value)
    }

    pub fn contains(&self, value: &T) -> bool {
        self.inner.contains(value)
    }

    pub fn remove(&mut self, value: &T) -> Option<T> {
        self.inner.shift_remove_full(value).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.inner.iter()
    }

    /// Removes and returns a random element.
    pub fn remove_random<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let index = rng.gen_range(0..self.inner.len());
        self.inner.shift_remove_index(index)
    }

    /// Picks a random element.
    pub fn pick_random<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&T> {
        self.inner.iter().choose(rng)
    }

    /// Picks a random element that is not in `without`.
    pub fn pick_random_without<R: Rng + ?Sized>(&self, without: &[&T], rng: &mut R) -> Option<&T> {
        self.iter().filter(|x| !without.contains(x)).choose(rng)
    }

    /// Iterates in insertion order, skipping `value`.
    pub fn iter_without<'a>(&'a self, value: &'a T) -> impl Iterator<Item = &'a T> {
        self.iter().filter(move |x| *x != value)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.inner.drain(..)
    }
}

impl<T: Hash + Eq + Clone> IndexSet<T> {
    /// Up to `len` elements not in `without`, in random order.
    pub fn shuffled_without_and_capped<R: Rng + ?Sized>(
        &self,
        without: &[&T],
        len: usize,
        rng: &mut R,
    ) -> Vec<T> {
        let mut items = self
            .inner
            .iter()
            .filter(|x| !without.contains(x))
            .cloned()
            .collect::<Vec<_>>();
        items.shuffle(rng);
        items.truncate(len);
        items
    }
}

/// Insertion ordered map that forgets its oldest entries beyond `capacity`.
#[derive(Debug)]
pub(crate) struct BoundedMap<K, V> {
    inner: indexmap::IndexMap<K, V>,
    capacity: usize,
}

impl<K: Hash + Eq, V> BoundedMap<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Default::default(),
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.inner.insert(key, value);
        while self.inner.len() > self.capacity {
            self.inner.shift_remove_index(0);
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

/// Items keyed by the instant they expire at.
#[derive(Debug)]
pub struct TimerMap<T>(BTreeMap<Instant, Vec<T>>);

impl<T> Default for TimerMap<T> {
    fn default() -> Self {
        Self(Default::default())
    }
}

impl<T> TimerMap<T> {
    /// Adds an item expiring at `instant`.
    pub fn insert(&mut self, instant: Instant, item: T) {
        self.0.entry(instant).or_default().push(item);
    }

    /// Removes and returns all items expiring at or before `until`.
    pub fn drain_until(&mut self, until: &Instant) -> impl Iterator<Item = (Instant, T)> + use<T> {
        let split_point = *until + Duration::from_nanos(1);
        let later = self.0.split_off(&split_point);
        let expired = std::mem::replace(&mut self.0, later);
        expired
            .into_iter()
            .flat_map(|(t, v)| v.into_iter().map(move |v| (t, v)))
    }

    /// The earliest expiry.
    pub fn first(&self) -> Option<&Instant> {
        self.0.keys().next()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn timer_map_drains_in_order() {
        let now = Instant::now();
        let mut map = TimerMap::default();
        map.insert(now + Duration::from_millis(20), "c");
        map.insert(now, "a");
        map.insert(now + Duration::from_millis(10), "b");
        map.insert(now + Duration::from_millis(10), "b2");

        let drained = map
            .drain_until(&(now + Duration::from_millis(10)))
            .map(|(_, v)| v)
            .collect::<Vec<_>>();
        assert_eq!(drained, vec!["a", "b", "b2"]);
        assert_eq!(map.first(), Some(&(now + Duration::from_millis(20))));
    }

    #[test]
    fn bounded_map_evicts_oldest() {
        let mut map = BoundedMap::new(2);
        map.insert(1, ());
        map.insert(2, ());
        map.insert(3, ());
        assert_eq!(map.len(), 2);
        assert!(!map.contains_key(&1));
        assert!(map.contains_key(&3));
    }

    #[test]
    fn random_picks_respect_exclusions() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
        let mut set = IndexSet::default();
        for i in 0..5 {
            set.insert(i);
        }
        for _ in 0..20 {
            let x = set.pick_random_without(&[&0, &1], &mut rng).copied();
            assert!(matches!(x, Some(2..=4)));
        }
        let picked = set.shuffled_without_and_capped(&[&4], 3, &mut rng);
        assert_eq!(picked.len(), 3);
        assert!(!picked.contains(&4));
        set.remove(&2);
        assert_eq!(set.iter().copied().collect::<Vec<_>>(), vec![0, 1, 3, 4]);
    }
}
