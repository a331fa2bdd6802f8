//! Signed document entries.

use std::{
    cmp::Ordering,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use ed25519_dalek::{Signature, SignatureError};
use serde::{Deserialize, Serialize};

use super::{
    keys::{Author, AuthorId, NamespaceId, NamespaceSecret},
    ranger::{Fingerprint, RangeEntry},
};
use crate::{
    blobs::Hash,
    error::{Error, Result},
};

/// Identifies the slot an entry is written to: a key in a namespace, per author.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordIdentifier {
    namespace: NamespaceId,
    author: AuthorId,
    key: Bytes,
}

impl RecordIdentifier {
    /// Creates a new identifier.
    pub fn new(namespace: NamespaceId, author: AuthorId, key: impl Into<Bytes>) -> Self {
        RecordIdentifier {
            namespace,
            author,
            key: key.into(),
        }
    }

    /// Appends the canonical byte representation.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.namespace.as_bytes());
        out.extend_from_slice(self.author.as_bytes());
        out.extend_from_slice(&self.key);
    }

    /// The key of the record.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// The namespace this record belongs to.
    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }

    /// The author that wrote this record.
    pub fn author(&self) -> AuthorId {
        self.author
    }
}

/// The value written to a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Record creation timestamp. Counted as micros since the Unix epoch.
    timestamp: u64,
    /// Length of the data referenced by `hash`.
    len: u64,
    hash: Hash,
}

impl Record {
    /// Creates a new record.
    pub fn new(hash: Hash, len: u64, timestamp: u64) -> Self {
        Record {
            timestamp,
            len,
            hash,
        }
    }

    /// Creates a record stamped with the current wall clock time.
    pub fn new_current(hash: Hash, len: u64) -> Self {
        Self::new(hash, len, system_time_now())
    }

    /// Creation timestamp in micros since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Length of the referenced content.
    pub fn content_len(&self) -> u64 {
        self.len
    }

    /// Hash of the referenced content.
    pub fn content_hash(&self) -> Hash {
        self.hash
    }

    /// Appends the canonical byte representation.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.len.to_be_bytes());
        out.extend_from_slice(self.hash.as_bytes());
    }
}

/// Microseconds since the Unix epoch.
pub(crate) fn system_time_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// How far ahead of our clock an incoming entry may be, in microseconds.
pub const MAX_TIMESTAMP_FUTURE_SHIFT: u64 = 10 * 60 * 1_000_000;

/// Checks an entry received from a peer before it is stored.
pub(crate) fn validate_remote(namespace: NamespaceId, entry: &SignedEntry) -> Result<()> {
    if entry.namespace() != namespace {
        return Err(Error::verification(format!(
            "entry for {} in sync of {}",
            entry.namespace().fmt_short(),
            namespace.fmt_short()
        )));
    }
    if entry.timestamp() > system_time_now().saturating_add(MAX_TIMESTAMP_FUTURE_SHIFT) {
        return Err(Error::verification("entry timestamp is too far in the future"));
    }
    entry
        .verify()
        .map_err(|_| Error::verification("invalid entry signature"))
}

/// A single entry in a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    id: RecordIdentifier,
    record: Record,
}

impl Entry {
    /// Creates a new entry.
    pub fn new(id: RecordIdentifier, record: Record) -> Self {
        Entry { id, record }
    }

    /// The identifier of the entry.
    pub fn id(&self) -> &RecordIdentifier {
        &self.id
    }

    /// The record of the entry.
    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Serialize this entry into its canonical byte representation used for signing.
    pub fn encode(&self, out: &mut Vec<u8>) {
        self.id.encode(out);
        self.record.encode(out);
    }

    /// Canonical bytes as a fresh vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Signs the entry with the namespace and author keys.
    pub fn sign(self, namespace: &NamespaceSecret, author: &Author) -> SignedEntry {
        SignedEntry::from_entry(self, namespace, author)
    }
}

/// Signatures over an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySignature {
    author_signature: Signature,
    namespace_signature: Signature,
}

impl EntrySignature {
    /// Signs `entry` with both keys.
    pub fn from_entry(entry: &Entry, namespace: &NamespaceSecret, author: &Author) -> Self {
        let bytes = entry.to_vec();
        let namespace_signature = namespace.sign(&bytes);
        let author_signature = author.sign(&bytes);

        EntrySignature {
            author_signature,
            namespace_signature,
        }
    }

    /// Verifies both signatures.
    pub fn verify(
        &self,
        entry: &Entry,
        namespace: &NamespaceId,
        author: &AuthorId,
    ) -> Result<(), SignatureError> {
        let bytes = entry.to_vec();
        namespace.verify(&bytes, &self.namespace_signature)?;
        author.verify(&bytes, &self.author_signature)?;

        Ok(())
    }
}

/// A signed entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEntry {
    signature: EntrySignature,
    entry: Entry,
}

impl SignedEntry {
    /// Signs `entry`.
    pub fn from_entry(entry: Entry, namespace: &NamespaceSecret, author: &Author) -> Self {
        let signature = EntrySignature::from_entry(&entry, namespace, author);
        SignedEntry { signature, entry }
    }

    /// Creates a signed entry for `key` with the current time.
    pub fn from_parts(
        namespace: &NamespaceSecret,
        author: &Author,
        key: impl Into<Bytes>,
        record: Record,
    ) -> Self {
        let id = RecordIdentifier::new(namespace.id(), author.id(), key);
        let entry = Entry::new(id, record);
        Self::from_entry(entry, namespace, author)
    }

    /// Verifies the namespace and author signatures.
    pub fn verify(&self) -> Result<(), SignatureError> {
        self.signature
            .verify(&self.entry, &self.entry.id.namespace, &self.entry.id.author)
    }

    /// The signatures.
    pub fn signature(&self) -> &EntrySignature {
        &self.signature
    }

    /// The unsigned entry.
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// The namespace of this entry.
    pub fn namespace(&self) -> NamespaceId {
        self.entry.id.namespace
    }

    /// The author of this entry.
    pub fn author(&self) -> AuthorId {
        self.entry.id.author
    }

    /// The key of this entry.
    pub fn key(&self) -> &[u8] {
        &self.entry.id.key
    }

    /// The content hash of this entry.
    pub fn content_hash(&self) -> Hash {
        self.entry.record.hash
    }

    /// The content length of this entry.
    pub fn content_len(&self) -> u64 {
        self.entry.record.len
    }

    /// The timestamp of this entry.
    pub fn timestamp(&self) -> u64 {
        self.entry.record.timestamp
    }

    /// Compares two entries for the same key by last-writer-wins order.
    ///
    /// The greater entry is the visible one: highest timestamp, then author, then content hash.
    pub fn lww_cmp(&self, other: &Self) -> Ordering {
        self.timestamp()
            .cmp(&other.timestamp())
            .then_with(|| self.author().cmp(&other.author()))
            .then_with(|| self.content_hash().cmp(&other.content_hash()))
    }

    /// Position of this entry in the sorted record space of its document.
    pub fn sort_key(&self) -> EntryKey {
        EntryKey {
            key: self.entry.id.key.clone(),
            author: self.author(),
            timestamp: self.timestamp(),
            hash: self.content_hash(),
        }
    }
}

/// Position of an entry in the sorted record space of a document.
///
/// Sorted by key first, so a key prefix maps to a contiguous range. Every entry ever written
/// has a distinct position, so the record space keeps the full history.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryKey {
    key: Bytes,
    author: AuthorId,
    timestamp: u64,
    hash: Hash,
}

impl EntryKey {
    /// The smallest position with the given key.
    pub fn first_for_key(key: impl Into<Bytes>) -> Self {
        EntryKey {
            key: key.into(),
            ..Default::default()
        }
    }

    /// The key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

impl Default for EntryKey {
    fn default() -> Self {
        EntryKey {
            key: Bytes::new(),
            author: AuthorId::default(),
            timestamp: 0,
            hash: Hash::from_bytes([0u8; 32]),
        }
    }
}

impl RangeEntry for SignedEntry {
    type Key = EntryKey;

    fn key(&self) -> EntryKey {
        self.sort_key()
    }

    fn as_fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.entry.to_vec());
        Fingerprint(hasher.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn sign_and_verify() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
        let alice = Author::new(&mut rng);
        let myspace = NamespaceSecret::new(&mut rng);
        let other = NamespaceSecret::new(&mut rng);

        let record = Record::new_current(Hash::new(b"this is my cool data"), 20);
        let entry = SignedEntry::from_parts(&myspace, &alice, "/my/key", record.clone());
        entry.verify().unwrap();

        // re-signing the same content with another namespace key must not verify for ours
        let forged = Entry::new(
            RecordIdentifier::new(myspace.id(), alice.id(), "/my/key"),
            record,
        );
        let forged = SignedEntry {
            signature: EntrySignature::from_entry(&forged, &other, &alice),
            entry: forged,
        };
        assert!(forged.verify().is_err());
    }

    #[test]
    fn remote_validation() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(3);
        let ns = NamespaceSecret::new(&mut rng);
        let other = NamespaceSecret::new(&mut rng);
        let author = Author::new(&mut rng);

        let ok = SignedEntry::from_parts(&ns, &author, "k", Record::new_current(Hash::new(b"v"), 1));
        validate_remote(ns.id(), &ok).unwrap();
        assert!(validate_remote(other.id(), &ok).unwrap_err().is_verification());

        let future = system_time_now() + 2 * MAX_TIMESTAMP_FUTURE_SHIFT;
        let late = SignedEntry::from_parts(&ns, &author, "k", Record::new(Hash::new(b"v"), 1, future));
        assert!(validate_remote(ns.id(), &late).unwrap_err().is_verification());
    }

    #[test]
    fn lww_tie_break() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(1);
        let ns = NamespaceSecret::new(&mut rng);
        let mut authors = vec![Author::new(&mut rng), Author::new(&mut rng)];
        authors.sort_by_key(|a| a.id());
        let [low, high] = [&authors[0], &authors[1]];

        let t = 1_000;
        let a = SignedEntry::from_parts(&ns, low, "k", Record::new(Hash::new(b"a"), 1, t));
        let b = SignedEntry::from_parts(&ns, high, "k", Record::new(Hash::new(b"b"), 1, t));
        assert_eq!(a.lww_cmp(&b), Ordering::Less);

        let later = SignedEntry::from_parts(&ns, low, "k", Record::new(Hash::new(b"c"), 1, t + 1));
        assert_eq!(later.lww_cmp(&b), Ordering::Greater);

        let (x, y) = (Hash::new(b"x"), Hash::new(b"y"));
        let (small, big) = if x < y { (x, y) } else { (y, x) };
        let c = SignedEntry::from_parts(&ns, low, "k", Record::new(small, 1, t));
        let d = SignedEntry::from_parts(&ns, low, "k", Record::new(big, 1, t));
        assert_eq!(c.lww_cmp(&d), Ordering::Less);
    }

    #[test]
    fn sort_key_groups_by_key() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(2);
        let ns = NamespaceSecret::new(&mut rng);
        let author = Author::new(&mut rng);
        let a = SignedEntry::from_parts(&ns, &author, "a/2", Record::new(Hash::new(b"1"), 1, 9));
        let b = SignedEntry::from_parts(&ns, &author, "a/10", Record::new(Hash::new(b"1"), 1, 1));
        assert!(b.sort_key() < a.sort_key());
        assert!(EntryKey::first_for_key("a/10") <= b.sort_key());
    }
}
