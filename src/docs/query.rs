//! Queries over the entries of a document.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{AuthorId, SignedEntry};

/// Which keys a [`Query`] selects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyFilter {
    /// All keys.
    #[default]
    Any,
    /// Exactly this key.
    Exact(Bytes),
    /// Keys starting with this prefix.
    Prefix(Bytes),
}

impl KeyFilter {
    /// Whether `key` passes the filter.
    pub fn matches(&self, key: &[u8]) -> bool {
        match self {
            KeyFilter::Any => true,
            KeyFilter::Exact(k) => k.as_ref() == key,
            KeyFilter::Prefix(p) => key.starts_with(p),
        }
    }
}

/// A query for entries of a document.
///
/// With `latest_only`, one entry per key is returned: the last writer per key, decided by
/// timestamp, then author, then content hash. Otherwise every entry ever written is returned.
/// The author filter is applied before the last writer is picked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub(crate) key: KeyFilter,
    pub(crate) author: Option<AuthorId>,
    pub(crate) latest_only: bool,
}

impl Query {
    /// Query all entries, latest per key.
    pub fn all() -> Self {
        Self {
            latest_only: true,
            ..Default::default()
        }
    }

    /// Query entries with exactly this key, latest only.
    pub fn key_exact(key: impl Into<Bytes>) -> Self {
        Self {
            key: KeyFilter::Exact(key.into()),
            latest_only: true,
            ..Default::default()
        }
    }

    /// Query entries whose key starts with `prefix`, latest per key.
    pub fn key_prefix(prefix: impl Into<Bytes>) -> Self {
        Self {
            key: KeyFilter::Prefix(prefix.into()),
            latest_only: true,
            ..Default::default()
        }
    }

    /// Only return entries written by `author`.
    pub fn author(mut self, author: AuthorId) -> Self {
        self.author = Some(author);
        self
    }

    /// Switch between latest per key and the full history.
    pub fn latest_only(mut self, latest_only: bool) -> Self {
        self.latest_only = latest_only;
        self
    }

    /// The key filter.
    pub fn key_filter(&self) -> &KeyFilter {
        &self.key
    }

    /// Whether a single entry passes the key and author filters.
    pub fn matches(&self, entry: &SignedEntry) -> bool {
        self.key.matches(entry.key()) && self.author.is_none_or(|a| a == entry.author())
    }

    /// Applies the query to entries sorted by key, as kept by the store.
    pub fn apply<'a>(&self, entries: impl Iterator<Item = &'a SignedEntry>) -> Vec<SignedEntry> {
        let matching = entries.filter(|e| self.matches(e));
        if !self.latest_only {
            return matching.cloned().collect();
        }
        let mut out: Vec<SignedEntry> = Vec::new();
        for entry in matching {
            match out.last_mut() {
                Some(last) if last.key() == entry.key() => {
                    if entry.lww_cmp(last).is_gt() {
                        *last = entry.clone();
                    }
                }
                _ => out.push(entry.clone()),
            }
        }
        out
    }
}
