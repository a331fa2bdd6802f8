//! Named strong references to blobs.
//!
//! A tag keeps its [`HashAndFormat`] alive across garbage collection runs. Tags are kept in
//! a [`redb`] database, in memory for memory nodes.

use std::{
    fmt,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use redb::{Database, ReadableTable, TableDefinition, backends::InMemoryBackend};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Hash, HashAndFormat, hash::BlobFormat};
use crate::error::{Error, Result};

/// Table: Tags
/// Key:   `&str`  # tag name
/// Value: `&[u8]` # postcard encoded HashAndFormat
const TAGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tags-0");

/// The name of a tag.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    derive_more::From,
    derive_more::Into,
)]
pub struct Tag(pub String);

impl From<&str> for Tag {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Tag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Result of adding content to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOutcome {
    /// The hash of the content.
    pub hash: Hash,
    /// The format of the content.
    pub format: BlobFormat,
    /// Size of the root blob in bytes.
    pub size: u64,
    /// The tag keeping the content alive.
    pub tag: Tag,
}

/// A tag and the content it points to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagInfo {
    /// Name of the tag.
    pub name: Tag,
    /// The tagged hash.
    pub hash: Hash,
    /// The tagged format.
    pub format: BlobFormat,
}

/// Storage for tags.
#[derive(Debug, Clone)]
pub struct Tags {
    db: Arc<Database>,
    last_auto: Arc<AtomicU64>,
}

impl Tags {
    /// Creates a tag store that lives in memory only.
    pub fn memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::new_impl(db)
    }

    /// Opens or creates a tag store at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path)?;
        Self::new_impl(db)
    }

    fn new_impl(db: Database) -> Result<Self> {
        let write_tx = db.begin_write()?;
        {
            let _table = write_tx.open_table(TAGS_TABLE)?;
        }
        write_tx.commit()?;
        Ok(Self {
            db: Arc::new(db),
            last_auto: Default::default(),
        })
    }

    /// Sets `name` to point at `value`, replacing a previous value.
    pub fn set(&self, name: &Tag, value: HashAndFormat) -> Result<()> {
        let encoded = postcard::to_stdvec(&value).map_err(Error::storage)?;
        let write_tx = self.db.begin_write()?;
        {
            let mut table = write_tx.open_table(TAGS_TABLE)?;
            table.insert(name.0.as_str(), encoded.as_slice())?;
        }
        write_tx.commit()?;
        debug!(tag = %name, hash = %value.hash.fmt_short(), "set tag");
        Ok(())
    }

    /// Creates a new, unique `auto-` tag pointing at `value`.
    pub fn create_auto(&self, value: HashAndFormat) -> Result<Tag> {
        let encoded = postcard::to_stdvec(&value).map_err(Error::storage)?;
        let write_tx = self.db.begin_write()?;
        let tag = {
            let mut table = write_tx.open_table(TAGS_TABLE)?;
            let mut micros = self.next_auto_micros();
            loop {
                let name = format!("auto-{micros}");
                if table.get(name.as_str())?.is_none() {
                    table.insert(name.as_str(), encoded.as_slice())?;
                    break Tag(name);
                }
                micros = self.next_auto_micros();
            }
        };
        write_tx.commit()?;
        Ok(tag)
    }

    /// Microseconds since the epoch, strictly increasing within this process.
    fn next_auto_micros(&self) -> u64 {
        let now = crate::docs::system_time_now();
        let mut prev = self.last_auto.load(Ordering::Relaxed);
        loop {
            let next = now.max(prev + 1);
            match self.last_auto.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    /// The value of a tag.
    pub fn get(&self, name: &Tag) -> Result<Option<HashAndFormat>> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(TAGS_TABLE)?;
        let Some(value) = table.get(name.0.as_str())? else {
            return Ok(None);
        };
        let value = postcard::from_bytes(value.value()).map_err(Error::storage)?;
        Ok(Some(value))
    }

    /// All tags, ordered by name.
    pub fn list(&self) -> Result<Vec<TagInfo>> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(TAGS_TABLE)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (name, value) = item?;
            let value: HashAndFormat =
                postcard::from_bytes(value.value()).map_err(Error::storage)?;
            out.push(TagInfo {
                name: Tag(name.value().to_string()),
                hash: value.hash,
                format: value.format,
            });
        }
        Ok(out)
    }

    /// Removes a tag. Fails with [`Error::NotFound`] if it does not exist.
    pub fn delete(&self, name: &Tag) -> Result<()> {
        let write_tx = self.db.begin_write()?;
        let removed = {
            let mut table = write_tx.open_table(TAGS_TABLE)?;
            table.remove(name.0.as_str())?.is_some()
        };
        if !removed {
            return Err(Error::not_found(format!("tag {name}")));
        }
        write_tx.commit()?;
        debug!(tag = %name, "deleted tag");
        Ok(())
    }

    /// The values of all tags.
    pub fn roots(&self) -> Result<Vec<HashAndFormat>> {
        Ok(self
            .list()?
            .into_iter()
            .map(|info| HashAndFormat {
                hash: info.hash,
                format: info.format,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn set_get_delete() -> Result<()> {
        let tags = Tags::memory()?;
        let value = HashAndFormat::raw(Hash::new(b"a"));
        let name = Tag::from("mytag");
        tags.set(&name, value)?;
        assert_eq!(tags.get(&name)?, Some(value));

        let other = HashAndFormat::hash_seq(Hash::new(b"b"));
        tags.set(&name, other)?;
        assert_eq!(tags.roots()?, vec![other]);

        tags.delete(&name)?;
        assert_eq!(tags.get(&name)?, None);
        assert!(tags.delete(&name).unwrap_err().is_not_found());
        Ok(())
    }

    #[test]
    fn auto_tags_are_unique() -> Result<()> {
        let tags = Tags::memory()?;
        let value = HashAndFormat::raw(Hash::new(b"a"));
        let a = tags.create_auto(value)?;
        let b = tags.create_auto(value)?;
        assert_ne!(a, b);
        assert!(a.0.starts_with("auto-"));
        assert_eq!(tags.list()?.len(), 2);
        Ok(())
    }

    #[test]
    fn persistent_tags_survive_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tags.redb");
        let value = HashAndFormat::raw(Hash::new(b"x"));
        Tags::persistent(&path)?.set(&Tag::from("keep"), value)?;
        assert_eq!(Tags::persistent(&path)?.get(&Tag::from("keep"))?, Some(value));
        Ok(())
    }
}
