//! Content-addressed blob storage.
//!
//! A blob is stored as its data plus its [`Outboard`], the tree hashes needed to verify
//! ranges of the data. The memory store keeps both in memory. The file store keeps
//! `<hash>.data` and `<hash>.obao` files in its directory, or a `<hash>.ref` file with the
//! path of an external file for blobs imported by reference.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::{
    hash::{Hash, HashAndFormat},
    tree::Outboard,
};
use crate::error::{Error, Result};

/// How [`Store::import_file`] treats the source file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImportMode {
    /// Copy the data into the store.
    #[default]
    Copy,
    /// Reference the file where it is, if the store supports it.
    ///
    /// The file is never moved or written to. If it changes afterwards, reads of the blob
    /// fail verification. Keeping the file unchanged is the caller's responsibility.
    TryReference,
}

/// What the store knows about a hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobStatus {
    /// The blob is complete.
    Complete {
        /// Size in bytes.
        size: u64,
    },
    /// A download of the blob is in progress.
    Partial {
        /// Verified bytes so far.
        size: u64,
    },
    /// The blob is not known.
    NotFound,
}

#[derive(Debug, Clone)]
enum Data {
    Memory(Bytes),
    File(PathBuf),
    External(PathBuf),
}

#[derive(Debug)]
struct Entry {
    outboard: Outboard,
    data: Data,
}

/// Per-hash protection counts.
///
/// Hashes with a non-zero count are live for garbage collection. While a collection runs,
/// every hash whose count changes is remembered and spared by the sweep, so content that is
/// tagged and released between mark and sweep survives.
#[derive(Debug, Default)]
pub(crate) struct Protected(Mutex<ProtectedState>);

#[derive(Debug, Default)]
struct ProtectedState {
    counts: BTreeMap<Hash, usize>,
    touched: Option<BTreeSet<Hash>>,
}

impl ProtectedState {
    fn touch(&mut self, hash: Hash) {
        if let Some(touched) = self.touched.as_mut() {
            touched.insert(hash);
        }
    }

    fn is_live(&self, hash: &Hash) -> bool {
        self.counts.contains_key(hash) || self.touched.as_ref().is_some_and(|t| t.contains(hash))
    }
}

impl Protected {
    fn inc(&self, hash: Hash) {
        let mut state = self.0.lock();
        *state.counts.entry(hash).or_default() += 1;
        state.touch(hash);
    }

    fn dec(&self, hash: &Hash) {
        let mut state = self.0.lock();
        if let Some(count) = state.counts.get_mut(hash) {
            *count -= 1;
            if *count == 0 {
                state.counts.remove(hash);
            }
        }
        state.touch(*hash);
    }
}

/// A running garbage collection. Only one exists per store at a time.
#[derive(Debug)]
pub(crate) struct GcEpoch {
    protected: Arc<Protected>,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl Drop for GcEpoch {
    fn drop(&mut self) {
        self.protected.0.lock().touched = None;
    }
}

/// A hash that is protected from garbage collection while this value is alive.
#[derive(Debug)]
pub struct TempTag {
    value: HashAndFormat,
    protected: Option<Arc<Protected>>,
}

impl TempTag {
    fn new(value: HashAndFormat, protected: Option<Arc<Protected>>) -> Self {
        if let Some(p) = protected.as_ref() {
            p.inc(value.hash);
        }
        Self { value, protected }
    }

    /// The protected hash.
    pub fn hash(&self) -> &Hash {
        &self.value.hash
    }

    /// The protected hash and format.
    pub fn hash_and_format(&self) -> HashAndFormat {
        self.value
    }

    /// Stops protecting the hash without waiting for the tag to be dropped.
    pub fn leak(mut self) {
        if let Some(p) = self.protected.take() {
            p.dec(&self.value.hash);
        }
    }
}

impl Clone for TempTag {
    fn clone(&self) -> Self {
        Self::new(self.value, self.protected.clone())
    }
}

impl Drop for TempTag {
    fn drop(&mut self) {
        if let Some(p) = self.protected.as_ref() {
            p.dec(&self.value.hash);
        }
    }
}

/// Blob storage, in memory or in a directory.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    dir: Option<PathBuf>,
    entries: RwLock<BTreeMap<Hash, Arc<Entry>>>,
    partial: RwLock<BTreeMap<Hash, u64>>,
    protected: Arc<Protected>,
    gc_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Store {
    /// Creates an empty in-memory store.
    pub fn memory() -> Self {
        Self::with_dir(None, BTreeMap::new())
    }

    /// Opens the store in `dir`, loading the blobs already there.
    pub async fn persistent(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        let mut entries = BTreeMap::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(item) = read_dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("obao") {
                continue;
            }
            match load_entry(&path).await {
                Ok(Some((hash, entry))) => {
                    entries.insert(hash, Arc::new(entry));
                }
                Ok(None) => debug!(path = %path.display(), "skipping incomplete blob"),
                Err(err) => warn!(path = %path.display(), "failed to load blob: {err:#}"),
            }
        }
        debug!(dir = %dir.display(), blobs = entries.len(), "opened blob store");
        Ok(Self::with_dir(Some(dir), entries))
    }

    fn with_dir(dir: Option<PathBuf>, entries: BTreeMap<Hash, Arc<Entry>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                dir,
                entries: RwLock::new(entries),
                partial: Default::default(),
                protected: Default::default(),
                gc_lock: Default::default(),
            }),
        }
    }

    /// Protects `value` from garbage collection until the returned tag is dropped.
    pub fn temp_tag(&self, value: HashAndFormat) -> TempTag {
        TempTag::new(value, Some(self.inner.protected.clone()))
    }

    /// Hashes currently protected by a [`TempTag`].
    pub(crate) fn protected_hashes(&self) -> BTreeSet<Hash> {
        self.inner.protected.0.lock().counts.keys().copied().collect()
    }

    /// Starts a garbage collection, waiting for a running one to finish first.
    ///
    /// Until the returned epoch is dropped, [`Self::delete`] also spares every hash whose
    /// temp tags changed since this call.
    pub(crate) async fn begin_gc(&self) -> GcEpoch {
        let guard = self.inner.gc_lock.clone().lock_owned().await;
        self.inner.protected.0.lock().touched = Some(BTreeSet::new());
        GcEpoch {
            protected: self.inner.protected.clone(),
            _guard: guard,
        }
    }

    /// Imports bytes, returning a tag protecting the new blob and its size.
    ///
    /// Importing bytes that are already present is a no-op apart from the returned tag.
    pub async fn import_bytes(&self, data: Bytes) -> Result<(TempTag, u64)> {
        let hashing = data.clone();
        let outboard = tokio::task::spawn_blocking(move || Outboard::compute(&hashing))
            .await
            .map_err(|err| Error::storage(err))?;
        self.insert_complete(outboard, data).await
    }

    /// Imports a file.
    ///
    /// The file is hashed while streaming it, so its size is not bounded by memory unless
    /// the store itself is in memory.
    pub async fn import_file(&self, path: &Path, mode: ImportMode) -> Result<(TempTag, u64)> {
        let Some(dir) = self.inner.dir.clone() else {
            return self.import_bytes(tokio::fs::read(path).await?.into()).await;
        };
        match mode {
            ImportMode::TryReference => {
                let path = tokio::fs::canonicalize(path).await?;
                let outboard = hash_file(path.clone()).await?;
                let path_str = path.to_str().ok_or_else(|| {
                    Error::storage(format!("{} is not valid unicode", path.display()))
                })?;
                let hash = outboard.root();
                let tag = self.temp_tag(HashAndFormat::raw(hash));
                if self.has(&hash) {
                    return Ok((tag, outboard.size()));
                }
                write_atomic(&file_path(&dir, &hash, "ref"), path_str.as_bytes()).await?;
                Ok((tag, self.insert_entry(outboard, Data::External(path)).await?))
            }
            ImportMode::Copy => {
                let temp = dir.join(format!("import-{:016x}.tmp", rand::random::<u64>()));
                tokio::fs::copy(path, &temp).await?;
                let outboard = match hash_file(temp.clone()).await {
                    Ok(outboard) => outboard,
                    Err(err) => {
                        tokio::fs::remove_file(&temp).await.ok();
                        return Err(err);
                    }
                };
                let hash = outboard.root();
                let tag = self.temp_tag(HashAndFormat::raw(hash));
                if self.has(&hash) {
                    tokio::fs::remove_file(&temp).await?;
                    return Ok((tag, outboard.size()));
                }
                let data_path = file_path(&dir, &hash, "data");
                tokio::fs::rename(&temp, &data_path).await?;
                Ok((tag, self.insert_entry(outboard, Data::File(data_path)).await?))
            }
        }
    }

    /// Stores a complete, already hashed blob.
    pub(crate) async fn insert_complete(
        &self,
        outboard: Outboard,
        data: Bytes,
    ) -> Result<(TempTag, u64)> {
        let hash = outboard.root();
        let size = outboard.size();
        if size != data.len() as u64 {
            return Err(Error::verification(format!(
                "blob {} has {} bytes, expected {size}",
                hash.fmt_short(),
                data.len()
            )));
        }
        let tag = self.temp_tag(HashAndFormat::raw(hash));
        if self.has(&hash) {
            trace!(hash = %hash.fmt_short(), "blob already present");
            return Ok((tag, size));
        }
        let data = match self.inner.dir.as_ref() {
            None => Data::Memory(data),
            Some(dir) => {
                let path = file_path(dir, &hash, "data");
                write_atomic(&path, &data).await?;
                Data::File(path)
            }
        };
        self.insert_entry(outboard, data).await?;
        Ok((tag, size))
    }

    /// Records a blob whose data is in place, returning its size.
    async fn insert_entry(&self, outboard: Outboard, data: Data) -> Result<u64> {
        let hash = outboard.root();
        let size = outboard.size();
        if let Some(dir) = self.inner.dir.as_ref() {
            // the outboard goes last, it marks the blob as complete on reload
            write_atomic(&file_path(dir, &hash, "obao"), &outboard.to_bytes()).await?;
        }
        self.inner
            .entries
            .write()
            .insert(hash, Arc::new(Entry { outboard, data }));
        self.inner.partial.write().remove(&hash);
        debug!(hash = %hash.fmt_short(), size, "stored blob");
        Ok(size)
    }

    /// Returns `true` if the complete blob is present.
    pub fn has(&self, hash: &Hash) -> bool {
        self.inner.entries.read().contains_key(hash)
    }

    /// The status of a hash.
    pub fn status(&self, hash: &Hash) -> BlobStatus {
        if let Some(entry) = self.inner.entries.read().get(hash) {
            return BlobStatus::Complete {
                size: entry.outboard.size(),
            };
        }
        match self.inner.partial.read().get(hash) {
            Some(size) => BlobStatus::Partial { size: *size },
            None => BlobStatus::NotFound,
        }
    }

    pub(crate) fn set_partial(&self, hash: Hash, verified: u64) {
        if !self.has(&hash) {
            self.inner.partial.write().insert(hash, verified);
        }
    }

    pub(crate) fn clear_partial(&self, hash: &Hash) {
        self.inner.partial.write().remove(hash);
    }

    /// All complete blobs.
    pub fn list(&self) -> Vec<Hash> {
        self.inner.entries.read().keys().copied().collect()
    }

    /// The outboard of a complete blob.
    pub fn outboard(&self, hash: &Hash) -> Option<Outboard> {
        self.entry(hash).map(|e| e.outboard.clone())
    }

    fn entry(&self, hash: &Hash) -> Option<Arc<Entry>> {
        self.inner.entries.read().get(hash).cloned()
    }

    fn get(&self, hash: &Hash) -> Result<Arc<Entry>> {
        self.entry(hash)
            .ok_or_else(|| Error::not_found(format!("blob {}", hash.fmt_short())))
    }

    /// Reads a complete blob into memory.
    pub async fn read_to_bytes(&self, hash: &Hash) -> Result<Bytes> {
        let entry = self.get(hash)?;
        match &entry.data {
            Data::Memory(bytes) => Ok(bytes.clone()),
            Data::File(path) => Ok(tokio::fs::read(path).await?.into()),
            Data::External(path) => {
                let data = Bytes::from(tokio::fs::read(path).await?);
                let (checked, outboard) = (data.clone(), entry.outboard.clone());
                let valid = tokio::task::spawn_blocking(move || outboard.verify(&checked))
                    .await
                    .map_err(|err| Error::storage(err))?;
                if !valid {
                    return Err(Error::verification(format!(
                        "referenced file {} changed after import",
                        path.display()
                    )));
                }
                Ok(data)
            }
        }
    }

    /// Encodes chunks `start..end` of a complete blob for transfer, see [`Outboard::encode`].
    pub(crate) async fn encode_chunks(&self, hash: &Hash, start: u64, end: u64) -> Result<Bytes> {
        let entry = self.get(hash)?;
        tokio::task::spawn_blocking(move || {
            let encoded = match &entry.data {
                Data::Memory(bytes) => entry.outboard.encode(&bytes[..], start, end)?,
                Data::File(path) | Data::External(path) => {
                    entry.outboard.encode(std::fs::File::open(path)?, start, end)?
                }
            };
            Ok(Bytes::from(encoded))
        })
        .await
        .map_err(|err| Error::storage(err))?
    }

    /// Writes a complete blob to `dest`.
    pub async fn export_file(&self, hash: &Hash, dest: &Path) -> Result<()> {
        let _tag = self.temp_tag(HashAndFormat::raw(*hash));
        let data = self.read_to_bytes(hash).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &data).await?;
        Ok(())
    }

    /// Deletes the given blobs, skipping protected ones.
    ///
    /// Returns the hashes that were removed.
    pub(crate) async fn delete(&self, hashes: impl IntoIterator<Item = Hash>) -> Result<Vec<Hash>> {
        let removed = {
            // Hold the protection lock so no temp tag can appear for a hash being removed.
            let protected = self.inner.protected.0.lock();
            let mut entries = self.inner.entries.write();
            hashes
                .into_iter()
                .filter(|hash| !protected.is_live(hash))
                .filter_map(|hash| entries.remove(&hash).map(|entry| (hash, entry)))
                .collect::<Vec<_>>()
        };
        if let Some(dir) = self.inner.dir.as_ref() {
            for (hash, _) in &removed {
                for ext in ["obao", "data", "ref"] {
                    match tokio::fs::remove_file(file_path(dir, hash, ext)).await {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }
        Ok(removed.into_iter().map(|(hash, _)| hash).collect())
    }
}

fn file_path(dir: &Path, hash: &Hash, ext: &str) -> PathBuf {
    dir.join(format!("{}.{ext}", hash.to_hex()))
}

async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Hashes a file on a blocking thread without reading it into memory.
async fn hash_file(path: PathBuf) -> Result<Outboard> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&path)?;
        let size = file.metadata()?.len();
        Ok(Outboard::from_reader(std::io::BufReader::new(file), size)?)
    })
    .await
    .map_err(|err| Error::storage(err))?
}

async fn load_entry(obao: &Path) -> Result<Option<(Hash, Entry)>> {
    let corrupt = || Error::storage(format!("corrupt outboard {}", obao.display()));
    let hash = obao
        .file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.parse::<Hash>().ok())
        .ok_or_else(corrupt)?;
    let bytes = tokio::fs::read(obao).await?;
    let outboard = Outboard::from_bytes(hash, &bytes).ok_or_else(corrupt)?;
    let data_path = obao.with_extension("data");
    let ref_path = obao.with_extension("ref");
    let data = if tokio::fs::try_exists(&data_path).await? {
        Data::File(data_path)
    } else if tokio::fs::try_exists(&ref_path).await? {
        let target = tokio::fs::read_to_string(&ref_path).await?;
        Data::External(PathBuf::from(target))
    } else {
        return Ok(None);
    };
    Ok(Some((hash, Entry { outboard, data })))
}
