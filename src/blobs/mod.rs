//! Content-addressed blobs: storage, tags, garbage collection and transfer.

use std::{path::Path, sync::Arc, time::Duration};

use bytes::Bytes;
use n0_future::task::AbortOnDropHandle;
use tracing::debug;

pub mod gc;
mod get;
mod hash;
pub mod metrics;
pub mod protocol;
mod provider;
mod store;
mod tags;
pub mod tree;

pub use self::{
    gc::{ExtraRoots, GcStats},
    get::{AbortReason, DownloadEvent, DownloadOptions, DownloadOutcome, DownloadProgress},
    hash::{BlobFormat, Hash, HashAndFormat, HashParseError, encode_hash_seq, parse_hash_seq},
    provider::BlobsProtocol,
    store::{BlobStatus, ImportMode, Store, TempTag},
    tags::{AddOutcome, Tag, TagInfo, Tags},
};
use self::{get::Downloader, metrics::Metrics};
use crate::{
    endpoint::Endpoint,
    error::{Error, Result},
    key::{AddrInfoOptions, EndpointAddr},
    ticket::BlobTicket,
};

/// Which tag to create when adding content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SetTagOption {
    /// A new, unique `auto-` tag.
    #[default]
    Auto,
    /// The given tag, replacing its previous value.
    Named(Tag),
}

/// The blobs API of a node. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Blobs {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    endpoint: Endpoint,
    downloader: Downloader,
    #[debug(skip)]
    extra_roots: Option<ExtraRoots>,
}

impl Blobs {
    pub(crate) fn new(
        endpoint: Endpoint,
        store: Store,
        tags: Tags,
        extra_roots: Option<ExtraRoots>,
    ) -> Self {
        let downloader = Downloader {
            endpoint: endpoint.clone(),
            store,
            tags,
            metrics: Arc::new(Metrics::default()),
        };
        Self {
            inner: Arc::new(Inner {
                endpoint,
                downloader,
                extra_roots,
            }),
        }
    }

    pub(crate) fn store(&self) -> &Store {
        &self.inner.downloader.store
    }

    fn tags(&self) -> &Tags {
        &self.inner.downloader.tags
    }

    /// Transfer and storage metrics.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.downloader.metrics
    }

    /// The handler serving our blobs to other nodes.
    pub fn protocol(&self) -> BlobsProtocol {
        BlobsProtocol::new(self.store().clone(), self.metrics().clone())
    }

    /// Adds bytes to the store under a new `auto-` tag.
    pub async fn import_bytes(&self, data: impl Into<Bytes>) -> Result<AddOutcome> {
        self.import_bytes_with_tag(data, SetTagOption::Auto).await
    }

    /// Adds bytes to the store under the given tag.
    pub async fn import_bytes_with_tag(
        &self,
        data: impl Into<Bytes>,
        tag: SetTagOption,
    ) -> Result<AddOutcome> {
        let (temp_tag, size) = self.store().import_bytes(data.into()).await?;
        self.add_outcome(temp_tag, size, tag)
    }

    /// Adds a file to the store under a new `auto-` tag.
    pub async fn import_file(&self, path: impl AsRef<Path>, mode: ImportMode) -> Result<AddOutcome> {
        self.import_file_with_tag(path, mode, SetTagOption::Auto)
            .await
    }

    /// Adds a file to the store under the given tag.
    pub async fn import_file_with_tag(
        &self,
        path: impl AsRef<Path>,
        mode: ImportMode,
        tag: SetTagOption,
    ) -> Result<AddOutcome> {
        let (temp_tag, size) = self.store().import_file(path.as_ref(), mode).await?;
        self.add_outcome(temp_tag, size, tag)
    }

    /// Adds a hash sequence of already stored blobs.
    pub async fn import_hash_seq(
        &self,
        hashes: impl IntoIterator<Item = Hash>,
        tag: SetTagOption,
    ) -> Result<AddOutcome> {
        let hashes = hashes.into_iter().collect::<Vec<_>>();
        if let Some(missing) = hashes.iter().find(|h| !self.store().has(h)) {
            return Err(Error::not_found(format!("blob {}", missing.fmt_short())));
        }
        let (temp_tag, size) = self.store().import_bytes(encode_hash_seq(hashes)).await?;
        let value = HashAndFormat::hash_seq(*temp_tag.hash());
        let tag = self.set_tag_option(tag, value)?;
        Ok(AddOutcome {
            hash: value.hash,
            format: value.format,
            size,
            tag,
        })
    }

    fn add_outcome(&self, temp_tag: TempTag, size: u64, tag: SetTagOption) -> Result<AddOutcome> {
        let value = temp_tag.hash_and_format();
        let tag = self.set_tag_option(tag, value)?;
        debug!(hash = %value.hash.fmt_short(), size, %tag, "imported");
        Ok(AddOutcome {
            hash: value.hash,
            format: value.format,
            size,
            tag,
        })
    }

    fn set_tag_option(&self, option: SetTagOption, value: HashAndFormat) -> Result<Tag> {
        match option {
            SetTagOption::Auto => self.tags().create_auto(value),
            SetTagOption::Named(tag) => {
                self.tags().set(&tag, value)?;
                Ok(tag)
            }
        }
    }

    /// Writes a blob to `dest`.
    pub async fn export_file(&self, hash: Hash, dest: impl AsRef<Path>) -> Result<()> {
        self.store().export_file(&hash, dest.as_ref()).await
    }

    /// Reads a complete blob into memory.
    pub async fn read_to_bytes(&self, hash: Hash) -> Result<Bytes> {
        self.store().read_to_bytes(&hash).await
    }

    /// Returns `true` if the complete blob is stored locally.
    pub fn has(&self, hash: Hash) -> bool {
        self.store().has(&hash)
    }

    /// The local status of a blob.
    pub fn status(&self, hash: Hash) -> BlobStatus {
        self.store().status(&hash)
    }

    /// All complete blobs.
    pub fn list(&self) -> Vec<Hash> {
        self.store().list()
    }

    /// Points tag `name` at `value`.
    pub fn tag(&self, name: impl Into<Tag>, value: impl Into<HashAndFormat>) -> Result<()> {
        let value = value.into();
        // a collection running concurrently spares hashes that were temp tagged
        let _temp = self.store().temp_tag(value);
        self.tags().set(&name.into(), value)
    }

    /// Removes a tag. The content becomes eligible for garbage collection if nothing else
    /// references it.
    pub fn delete_tag(&self, name: impl Into<Tag>) -> Result<()> {
        self.tags().delete(&name.into())
    }

    /// All tags.
    pub fn list_tags(&self) -> Result<Vec<TagInfo>> {
        self.tags().list()
    }

    /// Downloads `hash` from `providers`.
    pub fn download(
        &self,
        hash: Hash,
        providers: impl IntoIterator<Item = EndpointAddr>,
        options: DownloadOptions,
    ) -> DownloadProgress {
        self.inner
            .downloader
            .download(hash, providers.into_iter().collect(), options)
    }

    /// Downloads a single blob without creating a tag for it.
    pub(crate) fn download_untagged(&self, hash: Hash, provider: EndpointAddr) -> DownloadProgress {
        self.inner
            .downloader
            .download_untagged(hash, vec![provider], DownloadOptions::default())
    }

    /// Downloads the content of a ticket from the node it names.
    pub fn download_ticket(&self, ticket: &BlobTicket, options: DownloadOptions) -> DownloadProgress {
        let options = DownloadOptions {
            format: ticket.format(),
            ..options
        };
        self.download(ticket.hash(), [ticket.addr().clone()], options)
    }

    /// Creates a ticket for fetching a local blob from this node.
    pub fn share(
        &self,
        hash: Hash,
        format: BlobFormat,
        addr_options: AddrInfoOptions,
    ) -> Result<BlobTicket> {
        if !self.store().has(&hash) {
            return Err(Error::not_found(format!("blob {}", hash.fmt_short())));
        }
        let mut addr = self.inner.endpoint.addr();
        addr.apply_options(addr_options);
        Ok(BlobTicket::new(addr, hash, format))
    }

    /// Runs one garbage collection pass.
    pub async fn gc(&self) -> Result<GcStats> {
        gc::run_gc(
            self.store(),
            self.tags(),
            self.inner.extra_roots.as_ref(),
            self.metrics(),
        )
        .await
    }

    /// Runs garbage collection every `period`. A zero period disables it.
    pub(crate) fn spawn_gc(&self, period: Duration) -> Option<AbortOnDropHandle<()>> {
        if period.is_zero() {
            return None;
        }
        Some(gc::spawn_gc(
            self.store().clone(),
            self.tags().clone(),
            self.inner.extra_roots.clone(),
            self.metrics().clone(),
            period,
        ))
    }
}

#[cfg(test)]
mod tests {
    use iroh::RelayMode;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{endpoint::EndpointOptions, ticket::Ticket};

    async fn blobs() -> Result<Blobs> {
        let endpoint = Endpoint::bind(EndpointOptions {
            relay_mode: RelayMode::Disabled,
            discovery: false,
            ..Default::default()
        })
        .await?;
        Ok(Blobs::new(endpoint, Store::memory(), Tags::memory()?, None))
    }

    #[tokio::test]
    async fn import_export_roundtrip() -> Result<()> {
        let blobs = blobs().await?;
        let dir = tempfile::tempdir()?;
        let src = dir.path().join("in.bin");
        let data = (0..100_000u32).map(|i| i as u8).collect::<Vec<_>>();
        tokio::fs::write(&src, &data).await?;

        let added = blobs.import_file(&src, ImportMode::Copy).await?;
        assert_eq!(added.size, data.len() as u64);
        assert_eq!(added.hash, Hash::new(&data));
        assert!(added.tag.0.starts_with("auto-"));

        let dst = dir.path().join("out.bin");
        blobs.export_file(added.hash, &dst).await?;
        assert_eq!(tokio::fs::read(&dst).await?, data);

        let err = blobs
            .export_file(Hash::new(b"unknown"), &dst)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn deleting_the_tag_enables_gc() -> Result<()> {
        let blobs = blobs().await?;
        let added = blobs
            .import_bytes_with_tag(&b"hello"[..], SetTagOption::Named("greeting".into()))
            .await?;
        assert_eq!(blobs.gc().await?.deleted, 0);

        blobs.delete_tag("greeting")?;
        assert_eq!(blobs.gc().await?.deleted, 1);
        assert_eq!(blobs.status(added.hash), BlobStatus::NotFound);
        assert!(blobs.list_tags()?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn share_creates_ticket() -> Result<()> {
        let blobs = blobs().await?;
        let added = blobs.import_bytes(&b"shared"[..]).await?;
        let ticket = blobs.share(added.hash, BlobFormat::Raw, AddrInfoOptions::Id)?;
        let parsed: BlobTicket = ticket.to_string().parse()?;
        assert_eq!(parsed.hash(), added.hash);
        assert!(parsed.addr().direct_addrs.is_empty());
        assert_eq!(BlobTicket::from_bytes(&ticket.to_bytes())?, ticket);

        assert!(blobs
            .share(Hash::new(b"missing"), BlobFormat::Raw, AddrInfoOptions::Id)
            .unwrap_err()
            .is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn hash_seq_requires_children() -> Result<()> {
        let blobs = blobs().await?;
        let a = blobs.import_bytes(&b"a"[..]).await?;
        let seq = blobs
            .import_hash_seq([a.hash], SetTagOption::Named("col".into()))
            .await?;
        assert_eq!(seq.format, BlobFormat::HashSeq);
        assert_eq!(seq.size, 32);
        blobs.delete_tag(a.tag)?;
        assert_eq!(blobs.gc().await?.deleted, 0);

        let err = blobs
            .import_hash_seq([Hash::new(b"missing")], SetTagOption::Auto)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }
}
