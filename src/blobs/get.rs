//! The fetching side of blob transfer.
//!
//! A download runs on its own task and reports [`DownloadEvent`]s through a
//! [`DownloadProgress`] stream. Providers are tried in order. Each gets a bounded budget of
//! retries with exponential backoff for transient network errors. A provider that does not
//! have the blob, or sends anything that fails verification, is abandoned at once. Verified
//! chunks are kept when switching providers.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use backon::{BackoffBuilder, ExponentialBuilder};
use bytes::{Bytes, BytesMut};
use iroh::endpoint::Connection;
use n0_future::{Stream, task::AbortOnDropHandle};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, debug_span, trace, warn};

use super::{
    Hash, HashAndFormat,
    hash::{BlobFormat, parse_hash_seq},
    metrics::Metrics,
    protocol::{ALPN, MAX_CHUNK_BATCH, MAX_MESSAGE_SIZE, Request, Response},
    store::{Store, TempTag},
    tags::{Tag, Tags},
    tree::{Outboard, chunk_count, decode},
};
use crate::{
    endpoint::Endpoint,
    error::{Error, Result},
    key::EndpointAddr,
    util::{read_message, write_message},
};

/// Options for a download.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Whether to fetch a single blob or a hash sequence and all its children.
    pub format: BlobFormat,
    /// Retries per provider for transient network errors.
    pub retries: usize,
    /// Number of chunks requested at once, at most [`MAX_CHUNK_BATCH`].
    pub chunk_batch: u64,
    /// Tag to set once the download completes. An `auto-` tag is created when unset.
    pub tag: Option<Tag>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            format: BlobFormat::Raw,
            retries: 3,
            chunk_batch: 64,
            tag: None,
        }
    }
}

/// Progress of a download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadEvent {
    /// A connection to a provider was established.
    Connected,
    /// A blob was found, locally or on a provider, and its size is known.
    Found {
        /// The blob.
        hash: Hash,
        /// Its size in bytes.
        size: u64,
    },
    /// More of a blob was received and verified.
    Progress {
        /// The blob.
        hash: Hash,
        /// Verified bytes so far.
        offset: u64,
    },
    /// A blob is complete in the local store.
    Done {
        /// The blob.
        hash: Hash,
    },
    /// Everything requested is available locally.
    AllDone {
        /// Bytes written to the store.
        bytes_written: u64,
        /// Bytes read from the network.
        bytes_read: u64,
        /// Time the download took.
        elapsed: Duration,
    },
    /// The download failed.
    Aborted(AbortReason),
}

/// Why a download failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum AbortReason {
    /// Every provider failed or did not have the content.
    #[display("no providers")]
    NoProviders,
    /// The content of a hash sequence could not be parsed.
    #[display("invalid hash sequence")]
    InvalidHashSeq,
    /// The local store failed.
    #[display("storage: {_0}")]
    Storage(String),
}

/// Totals of a finished download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Bytes written to the store.
    pub bytes_written: u64,
    /// Bytes read from the network.
    pub bytes_read: u64,
    /// Time the download took.
    pub elapsed: Duration,
}

/// Stream of [`DownloadEvent`]s. Dropping it cancels the download.
#[derive(Debug)]
pub struct DownloadProgress {
    rx: mpsc::Receiver<DownloadEvent>,
    _task: AbortOnDropHandle<()>,
}

impl DownloadProgress {
    /// Drives the download to completion, ignoring intermediate events.
    pub async fn finish(mut self) -> Result<DownloadOutcome> {
        while let Some(event) = self.rx.recv().await {
            match event {
                DownloadEvent::AllDone {
                    bytes_written,
                    bytes_read,
                    elapsed,
                } => {
                    return Ok(DownloadOutcome {
                        bytes_written,
                        bytes_read,
                        elapsed,
                    });
                }
                DownloadEvent::Aborted(AbortReason::NoProviders) => {
                    return Err(Error::not_found("no provider for the requested content"));
                }
                DownloadEvent::Aborted(reason) => return Err(Error::protocol(reason)),
                _ => {}
            }
        }
        Err(Error::cancelled())
    }
}

impl Stream for DownloadProgress {
    type Item = DownloadEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Starts downloads. Cheap to clone.
#[derive(Debug, Clone)]
pub(crate) struct Downloader {
    pub(crate) endpoint: Endpoint,
    pub(crate) store: Store,
    pub(crate) tags: Tags,
    pub(crate) metrics: Arc<Metrics>,
}

impl Downloader {
    /// Downloads `hash` from `providers`.
    pub(crate) fn download(
        &self,
        hash: Hash,
        providers: Vec<EndpointAddr>,
        options: DownloadOptions,
    ) -> DownloadProgress {
        self.download_inner(hash, providers, options, true)
    }

    /// Downloads without tagging the result. The caller protects the content some other way.
    pub(crate) fn download_untagged(
        &self,
        hash: Hash,
        providers: Vec<EndpointAddr>,
        options: DownloadOptions,
    ) -> DownloadProgress {
        self.download_inner(hash, providers, options, false)
    }

    fn download_inner(
        &self,
        hash: Hash,
        providers: Vec<EndpointAddr>,
        options: DownloadOptions,
        set_tag: bool,
    ) -> DownloadProgress {
        let (tx, rx) = mpsc::channel(64);
        let me = self.endpoint.peer_id();
        let mut unique = Vec::<EndpointAddr>::with_capacity(providers.len());
        for provider in providers {
            if provider.peer_id != me && !unique.iter().any(|p| p.peer_id == provider.peer_id) {
                unique.push(provider);
            }
        }
        let value = HashAndFormat {
            hash,
            format: options.format,
        };
        let mut run = Transfer {
            ctx: self.clone(),
            providers: unique,
            options,
            set_tag,
            tx,
            bytes_read: 0,
            bytes_written: 0,
        };
        let span = debug_span!("download", hash = %hash.fmt_short());
        let task = tokio::spawn(
            async move {
                let start = Instant::now();
                let event = match run.run(value).await {
                    Ok(()) => {
                        run.ctx.metrics.downloads_success.inc();
                        DownloadEvent::AllDone {
                            bytes_written: run.bytes_written,
                            bytes_read: run.bytes_read,
                            elapsed: start.elapsed(),
                        }
                    }
                    Err(reason) => {
                        run.ctx.metrics.downloads_aborted.inc();
                        warn!(%reason, "download aborted");
                        DownloadEvent::Aborted(reason)
                    }
                };
                run.emit(event).await;
            }
            .instrument(span),
        );
        DownloadProgress {
            rx,
            _task: AbortOnDropHandle::new(task),
        }
    }
}

/// Why a single attempt at a provider failed.
#[derive(Debug)]
enum AttemptError {
    /// The network failed, the provider may succeed when retried.
    Transient(anyhow::Error),
    /// The provider cannot serve us, do not retry it.
    Abandon(String),
    /// Local failure, the whole download fails.
    Storage(Error),
}

impl From<anyhow::Error> for AttemptError {
    fn from(err: anyhow::Error) -> Self {
        AttemptError::Transient(err)
    }
}

/// A blob in flight.
#[derive(Debug)]
struct BlobState {
    hash: Hash,
    size: Option<u64>,
    chunks: Vec<Option<Bytes>>,
    verified: u64,
}

impl BlobState {
    fn next_missing(&self, from: u64) -> Option<u64> {
        (from as usize..self.chunks.len())
            .find(|i| self.chunks[*i].is_none())
            .map(|i| i as u64)
    }
}

struct Transfer {
    ctx: Downloader,
    providers: Vec<EndpointAddr>,
    options: DownloadOptions,
    set_tag: bool,
    tx: mpsc::Sender<DownloadEvent>,
    bytes_read: u64,
    bytes_written: u64,
}

impl Transfer {
    async fn emit(&self, event: DownloadEvent) {
        // the receiver going away aborts this task anyway
        self.tx.send(event).await.ok();
    }

    async fn run(&mut self, value: HashAndFormat) -> Result<(), AbortReason> {
        let root = self.fetch_blob(value.hash).await?;
        let mut children = Vec::new();
        if value.format == BlobFormat::HashSeq {
            let data = self
                .ctx
                .store
                .read_to_bytes(&value.hash)
                .await
                .map_err(|err| AbortReason::Storage(err.to_string()))?;
            let hashes = parse_hash_seq(&data).ok_or(AbortReason::InvalidHashSeq)?;
            debug!(children = hashes.len(), "fetching hash sequence children");
            for hash in hashes {
                children.push(self.fetch_blob(hash).await?);
            }
        }
        let result = match self.options.tag.clone() {
            _ if !self.set_tag => Ok(()),
            Some(tag) => self.ctx.tags.set(&tag, value),
            None => self.ctx.tags.create_auto(value).map(|_| ()),
        };
        result.map_err(|err| AbortReason::Storage(err.to_string()))?;
        drop((root, children));
        Ok(())
    }

    /// Makes `hash` available locally, returning a tag protecting it.
    async fn fetch_blob(&mut self, hash: Hash) -> Result<TempTag, AbortReason> {
        let tag = self.ctx.store.temp_tag(HashAndFormat::raw(hash));
        if let Some(outboard) = self.ctx.store.outboard(&hash) {
            trace!(hash = %hash.fmt_short(), "found locally");
            self.emit(DownloadEvent::Found {
                hash,
                size: outboard.size(),
            })
            .await;
            self.emit(DownloadEvent::Done { hash }).await;
            return Ok(tag);
        }

        let mut state = BlobState {
            hash,
            size: None,
            chunks: Vec::new(),
            verified: 0,
        };
        let providers = self.providers.clone();
        for provider in providers {
            let mut backoff = ExponentialBuilder::new()
                .with_min_delay(Duration::from_millis(50))
                .with_max_delay(Duration::from_secs(2))
                .with_jitter()
                .with_max_times(self.options.retries)
                .build();
            loop {
                match self.attempt(&provider, &mut state).await {
                    Ok(()) => return Ok(tag),
                    Err(AttemptError::Storage(err)) => {
                        self.ctx.store.clear_partial(&hash);
                        return Err(AbortReason::Storage(err.to_string()));
                    }
                    Err(AttemptError::Abandon(reason)) => {
                        debug!(remote = %provider.peer_id.fmt_short(), %reason, "abandoning provider");
                        break;
                    }
                    Err(AttemptError::Transient(err)) => match backoff.next() {
                        Some(delay) => {
                            debug!(remote = %provider.peer_id.fmt_short(), ?delay, "retrying provider: {err:#}");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            debug!(remote = %provider.peer_id.fmt_short(), "retry budget exhausted: {err:#}");
                            break;
                        }
                    },
                }
            }
        }
        self.ctx.store.clear_partial(&hash);
        Err(AbortReason::NoProviders)
    }

    async fn attempt(
        &mut self,
        provider: &EndpointAddr,
        state: &mut BlobState,
    ) -> Result<(), AttemptError> {
        let conn = self
            .ctx
            .endpoint
            .connect(provider.clone(), ALPN)
            .await
            .map_err(|err| AttemptError::Transient(err.into()))?;
        self.emit(DownloadEvent::Connected).await;

        let size = match state.size {
            Some(size) => size,
            None => {
                let size = self.request_size(&conn, state.hash).await?;
                state.chunks = vec![None; chunk_count(size) as usize];
                self.emit(DownloadEvent::Found {
                    hash: state.hash,
                    size,
                })
                .await;
                state.size = Some(size);
                size
            }
        };

        if size > 0 {
            let batch = self.options.chunk_batch.clamp(1, MAX_CHUNK_BATCH);
            let mut from = 0;
            while let Some(start) = state.next_missing(from) {
                let end = (start + batch).min(state.chunks.len() as u64);
                self.request_chunks(&conn, state, size, start, end).await?;
                from = end;
            }
        }

        let mut data = BytesMut::with_capacity(size as usize);
        for chunk in state.chunks.iter().flatten() {
            data.extend_from_slice(chunk);
        }
        let data = data.freeze();
        let hashing = data.clone();
        let outboard = tokio::task::spawn_blocking(move || Outboard::compute(&hashing))
            .await
            .map_err(|err| AttemptError::Storage(Error::storage(err)))?;
        if outboard.root() != state.hash {
            // only reachable for the empty blob, everything else was verified while decoding
            self.ctx.metrics.chunks_corrupt.inc();
            state.chunks.fill(None);
            state.verified = 0;
            return Err(AttemptError::Abandon("content does not match hash".into()));
        }
        let (_tag, size) = self
            .ctx
            .store
            .insert_complete(outboard, data)
            .await
            .map_err(AttemptError::Storage)?;
        self.bytes_written += size;
        self.emit(DownloadEvent::Done { hash: state.hash }).await;
        Ok(())
    }

    async fn request_size(&mut self, conn: &Connection, hash: Hash) -> Result<u64, AttemptError> {
        let (mut send, mut recv) = conn.open_bi().await.map_err(anyhow::Error::from)?;
        let mut buf = BytesMut::new();
        write_message(&mut send, &mut buf, &Request::Size { hash }, MAX_MESSAGE_SIZE).await?;
        send.finish().map_err(anyhow::Error::from)?;
        let response = read_message::<Response>(&mut recv, &mut buf, MAX_MESSAGE_SIZE)
            .await?
            .ok_or_else(|| anyhow::anyhow!("stream closed before size"))?;
        match response {
            Response::Size { size } => {
                self.bytes_read += 8;
                Ok(size)
            }
            Response::NotFound => Err(AttemptError::Abandon("not found".into())),
            Response::Encoded { .. } => Err(AttemptError::Abandon("unexpected chunks".into())),
        }
    }

    async fn request_chunks(
        &mut self,
        conn: &Connection,
        state: &mut BlobState,
        size: u64,
        start: u64,
        end: u64,
    ) -> Result<(), AttemptError> {
        let (mut send, mut recv) = conn.open_bi().await.map_err(anyhow::Error::from)?;
        let mut buf = BytesMut::new();
        let request = Request::Chunks {
            hash: state.hash,
            start,
            end,
        };
        write_message(&mut send, &mut buf, &request, MAX_MESSAGE_SIZE).await?;
        send.finish().map_err(anyhow::Error::from)?;
        let response = read_message::<Response>(&mut recv, &mut buf, MAX_MESSAGE_SIZE)
            .await?
            .ok_or_else(|| anyhow::anyhow!("stream closed before chunks arrived"))?;
        let encoded = match response {
            Response::Encoded { data } => data,
            Response::NotFound => return Err(AttemptError::Abandon("not found".into())),
            Response::Size { .. } => {
                return Err(AttemptError::Abandon("unexpected size".into()));
            }
        };
        self.bytes_read += encoded.len() as u64;
        let chunks = match decode(state.hash, size, start, end, &encoded) {
            Ok(chunks) => chunks,
            Err(err) => {
                self.ctx.metrics.chunks_corrupt.inc();
                return Err(AttemptError::Abandon(format!(
                    "chunks {start}..{end} failed verification: {err}"
                )));
            }
        };
        let mut expected = start;
        for (index, data) in chunks {
            if index != expected {
                self.ctx.metrics.chunks_corrupt.inc();
                return Err(AttemptError::Abandon(format!(
                    "got chunk {index}, expected {expected}"
                )));
            }
            expected += 1;
            let slot = &mut state.chunks[index as usize];
            if slot.is_none() {
                state.verified += data.len() as u64;
                self.ctx.metrics.bytes_received.inc_by(data.len() as u64);
                *slot = Some(data);
            }
            self.ctx.store.set_partial(state.hash, state.verified);
            self.emit(DownloadEvent::Progress {
                hash: state.hash,
                offset: state.verified,
            })
            .await;
        }
        if expected != end {
            return Err(AttemptError::Abandon(format!(
                "got {} of {} chunks",
                expected - start,
                end - start
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use iroh::RelayMode;
    use n0_future::{StreamExt, boxed::BoxFuture};
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        blobs::{provider::BlobsProtocol, tree::CHUNK_SIZE},
        endpoint::EndpointOptions,
        protocol::{ProtocolHandler, Router},
    };

    fn local() -> EndpointOptions {
        EndpointOptions {
            relay_mode: RelayMode::Disabled,
            discovery: false,
            ..Default::default()
        }
    }

    async fn provider(store: Store) -> Result<Router> {
        let endpoint = Endpoint::bind(local()).await?;
        let handler = BlobsProtocol::new(store, Default::default());
        Ok(Router::builder(endpoint).accept(ALPN, handler).spawn())
    }

    async fn downloader() -> Result<Downloader> {
        Ok(Downloader {
            endpoint: Endpoint::bind(local()).await?,
            store: Store::memory(),
            tags: Tags::memory()?,
            metrics: Default::default(),
        })
    }

    fn test_data(len: usize) -> Bytes {
        (0..len).map(|i| (i / 3 % 253) as u8).collect::<Vec<_>>().into()
    }

    /// How a misbehaving provider answers chunk requests.
    #[derive(Debug, Clone, Copy)]
    enum Fault {
        /// Flips the last bit of every response.
        FlipBit,
        /// Answers every request with the first requested chunk, once per requested chunk.
        ReplayFirst,
    }

    /// Serves the correct size but bad chunks.
    #[derive(Debug, Clone)]
    struct Misbehaving(Store, Fault);

    impl ProtocolHandler for Misbehaving {
        fn accept(&self, connection: Connection) -> BoxFuture<anyhow::Result<()>> {
            let Misbehaving(store, fault) = self.clone();
            Box::pin(async move {
                while let Ok((mut send, mut recv)) = connection.accept_bi().await {
                    let mut buf = BytesMut::new();
                    let Some(request) = read_message::<Request>(&mut recv, &mut buf, 1024).await?
                    else {
                        continue;
                    };
                    let response = match request {
                        Request::Size { hash } => Response::Size {
                            size: store
                                .outboard(&hash)
                                .ok_or_else(|| anyhow::anyhow!("missing"))?
                                .size(),
                        },
                        Request::Chunks { hash, start, end } => {
                            let data = match fault {
                                Fault::FlipBit => {
                                    let mut data =
                                        store.encode_chunks(&hash, start, end).await?.to_vec();
                                    let last = data.len() - 1;
                                    data[last] ^= 1;
                                    data
                                }
                                Fault::ReplayFirst => {
                                    let first = store.encode_chunks(&hash, start, start + 1).await?;
                                    first.repeat((end - start) as usize)
                                }
                            };
                            Response::Encoded { data: data.into() }
                        }
                    };
                    write_message(&mut send, &mut buf, &response, MAX_MESSAGE_SIZE).await?;
                    send.finish()?;
                }
                Ok(())
            })
        }
    }

    async fn falls_back_from(fault: Fault) -> Result<()> {
        let store = Store::memory();
        let data = test_data(CHUNK_SIZE * 2 + 1);
        let (tag, _) = store.import_bytes(data.clone()).await?;

        let bad_ep = Endpoint::bind(local()).await?;
        let bad = Router::builder(bad_ep)
            .accept(ALPN, Misbehaving(store.clone(), fault))
            .spawn();
        let good = provider(store).await?;

        let getter = downloader().await?;
        let providers = vec![bad.endpoint().addr(), good.endpoint().addr()];
        let outcome = getter
            .download(*tag.hash(), providers, Default::default())
            .finish()
            .await?;
        assert_eq!(outcome.bytes_written, data.len() as u64);
        assert!(getter.metrics.chunks_corrupt.get() >= 1);
        assert_eq!(getter.store.read_to_bytes(tag.hash()).await?, data);

        bad.shutdown().await?;
        good.shutdown().await?;
        getter.endpoint.close().await;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn downloads_and_verifies() -> Result<()> {
        let store = Store::memory();
        let data = test_data(CHUNK_SIZE * 3 + 5);
        let (tag, _) = store.import_bytes(data.clone()).await?;
        let router = provider(store).await?;

        let getter = downloader().await?;
        let options = DownloadOptions {
            chunk_batch: 2,
            ..Default::default()
        };
        let events = getter
            .download(*tag.hash(), vec![router.endpoint().addr()], options)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(events.first(), Some(&DownloadEvent::Connected));
        assert!(events.contains(&DownloadEvent::Found {
            hash: *tag.hash(),
            size: data.len() as u64
        }));
        assert!(events.contains(&DownloadEvent::Progress {
            hash: *tag.hash(),
            offset: data.len() as u64
        }));
        match events.last() {
            Some(DownloadEvent::AllDone { bytes_written, .. }) => {
                assert_eq!(*bytes_written, data.len() as u64)
            }
            other => panic!("unexpected final event {other:?}"),
        }
        assert_eq!(getter.store.read_to_bytes(tag.hash()).await?, data);
        assert_eq!(getter.tags.list()?.len(), 1);

        router.shutdown().await?;
        getter.endpoint.close().await;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn corrupt_provider_is_abandoned() -> Result<()> {
        falls_back_from(Fault::FlipBit).await
    }

    #[tokio::test]
    #[traced_test]
    async fn replayed_chunks_are_rejected() -> Result<()> {
        falls_back_from(Fault::ReplayFirst).await
    }

    #[tokio::test]
    #[traced_test]
    async fn empty_blob_downloads() -> Result<()> {
        let store = Store::memory();
        let (tag, _) = store.import_bytes(Bytes::new()).await?;
        assert_eq!(*tag.hash(), Hash::new(b""));
        let router = provider(store).await?;

        let getter = downloader().await?;
        let outcome = getter
            .download(*tag.hash(), vec![router.endpoint().addr()], Default::default())
            .finish()
            .await?;
        assert_eq!(outcome.bytes_written, 0);
        assert_eq!(
            getter.store.status(tag.hash()),
            crate::blobs::BlobStatus::Complete { size: 0 }
        );

        router.shutdown().await?;
        getter.endpoint.close().await;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn aborts_without_providers() -> Result<()> {
        let router = provider(Store::memory()).await?;
        let getter = downloader().await?;
        let hash = Hash::new(b"nobody has this");

        let events = getter
            .download(hash, vec![router.endpoint().addr()], Default::default())
            .collect::<Vec<_>>()
            .await;
        assert_eq!(
            events.last(),
            Some(&DownloadEvent::Aborted(AbortReason::NoProviders))
        );
        assert_eq!(getter.store.status(&hash), crate::blobs::BlobStatus::NotFound);

        let err = getter
            .download(hash, vec![], Default::default())
            .finish()
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        router.shutdown().await?;
        getter.endpoint.close().await;
        Ok(())
    }
}
