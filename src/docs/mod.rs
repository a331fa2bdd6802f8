//! Multi-writer key-value documents that sync between nodes.
//!
//! A document is a set of signed entries in a namespace. Every entry is written by an
//! [`Author`] to a key, and points to its value by content hash. The value itself is a blob.
//! For a key, the entry with the greatest timestamp wins, ties are broken by author and then
//! content hash. All other entries stay in the set and can be queried.
//!
//! Documents sync through set reconciliation with named peers and through a gossip swarm
//! per document, see [`Doc::start_sync`]. Values of remote entries are downloaded lazily
//! from the peer that announced them.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use bytes::Bytes;
use iroh::endpoint::Connection;
use n0_future::boxed::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use self::engine::Engine;
use crate::{
    blobs::{Blobs, Hash},
    endpoint::Endpoint,
    error::{Error, PermissionSnafu, Result},
    gossip::Gossip,
    key::{AddrInfoOptions, EndpointAddr},
    protocol::ProtocolHandler,
    ticket::DocTicket,
};

mod engine;
mod entry;
mod keys;
pub mod metrics;
mod net;
mod query;
mod ranger;
mod state;
mod store;

pub use self::{
    engine::{LiveEvent, SyncDetails, SyncEvent},
    entry::{Entry, MAX_TIMESTAMP_FUTURE_SHIFT, Record, RecordIdentifier, SignedEntry},
    keys::{Author, AuthorId, Capability, CapabilityKind, KeyParseError, NamespaceId, NamespaceSecret},
    net::{AbortReason, SYNC_ALPN},
    query::{KeyFilter, Query},
    state::{Origin, RESYNC_INTERVAL, SyncReason},
    store::Store,
};
pub(crate) use self::{entry::system_time_now, keys::base32};
use self::metrics::Metrics;

/// Whether the content of an entry is available on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum ContentStatus {
    /// Fully available.
    Complete,
    /// Partially available.
    Incomplete,
    /// Not available.
    Missing,
}

/// Looks up the [`ContentStatus`] of a hash in the local blob store.
pub type ContentStatusCallback = Arc<dyn Fn(Hash) -> ContentStatus + Send + Sync + 'static>;

/// Which capability a [`DocTicket`] grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum ShareMode {
    /// Read access.
    Read,
    /// Write access.
    Write,
}

/// The documents API of a node. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Docs {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    endpoint: Endpoint,
    blobs: Blobs,
    store: Store,
    engine: Engine,
    metrics: Arc<Metrics>,
    /// Timestamp of the last local insert, in microseconds.
    last_timestamp: AtomicU64,
}

impl Docs {
    /// Starts the live engine. Creates a default author if the store has none.
    pub(crate) fn spawn(endpoint: Endpoint, gossip: Gossip, blobs: Blobs, store: Store) -> Result<Self> {
        if store.get_default_author()?.is_none() {
            let author = store.new_author(&mut rand::rngs::OsRng)?;
            store.set_default_author(author.id())?;
            debug!(author = %author.id().fmt_short(), "created default author");
        }
        let metrics = Arc::new(Metrics::default());
        let engine = Engine::spawn(
            endpoint.clone(),
            gossip,
            blobs.clone(),
            store.clone(),
            metrics.clone(),
        );
        Ok(Self {
            inner: Arc::new(Inner {
                endpoint,
                blobs,
                store,
                engine,
                metrics,
                last_timestamp: AtomicU64::new(0),
            }),
        })
    }

    /// Metrics of the documents and their sync.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    pub(crate) fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Creates a new document we hold the write capability for.
    pub async fn create(&self) -> Result<Doc> {
        let id = self.inner.store.new_namespace(&mut rand::rngs::OsRng)?;
        Ok(self.doc(id))
    }

    /// Opens a document that is known to this node.
    pub async fn open(&self, id: NamespaceId) -> Result<Option<Doc>> {
        Ok(self
            .inner
            .store
            .get_capability(&id)?
            .map(|_| self.doc(id)))
    }

    /// Imports a capability. A write capability upgrades a known read-only document.
    pub async fn import_namespace(&self, capability: Capability) -> Result<Doc> {
        let id = capability.id();
        self.inner.store.import_namespace(capability)?;
        Ok(self.doc(id))
    }

    /// Imports the document of a ticket and starts to sync it with the peers it names.
    pub async fn import(&self, ticket: DocTicket) -> Result<Doc> {
        let DocTicket { capability, nodes } = ticket;
        let doc = self.import_namespace(capability).await?;
        doc.start_sync(nodes).await?;
        Ok(doc)
    }

    /// Like [`Self::import`], but subscribes to the document before the sync starts.
    pub async fn join_and_subscribe(
        &self,
        ticket: DocTicket,
    ) -> Result<(Doc, ReceiverStream<LiveEvent>)> {
        let DocTicket { capability, nodes } = ticket;
        let doc = self.import_namespace(capability).await?;
        let events = doc.subscribe().await?;
        doc.start_sync(nodes).await?;
        Ok((doc, events))
    }

    /// Lists the documents of this node.
    pub fn list(&self) -> Result<Vec<(NamespaceId, CapabilityKind)>> {
        self.inner.store.list_namespaces()
    }

    /// Stops syncing a document and deletes it with all its entries.
    pub async fn drop_doc(&self, id: NamespaceId) -> Result<()> {
        self.inner.engine.leave(id, true).await?;
        self.inner.store.remove_namespace(&id)
    }

    /// Creates a new author.
    pub fn author_create(&self) -> Result<AuthorId> {
        Ok(self.inner.store.new_author(&mut rand::rngs::OsRng)?.id())
    }

    /// Lists the authors of this node.
    pub fn author_list(&self) -> Result<Vec<AuthorId>> {
        self.inner.store.list_authors()
    }

    /// The default author of this node.
    pub fn author_default(&self) -> Result<AuthorId> {
        self.inner
            .store
            .get_default_author()?
            .ok_or_else(|| Error::not_found("default author"))
    }

    /// Makes a known author the default.
    pub fn author_set_default(&self, author: AuthorId) -> Result<()> {
        self.inner.store.set_default_author(author)
    }

    /// Exports the secret key of an author.
    pub fn author_export(&self, author: AuthorId) -> Result<Option<Author>> {
        self.inner.store.get_author(&author)
    }

    /// Imports an author from its secret key.
    pub fn author_import(&self, author: Author) -> Result<AuthorId> {
        let id = author.id();
        self.inner.store.import_author(author)?;
        Ok(id)
    }

    /// Deletes an author. The default author cannot be deleted.
    pub fn author_delete(&self, author: AuthorId) -> Result<()> {
        if self.inner.store.get_default_author()? == Some(author) {
            return Err(PermissionSnafu {
                message: "the default author cannot be deleted",
            }
            .build());
        }
        self.inner.store.delete_author(&author)
    }

    /// Leaves all documents and stops the live engine.
    pub async fn shutdown(&self) {
        self.inner.engine.shutdown().await
    }

    fn doc(&self, id: NamespaceId) -> Doc {
        Doc {
            id,
            docs: self.clone(),
        }
    }

    /// A timestamp for a local insert, strictly greater than the previous one.
    fn next_timestamp(&self) -> u64 {
        let now = system_time_now();
        let (Ok(prev) | Err(prev)) =
            self.inner
                .last_timestamp
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                    Some(now.max(last + 1))
                });
        now.max(prev + 1)
    }
}

impl ProtocolHandler for Docs {
    fn accept(&self, conn: Connection) -> BoxFuture<anyhow::Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            this.inner.engine.handle_connection(conn).await?;
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<()> {
        let this = self.clone();
        Box::pin(async move { this.shutdown().await })
    }
}

/// Handle to a document.
#[derive(Debug, Clone)]
pub struct Doc {
    id: NamespaceId,
    docs: Docs,
}

impl Doc {
    /// The document id.
    pub fn id(&self) -> NamespaceId {
        self.id
    }

    /// Stores `value` as a blob and sets `key` to it.
    ///
    /// Returns the hash of the value.
    pub async fn set(
        &self,
        author: AuthorId,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<Hash> {
        let (tag, len) = self
            .docs
            .inner
            .blobs
            .store()
            .import_bytes(value.into())
            .await?;
        let hash = *tag.hash();
        self.insert(author, key.into(), hash, len).await?;
        // From here on the entry keeps the content alive.
        drop(tag);
        Ok(hash)
    }

    /// Sets `key` to content that is already known by hash and size.
    pub async fn set_hash(
        &self,
        author: AuthorId,
        key: impl Into<Bytes>,
        hash: Hash,
        size: u64,
    ) -> Result<()> {
        self.insert(author, key.into(), hash, size).await
    }

    async fn insert(&self, author: AuthorId, key: Bytes, hash: Hash, len: u64) -> Result<()> {
        let namespace = self.secret()?;
        let author = self
            .docs
            .inner
            .store
            .get_author(&author)?
            .ok_or_else(|| Error::not_found(format!("author {}", author.fmt_short())))?;
        let record = Record::new(hash, len, self.docs.next_timestamp());
        let entry = SignedEntry::from_parts(&namespace, &author, key, record);
        self.docs.inner.store.insert_entry(entry.clone())?;
        self.docs.inner.engine.local_insert(entry).await
    }

    /// The entry that wins among those matching `query`, if any.
    pub async fn get_one(&self, query: Query) -> Result<Option<SignedEntry>> {
        let entries = self.get_many(query).await?;
        Ok(entries.into_iter().max_by(|a, b| a.lww_cmp(b)))
    }

    /// All entries matching `query`, ordered by key, then author.
    pub async fn get_many(&self, query: Query) -> Result<Vec<SignedEntry>> {
        self.docs.inner.store.get_many(self.id, &query)
    }

    /// Reads the value of an entry. Fails with [`Error::NotFound`] if it was not downloaded yet.
    pub async fn read_to_bytes(&self, entry: &SignedEntry) -> Result<Bytes> {
        self.docs.inner.blobs.read_to_bytes(entry.content_hash()).await
    }

    /// Creates a ticket to share the document, and makes it available for sync.
    pub async fn share(&self, mode: ShareMode, addr_options: AddrInfoOptions) -> Result<DocTicket> {
        let capability = match mode {
            ShareMode::Read => Capability::Read(self.id),
            ShareMode::Write => Capability::Write(self.secret()?),
        };
        self.start_sync(vec![]).await?;
        let mut addr = self.docs.inner.endpoint.addr();
        addr.apply_options(addr_options);
        Ok(DocTicket::new(capability, vec![addr]))
    }

    /// Starts to sync with `peers` and the gossip swarm of the document.
    pub async fn start_sync(&self, peers: Vec<EndpointAddr>) -> Result<()> {
        self.docs.inner.engine.start_sync(self.id, peers).await
    }

    /// Stops syncing. Subscriptions stay open.
    pub async fn leave(&self) -> Result<()> {
        self.docs.inner.engine.leave(self.id, false).await
    }

    /// Subscribes to events of the document.
    pub async fn subscribe(&self) -> Result<ReceiverStream<LiveEvent>> {
        let events = self.docs.inner.engine.subscribe(self.id).await?;
        Ok(ReceiverStream::new(events))
    }

    fn secret(&self) -> Result<NamespaceSecret> {
        let capability = self
            .docs
            .inner
            .store
            .get_capability(&self.id)?
            .ok_or_else(|| Error::not_found(format!("document {}", self.id.fmt_short())))?;
        match capability.secret_key() {
            Some(secret) => Ok(secret.clone()),
            None => Err(PermissionSnafu {
                message: "document is read-only",
            }
            .build()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use iroh::RelayMode;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::{blobs::Tags, endpoint::EndpointOptions};

    async fn setup() -> Result<Docs> {
        let endpoint = Endpoint::bind(EndpointOptions {
            relay_mode: RelayMode::Disabled,
            discovery: false,
            ..Default::default()
        })
        .await?;
        let gossip = Gossip::spawn(endpoint.clone(), Default::default());
        let blobs = Blobs::new(
            endpoint.clone(),
            crate::blobs::Store::memory(),
            Tags::memory()?,
            None,
        );
        Docs::spawn(endpoint, gossip, blobs, Store::memory()?)
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn set_and_get() -> Result<()> {
        let docs = setup().await?;
        let author = docs.author_default()?;
        let doc = docs.create().await?;
        let mut events = doc.subscribe().await?;

        let hash = doc.set(author, "greeting", "hi").await?;
        let entry = doc
            .get_one(Query::key_exact("greeting"))
            .await?
            .expect("entry exists");
        assert_eq!(entry.content_hash(), hash);
        assert_eq!(doc.read_to_bytes(&entry).await?, Bytes::from_static(b"hi"));
        assert_eq!(
            events.next().await,
            Some(LiveEvent::InsertLocal {
                entry: entry.clone()
            })
        );

        // A later write by the same author wins, the earlier one stays in the history.
        doc.set(author, "greeting", "hello").await?;
        let latest = doc.get_many(Query::key_exact("greeting")).await?;
        assert_eq!(latest.len(), 1);
        assert_eq!(doc.read_to_bytes(&latest[0]).await?, Bytes::from_static(b"hello"));
        let history = doc
            .get_many(Query::key_exact("greeting").latest_only(false))
            .await?;
        assert_eq!(history.len(), 2);
        docs.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn idle_subscriber_does_not_stall_writes() -> Result<()> {
        let docs = setup().await?;
        let author = docs.author_default()?;
        let doc = docs.create().await?;
        // never polled while writing
        let mut events = doc.subscribe().await?;

        let writes = async {
            for i in 0..1000u32 {
                doc.set(author, format!("key/{i}"), i.to_string()).await?;
            }
            Ok::<_, Error>(())
        };
        tokio::time::timeout(Duration::from_secs(30), writes)
            .await
            .expect("writes stalled")?;

        assert_eq!(doc.get_many(Query::key_prefix("key/")).await?.len(), 1000);

        // drain what was queued, the next event reports the gap
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(100), events.next()).await
        {}
        doc.set(author, "after", "drain").await?;
        assert_eq!(events.next().await, Some(LiveEvent::Lagged));
        assert!(matches!(events.next().await, Some(LiveEvent::InsertLocal { .. })));
        docs.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn timestamps_are_monotonic() -> Result<()> {
        let docs = setup().await?;
        let mut last = 0;
        for _ in 0..100 {
            let ts = docs.next_timestamp();
            assert!(ts > last);
            last = ts;
        }
        Ok(())
    }

    #[tokio::test]
    async fn read_only_documents_refuse_writes() -> Result<()> {
        let docs = setup().await?;
        let author = docs.author_default()?;
        let id = NamespaceSecret::new(&mut rand::rngs::OsRng).id();
        let doc = docs.import_namespace(Capability::Read(id)).await?;
        let err = doc.set(author, "key", "value").await.unwrap_err();
        assert!(matches!(err, Error::Permission { .. }));
        assert!(doc.share(ShareMode::Write, AddrInfoOptions::Id).await.is_err());
        assert!(docs.author_delete(author).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn authors_round_trip() -> Result<()> {
        let docs = setup().await?;
        let created = docs.author_create()?;
        let secret = docs.author_export(created)?.expect("author exists");
        docs.author_delete(created)?;
        assert!(!docs.author_list()?.contains(&created));
        assert_eq!(docs.author_import(secret)?, created);
        docs.author_set_default(created)?;
        assert_eq!(docs.author_default()?, created);
        Ok(())
    }
}
