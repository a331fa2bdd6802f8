//! The live engine keeps open documents in sync.
//!
//! For every document that syncs, the engine joins a gossip topic derived from the namespace.
//! Local inserts are broadcast on it, and entries received from the topic are inserted. When
//! a peer joins the swarm, or is named explicitly, a full set reconciliation runs over
//! [`SYNC_ALPN`](super::net::SYNC_ALPN). Content of remote entries is downloaded from the peer
//! that announced it.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::SystemTime,
};

use anyhow::Context as _;
use futures_util::FutureExt;
use iroh::endpoint::Connection;
use n0_future::task::AbortOnDropHandle;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinSet,
};
use tokio_stream::{StreamExt, StreamMap};
use tracing::{Instrument, Span, debug, error, error_span, info, instrument, trace, warn};

use super::{
    ContentStatus, ContentStatusCallback, NamespaceId, SignedEntry,
    entry::validate_remote,
    metrics::Metrics,
    net::{
        AbortReason, AcceptError, AcceptOutcome, ConnectError, SyncFinished, connect_and_sync,
        handle_connection,
    },
    state::{NamespaceStates, Origin, SyncReason},
    store::Store,
};
use crate::{
    blobs::{BlobStatus, Blobs, DownloadOutcome, Hash},
    endpoint::Endpoint,
    error::{Error, Result},
    gossip::{DeliveryScope, Gossip, GossipEvent, GossipReceiver, GossipSender, TopicId},
    key::{EndpointAddr, PeerId},
};

/// Capacity of the actor inbox.
const ACTOR_CHANNEL_CAP: usize = 64;
/// Capacity of the event channel of each subscriber.
pub(crate) const SUBSCRIBE_CHANNEL_CAP: usize = 256;

/// An operation broadcast on the gossip topic of a document.
#[derive(Debug, Clone, Serialize, Deserialize, strum::Display)]
enum Op {
    /// A new entry was inserted into the document.
    Put(SignedEntry),
    /// A peer now has content available for a hash.
    ContentReady(Hash),
}

/// Events of a live document.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
pub enum LiveEvent {
    /// An entry was inserted on this node.
    InsertLocal {
        /// The inserted entry.
        entry: SignedEntry,
    },
    /// An entry was received from a peer.
    InsertRemote {
        /// The peer that sent us the entry.
        from: PeerId,
        /// The inserted entry.
        entry: SignedEntry,
        /// Whether the peer reported to have the content.
        content_status: ContentStatus,
    },
    /// The content of an entry was downloaded and is now available at the local node.
    ContentReady {
        /// The content hash of the newly available entry content.
        hash: Hash,
    },
    /// We have a new neighbor in the swarm.
    NeighborUp(PeerId),
    /// We lost a neighbor in the swarm.
    NeighborDown(PeerId),
    /// A set reconciliation finished.
    SyncFinished(SyncEvent),
    /// Events were dropped because the subscriber did not keep up.
    ///
    /// Entries are still in the store, query the document to catch up.
    Lagged,
    /// All pending content is now ready.
    ///
    /// Only emitted after a sync completed and [`Self::SyncFinished`] was emitted at least
    /// once. It signals that all downloads queued until then are done, successfully or not.
    PendingContentReady,
}

/// Event emitted when a sync operation completes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEvent {
    /// Peer we synced with
    pub peer: PeerId,
    /// Origin of the sync exchange
    pub origin: Origin,
    /// Timestamp when the sync started
    pub started: SystemTime,
    /// Timestamp when the sync finished
    pub finished: SystemTime,
    /// Result of the sync operation
    pub result: std::result::Result<SyncDetails, String>,
}

/// Entry counts of a finished sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncDetails {
    /// Number of entries received
    pub entries_received: usize,
    /// Number of entries sent
    pub entries_sent: usize,
}

impl From<&SyncFinished> for SyncDetails {
    fn from(value: &SyncFinished) -> Self {
        Self {
            entries_received: value.outcome.num_recv,
            entries_sent: value.outcome.num_sent,
        }
    }
}

/// Messages to the live actor
#[derive(derive_more::Debug, strum::Display)]
enum ToLiveActor {
    StartSync {
        namespace: NamespaceId,
        peers: Vec<EndpointAddr>,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<Result<()>>,
    },
    Leave {
        namespace: NamespaceId,
        kill_subscribers: bool,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<()>,
    },
    Subscribe {
        namespace: NamespaceId,
        #[debug("sender")]
        sender: mpsc::Sender<LiveEvent>,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<()>,
    },
    LocalInsert {
        entry: SignedEntry,
    },
    HandleConnection {
        conn: Connection,
    },
    AcceptSyncRequest {
        namespace: NamespaceId,
        peer: PeerId,
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<AcceptOutcome>,
    },
    Shutdown {
        #[debug("oneshot::Sender")]
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the live actor. Cheap to clone.
#[derive(Debug, Clone)]
pub(crate) struct Engine {
    inner: Arc<EngineInner>,
}

#[derive(derive_more::Debug)]
struct EngineInner {
    to_actor_tx: mpsc::Sender<ToLiveActor>,
    #[debug(skip)]
    _actor_handle: AbortOnDropHandle<()>,
}

impl Engine {
    /// Spawns the live actor.
    pub(crate) fn spawn(
        endpoint: Endpoint,
        gossip: Gossip,
        blobs: Blobs,
        store: Store,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (to_actor_tx, inbox) = mpsc::channel(ACTOR_CHANNEL_CAP);
        let me = endpoint.peer_id();
        let actor = LiveActor::new(
            endpoint,
            gossip,
            blobs,
            store,
            metrics,
            inbox,
            to_actor_tx.clone(),
        );
        let task = tokio::task::spawn(
            actor
                .run()
                .instrument(error_span!("docs", me = %me.fmt_short())),
        );
        Self {
            inner: Arc::new(EngineInner {
                to_actor_tx,
                _actor_handle: AbortOnDropHandle::new(task),
            }),
        }
    }

    /// Starts to sync a document with the given peers, in addition to the swarm.
    pub(crate) async fn start_sync(
        &self,
        namespace: NamespaceId,
        peers: Vec<EndpointAddr>,
    ) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(ToLiveActor::StartSync {
            namespace,
            peers,
            reply,
        })
        .await?;
        reply_rx.await.map_err(|_| Error::cancelled())?
    }

    /// Stops syncing a document.
    pub(crate) async fn leave(&self, namespace: NamespaceId, kill_subscribers: bool) -> Result<()> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(ToLiveActor::Leave {
            namespace,
            kill_subscribers,
            reply,
        })
        .await?;
        reply_rx.await.map_err(|_| Error::cancelled())
    }

    /// Subscribes to the events of a document.
    pub(crate) async fn subscribe(
        &self,
        namespace: NamespaceId,
    ) -> Result<mpsc::Receiver<LiveEvent>> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBE_CHANNEL_CAP);
        let (reply, reply_rx) = oneshot::channel();
        self.send(ToLiveActor::Subscribe {
            namespace,
            sender,
            reply,
        })
        .await?;
        reply_rx.await.map_err(|_| Error::cancelled())?;
        Ok(receiver)
    }

    /// Announces an entry that was inserted into the local store.
    pub(crate) async fn local_insert(&self, entry: SignedEntry) -> Result<()> {
        self.send(ToLiveActor::LocalInsert { entry }).await
    }

    /// Hands an inbound sync connection to the actor.
    pub(crate) async fn handle_connection(&self, conn: Connection) -> Result<()> {
        self.send(ToLiveActor::HandleConnection { conn }).await
    }

    /// Leaves all documents and stops the actor. Calling it again does nothing.
    pub(crate) async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .inner
            .to_actor_tx
            .send(ToLiveActor::Shutdown { reply })
            .await
            .is_ok()
        {
            done.await.ok();
        }
    }

    async fn send(&self, msg: ToLiveActor) -> Result<()> {
        self.inner
            .to_actor_tx
            .send(msg)
            .await
            .map_err(|_| Error::cancelled())
    }
}

type SyncConnectRes = (
    NamespaceId,
    PeerId,
    SyncReason,
    std::result::Result<SyncFinished, ConnectError>,
);
type SyncAcceptRes = std::result::Result<SyncFinished, AcceptError>;
type DownloadRes = (NamespaceId, Hash, Result<DownloadOutcome>);

struct LiveActor {
    /// Receiver for actor messages.
    inbox: mpsc::Receiver<ToLiveActor>,
    /// Send messages to self.
    /// Only clone into newly spawned tasks, the actor loop itself must not send to it.
    sync_actor_tx: mpsc::Sender<ToLiveActor>,
    endpoint: Endpoint,
    gossip: Gossip,
    blobs: Blobs,
    store: Store,
    content_status: ContentStatusCallback,
    metrics: Arc<Metrics>,

    /// Sending halves of the gossip topics of syncing documents.
    topics: HashMap<NamespaceId, GossipSender>,
    /// Events of the gossip topics of syncing documents.
    gossip_events: StreamMap<NamespaceId, GossipReceiver>,

    /// Running sync futures (from connect).
    running_sync_connect: JoinSet<SyncConnectRes>,
    /// Running sync futures (from accept).
    running_sync_accept: JoinSet<SyncAcceptRes>,
    /// Running download futures.
    download_tasks: JoinSet<DownloadRes>,
    /// Content hashes which are wanted but not yet queued because no provider was found.
    missing_hashes: HashSet<Hash>,
    /// Content hashes currently being downloaded.
    queued_hashes: QueuedHashes,

    /// Subscribers to actor events
    subscribers: SubscribersMap,

    /// Sync state per document and peer
    state: NamespaceStates,
}

impl LiveActor {
    fn new(
        endpoint: Endpoint,
        gossip: Gossip,
        blobs: Blobs,
        store: Store,
        metrics: Arc<Metrics>,
        inbox: mpsc::Receiver<ToLiveActor>,
        sync_actor_tx: mpsc::Sender<ToLiveActor>,
    ) -> Self {
        let blob_store = blobs.store().clone();
        let content_status: ContentStatusCallback =
            Arc::new(move |hash| match blob_store.status(&hash) {
                BlobStatus::Complete { .. } => ContentStatus::Complete,
                BlobStatus::Partial { .. } => ContentStatus::Incomplete,
                BlobStatus::NotFound => ContentStatus::Missing,
            });
        Self {
            inbox,
            sync_actor_tx,
            endpoint,
            gossip,
            blobs,
            store,
            content_status,
            metrics,
            topics: Default::default(),
            gossip_events: Default::default(),
            running_sync_connect: Default::default(),
            running_sync_accept: Default::default(),
            download_tasks: Default::default(),
            missing_hashes: Default::default(),
            queued_hashes: Default::default(),
            subscribers: Default::default(),
            state: Default::default(),
        }
    }

    /// Run the actor loop.
    async fn run(mut self) {
        let shutdown_reply = self.run_inner().await;
        self.shutdown().await;
        // Release the stores before confirming, so they can be reopened right away.
        drop(self);
        match shutdown_reply {
            Ok(reply) => {
                reply.send(()).ok();
            }
            Err(err) => error!("docs actor failed: {err:#}"),
        }
    }

    async fn run_inner(&mut self) -> anyhow::Result<oneshot::Sender<()>> {
        let mut i = 0;
        loop {
            i += 1;
            trace!(?i, "tick wait");
            self.metrics.doc_live_tick_main.inc();
            tokio::select! {
                biased;
                msg = self.inbox.recv() => {
                    let msg = msg.context("to_actor closed")?;
                    trace!(?i, %msg, "tick: to_actor");
                    match msg {
                        ToLiveActor::Shutdown { reply } => {
                            break Ok(reply);
                        }
                        msg => self.on_actor_message(msg).await,
                    }
                }
                Some((namespace, event)) = self.gossip_events.next(), if !self.gossip_events.is_empty() => {
                    trace!(?i, "tick: gossip_event");
                    self.metrics.doc_live_tick_gossip_event.inc();
                    self.on_gossip_event(namespace, event).await;
                }
                Some(res) = self.running_sync_connect.join_next(), if !self.running_sync_connect.is_empty() => {
                    trace!(?i, "tick: running_sync_connect");
                    let (namespace, peer, reason, res) = res.context("running_sync_connect closed")?;
                    self.on_sync_via_connect_finished(namespace, peer, reason, res).await;
                }
                Some(res) = self.running_sync_accept.join_next(), if !self.running_sync_accept.is_empty() => {
                    trace!(?i, "tick: running_sync_accept");
                    let res = res.context("running_sync_accept closed")?;
                    self.on_sync_via_accept_finished(res).await;
                }
                Some(res) = self.download_tasks.join_next(), if !self.download_tasks.is_empty() => {
                    trace!(?i, "tick: pending_downloads");
                    self.metrics.doc_live_tick_pending_downloads.inc();
                    let (namespace, hash, res) = res.context("pending_downloads closed")?;
                    self.on_download_ready(namespace, hash, res).await;
                }
            }
        }
    }

    async fn on_actor_message(&mut self, msg: ToLiveActor) {
        match msg {
            ToLiveActor::Shutdown { .. } => {
                unreachable!("handled in run");
            }
            ToLiveActor::StartSync {
                namespace,
                peers,
                reply,
            } => {
                let res = self.start_sync(namespace, peers).await;
                reply.send(res).ok();
            }
            ToLiveActor::Leave {
                namespace,
                kill_subscribers,
                reply,
            } => {
                self.leave(namespace, kill_subscribers).await;
                reply.send(()).ok();
            }
            ToLiveActor::Subscribe {
                namespace,
                sender,
                reply,
            } => {
                self.subscribers.subscribe(namespace, sender);
                reply.send(()).ok();
            }
            ToLiveActor::LocalInsert { entry } => {
                self.on_local_insert(entry).await;
            }
            ToLiveActor::HandleConnection { conn } => {
                self.handle_connection(conn);
            }
            ToLiveActor::AcceptSyncRequest {
                namespace,
                peer,
                reply,
            } => {
                let outcome = self.accept_sync_request(namespace, peer);
                reply.send(outcome).ok();
            }
        }
    }

    #[instrument("connect", skip_all, fields(peer = %peer.fmt_short(), namespace = %namespace.fmt_short()))]
    fn sync_with_peer(&mut self, namespace: NamespaceId, peer: PeerId, reason: SyncReason) {
        if peer == self.endpoint.peer_id() {
            return;
        }
        if !self.state.start_connect(&namespace, peer, reason) {
            return;
        }
        let endpoint = self.endpoint.clone();
        let store = self.store.clone();
        let content_status = self.content_status.clone();
        let fut = async move {
            let res = connect_and_sync(
                &endpoint,
                &store,
                &content_status,
                namespace,
                EndpointAddr::new(peer),
            )
            .await;
            (namespace, peer, reason, res)
        }
        .instrument(Span::current());
        self.running_sync_connect.spawn(fut);
    }

    async fn shutdown(&mut self) {
        // cancel all subscriptions
        self.subscribers.clear();
        for (_, sender) in self.topics.drain() {
            sender.cancel().await.ok();
        }
        self.gossip_events = StreamMap::new();
        self.running_sync_connect.abort_all();
        self.running_sync_accept.abort_all();
        self.download_tasks.abort_all();
    }

    async fn start_sync(&mut self, namespace: NamespaceId, peers: Vec<EndpointAddr>) -> Result<()> {
        debug!(namespace = %namespace.fmt_short(), peers = peers.len(), "start sync");
        if self.store.get_capability(&namespace)?.is_none() {
            return Err(Error::not_found(format!(
                "document {}",
                namespace.fmt_short()
            )));
        }
        self.state.insert(namespace);
        self.join_peers(namespace, peers).await
    }

    async fn leave(&mut self, namespace: NamespaceId, kill_subscribers: bool) {
        if self.state.remove(&namespace) {
            debug!(namespace = %namespace.fmt_short(), "leave");
            if let Some(sender) = self.topics.remove(&namespace) {
                sender.cancel().await.ok();
            }
            self.gossip_events.remove(&namespace);
        }
        if kill_subscribers {
            self.subscribers.remove(&namespace);
        }
    }

    async fn join_peers(&mut self, namespace: NamespaceId, peers: Vec<EndpointAddr>) -> Result<()> {
        let me = self.endpoint.peer_id();
        let mut peer_ids = Vec::with_capacity(peers.len());
        // add addresses of peers to our endpoint address book
        for peer in peers {
            if peer.peer_id == me {
                continue;
            }
            peer_ids.push(peer.peer_id);
            if !peer.is_empty() {
                self.endpoint.add_known_addr(peer);
            }
        }

        match self.topics.get(&namespace) {
            Some(sender) => {
                if !peer_ids.is_empty() {
                    sender.join_peers(peer_ids.clone()).await?;
                }
            }
            None => {
                let topic = TopicId::from_bytes(namespace.to_bytes());
                let (sender, receiver) = self
                    .gossip
                    .subscribe(topic, peer_ids.clone())
                    .await?
                    .split();
                self.topics.insert(namespace, sender);
                self.gossip_events.insert(namespace, receiver);
            }
        }

        // trigger initial sync with initial peers
        for peer in peer_ids {
            self.sync_with_peer(namespace, peer, SyncReason::DirectJoin);
        }
        Ok(())
    }

    #[instrument("connect", skip_all, fields(peer = %peer.fmt_short(), namespace = %namespace.fmt_short()))]
    async fn on_sync_via_connect_finished(
        &mut self,
        namespace: NamespaceId,
        peer: PeerId,
        reason: SyncReason,
        result: std::result::Result<SyncFinished, ConnectError>,
    ) {
        match result {
            Err(ConnectError::RemoteAbort(AbortReason::AlreadySyncing)) => {
                debug!(?reason, "remote abort, already syncing");
                // The remote runs its own sync with us, it will report through accept.
                self.state.abort_connect(&namespace, peer, reason);
            }
            res => {
                match &res {
                    Ok(_) => self.metrics.sync_via_connect_success.inc(),
                    Err(_) => self.metrics.sync_via_connect_failure.inc(),
                };
                self.on_sync_finished(
                    namespace,
                    peer,
                    Origin::Connect(reason),
                    res.map_err(anyhow::Error::from),
                )
                .await
            }
        }
    }

    #[instrument("accept", skip_all, fields(peer = %fmt_accept_peer(&res), namespace = %fmt_accept_namespace(&res)))]
    async fn on_sync_via_accept_finished(&mut self, res: SyncAcceptRes) {
        match res {
            Ok(state) => {
                self.metrics.sync_via_accept_success.inc();
                self.on_sync_finished(state.namespace, state.peer, Origin::Accept, Ok(state))
                    .await
            }
            Err(AcceptError::Abort { reason, .. }) => {
                // Our own sync with the peer is in progress, or we do not sync the document.
                debug!(%reason, "aborted by us");
            }
            Err(err) => {
                self.metrics.sync_via_accept_failure.inc();
                if let (Some(peer), Some(namespace)) = (err.peer(), err.namespace()) {
                    self.on_sync_finished(
                        namespace,
                        peer,
                        Origin::Accept,
                        Err(anyhow::Error::from(err)),
                    )
                    .await;
                } else {
                    debug!(%err, "failed before reading the first message");
                }
            }
        }
    }

    async fn on_sync_finished(
        &mut self,
        namespace: NamespaceId,
        peer: PeerId,
        origin: Origin,
        result: anyhow::Result<SyncFinished>,
    ) {
        let result_for_event = match &result {
            Ok(details) => Ok(details.into()),
            Err(err) => Err(format!("{err:#}")),
        };
        match result {
            Err(err) => {
                warn!(?origin, "sync failed: {err:#}");
            }
            Ok(details) => {
                info!(
                    sent = %details.outcome.num_sent,
                    recv = %details.outcome.num_recv,
                    t_connect = ?details.timings.connect,
                    t_process = ?details.timings.process,
                    "sync finished",
                );
                for (entry, content_status) in details.inserted {
                    self.on_remote_insert(namespace, peer, entry, content_status)
                        .await;
                }
            }
        }

        let success = result_for_event.is_ok();
        let Some((started, resync)) = self.state.finish(&namespace, peer, &origin, success) else {
            return;
        };

        let ev = SyncEvent {
            peer,
            origin,
            result: result_for_event,
            finished: SystemTime::now(),
            started,
        };
        self.subscribers.send(&namespace, LiveEvent::SyncFinished(ev));

        // With downloads still queued for the document, PendingContentReady is emitted once
        // the last of them is done. Otherwise it is emitted right away.
        if self.queued_hashes.contains_namespace(&namespace) {
            self.state.set_may_emit_ready(&namespace, true);
        } else {
            self.subscribers.send(&namespace, LiveEvent::PendingContentReady);
            self.state.set_may_emit_ready(&namespace, false);
        }

        if resync {
            self.sync_with_peer(namespace, peer, SyncReason::Resync);
        }
    }

    async fn broadcast_neighbors(&self, namespace: NamespaceId, op: &Op) {
        let Some(sender) = self.topics.get(&namespace) else {
            return;
        };
        let msg = match postcard::to_stdvec(op) {
            Ok(msg) => msg,
            Err(err) => {
                error!(?err, %op, "failed to serialize message");
                return;
            }
        };
        if let Err(err) = sender.broadcast_neighbors(msg).await {
            warn!(namespace = %namespace.fmt_short(), %op, "failed to broadcast to neighbors: {err:#}");
        }
    }

    async fn on_local_insert(&mut self, entry: SignedEntry) {
        let namespace = entry.namespace();
        debug!(namespace = %namespace.fmt_short(), "local insert");
        self.metrics.new_entries_local.inc();
        self.metrics
            .new_entries_local_size
            .inc_by(entry.content_len());
        if let Some(sender) = self.topics.get(&namespace) {
            let op = Op::Put(entry.clone());
            match postcard::to_stdvec(&op) {
                Ok(msg) => {
                    if let Err(err) = sender.broadcast(msg).await {
                        warn!(namespace = %namespace.fmt_short(), "failed to broadcast entry: {err:#}");
                    }
                }
                Err(err) => error!(?err, "failed to serialize entry"),
            }
        }
        self.subscribers.send(&namespace, LiveEvent::InsertLocal { entry });
    }

    /// Handles an entry that a peer gave us and that was new to our store.
    async fn on_remote_insert(
        &mut self,
        namespace: NamespaceId,
        from: PeerId,
        entry: SignedEntry,
        content_status: ContentStatus,
    ) {
        self.metrics.new_entries_remote.inc();
        self.metrics
            .new_entries_remote_size
            .inc_by(entry.content_len());
        let hash = entry.content_hash();
        self.subscribers
            .send(
                &namespace,
                LiveEvent::InsertRemote {
                    from,
                    entry,
                    content_status,
                },
            );
        if matches!(content_status, ContentStatus::Complete) {
            self.start_download(namespace, hash, from, false).await;
        } else if !self.blobs.has(hash) {
            self.missing_hashes.insert(hash);
        }
    }

    async fn on_gossip_event(&mut self, namespace: NamespaceId, event: GossipEvent) {
        if !self.state.is_syncing(&namespace) {
            return;
        }
        match event {
            GossipEvent::PeerJoined(peer) => {
                debug!(peer = %peer.fmt_short(), namespace = %namespace.fmt_short(), "neighbor up");
                self.sync_with_peer(namespace, peer, SyncReason::NewNeighbor);
                self.subscribers.send(&namespace, LiveEvent::NeighborUp(peer));
            }
            GossipEvent::PeerLeft(peer) => {
                debug!(peer = %peer.fmt_short(), namespace = %namespace.fmt_short(), "neighbor down");
                self.subscribers.send(&namespace, LiveEvent::NeighborDown(peer));
            }
            GossipEvent::MessageReceived {
                from,
                content,
                delivered_via,
                scope,
            } => {
                let op: Op = match postcard::from_bytes(&content) {
                    Ok(op) => op,
                    Err(err) => {
                        warn!(peer = %delivered_via.fmt_short(), ?err, "invalid gossip message");
                        return;
                    }
                };
                match op {
                    Op::Put(entry) => {
                        // If the entry came straight from its sender, that peer has the content.
                        let direct = matches!(scope, DeliveryScope::Neighbors) || from == delivered_via;
                        let content_status = match direct {
                            true => ContentStatus::Complete,
                            false => ContentStatus::Missing,
                        };
                        self.on_gossip_put(namespace, delivered_via, entry, content_status)
                            .await;
                    }
                    Op::ContentReady(hash) => {
                        self.start_download(namespace, hash, delivered_via, true)
                            .await;
                    }
                }
            }
            GossipEvent::Lagged => {
                warn!(namespace = %namespace.fmt_short(), "gossip subscription lagged, entries will arrive with the next sync");
            }
            GossipEvent::Error(err) => {
                debug!(namespace = %namespace.fmt_short(), %err, "gossip error");
            }
        }
    }

    async fn on_gossip_put(
        &mut self,
        namespace: NamespaceId,
        from: PeerId,
        entry: SignedEntry,
        content_status: ContentStatus,
    ) {
        debug!(peer = %from.fmt_short(), namespace = %namespace.fmt_short(), "received entry via gossip");
        if let Err(err) = validate_remote(namespace, &entry) {
            warn!(peer = %from.fmt_short(), "rejected entry from gossip: {err}");
            return;
        }
        match self.store.insert_entry(entry.clone()) {
            Ok(true) => {
                self.on_remote_insert(namespace, from, entry, content_status)
                    .await
            }
            Ok(false) => trace!("entry already known"),
            Err(err) => warn!("failed to insert entry: {err:#}"),
        }
    }

    async fn on_download_ready(
        &mut self,
        namespace: NamespaceId,
        hash: Hash,
        res: Result<DownloadOutcome>,
    ) {
        let (waiting, completed_namespaces) = self.queued_hashes.remove_hash(&hash);
        debug!(namespace = %namespace.fmt_short(), success = res.is_ok(), completed_namespaces = completed_namespaces.len(), "download ready");
        match res {
            Ok(_) => {
                for namespace in waiting {
                    self.subscribers.send(&namespace, LiveEvent::ContentReady { hash });
                    // Inform our neighbors that we have new content ready.
                    self.broadcast_neighbors(namespace, &Op::ContentReady(hash))
                        .await;
                }
            }
            Err(err) => {
                debug!(hash = %hash.fmt_short(), "download failed: {err:#}");
                self.missing_hashes.insert(hash);
            }
        }
        for namespace in completed_namespaces.iter() {
            if let Some(true) = self.state.may_emit_ready(namespace) {
                self.subscribers.send(namespace, LiveEvent::PendingContentReady);
                self.state.set_may_emit_ready(namespace, false);
            }
        }
    }

    async fn start_download(
        &mut self,
        namespace: NamespaceId,
        hash: Hash,
        peer: PeerId,
        only_if_missing: bool,
    ) {
        if self.blobs.has(hash) {
            self.missing_hashes.remove(&hash);
            return;
        }
        if self.queued_hashes.contains_hash(&hash) {
            self.queued_hashes.insert(hash, namespace);
        } else if !only_if_missing || self.missing_hashes.contains(&hash) {
            debug!(hash = %hash.fmt_short(), peer = %peer.fmt_short(), "queue download");
            let progress = self.blobs.download_untagged(hash, EndpointAddr::new(peer));
            self.queued_hashes.insert(hash, namespace);
            self.missing_hashes.remove(&hash);
            self.download_tasks
                .spawn(async move { (namespace, hash, progress.finish().await) });
        }
    }

    #[instrument("accept", skip_all)]
    fn handle_connection(&mut self, conn: Connection) {
        let to_actor_tx = self.sync_actor_tx.clone();
        let accept_request_cb = move |namespace, peer| {
            async move {
                let (reply_tx, reply_rx) = oneshot::channel();
                to_actor_tx
                    .send(ToLiveActor::AcceptSyncRequest {
                        namespace,
                        peer,
                        reply: reply_tx,
                    })
                    .await
                    .ok();
                match reply_rx.await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        warn!("accept request callback failed to retrieve reply from actor: {err:?}");
                        AcceptOutcome::Reject(AbortReason::InternalServerError)
                    }
                }
            }
            .boxed()
        };
        debug!("incoming connection");
        let store = self.store.clone();
        let content_status = self.content_status.clone();
        self.running_sync_accept.spawn(
            async move { handle_connection(store, content_status, conn, accept_request_cb).await }
                .instrument(Span::current()),
        );
    }

    fn accept_sync_request(&mut self, namespace: NamespaceId, peer: PeerId) -> AcceptOutcome {
        self.state
            .accept_request(&self.endpoint.peer_id(), &namespace, peer)
    }
}

#[derive(Debug, Default)]
struct SubscribersMap(HashMap<NamespaceId, Subscribers>);

impl SubscribersMap {
    fn subscribe(&mut self, namespace: NamespaceId, sender: mpsc::Sender<LiveEvent>) {
        self.0.entry(namespace).or_default().subscribe(sender);
    }

    fn send(&mut self, namespace: &NamespaceId, event: LiveEvent) -> bool {
        debug!(namespace = %namespace.fmt_short(), %event, "emit event");
        let Some(subscribers) = self.0.get_mut(namespace) else {
            return false;
        };

        if !subscribers.send(event) {
            self.0.remove(namespace);
        }
        true
    }

    fn remove(&mut self, namespace: &NamespaceId) {
        self.0.remove(namespace);
    }

    fn clear(&mut self) {
        self.0.clear();
    }
}

#[derive(Debug, Default)]
struct QueuedHashes {
    by_hash: HashMap<Hash, HashSet<NamespaceId>>,
    by_namespace: HashMap<NamespaceId, HashSet<Hash>>,
}

impl QueuedHashes {
    fn insert(&mut self, hash: Hash, namespace: NamespaceId) {
        self.by_hash.entry(hash).or_default().insert(namespace);
        self.by_namespace.entry(namespace).or_default().insert(hash);
    }

    /// Removes a hash from the set of queued hashes.
    ///
    /// Returns the namespaces that waited for it, and those of them that have no queued hashes
    /// left.
    fn remove_hash(&mut self, hash: &Hash) -> (Vec<NamespaceId>, Vec<NamespaceId>) {
        let namespaces = self.by_hash.remove(hash).unwrap_or_default();
        let mut removed_namespaces = vec![];
        for namespace in namespaces.iter() {
            if let Some(hashes) = self.by_namespace.get_mut(namespace) {
                hashes.remove(hash);
                if hashes.is_empty() {
                    self.by_namespace.remove(namespace);
                    removed_namespaces.push(*namespace);
                }
            }
        }
        (namespaces.into_iter().collect(), removed_namespaces)
    }

    fn contains_hash(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    fn contains_namespace(&self, namespace: &NamespaceId) -> bool {
        self.by_namespace.contains_key(namespace)
    }
}

#[derive(Debug)]
struct Subscriber {
    sender: mpsc::Sender<LiveEvent>,
    lagged: bool,
}

impl Subscriber {
    /// Queues `event` without waiting.
    ///
    /// A full queue drops the event and owes the subscriber a [`LiveEvent::Lagged`], which is
    /// queued ahead of the next event that fits. Returns `false` once the receiver is gone.
    fn send(&mut self, event: LiveEvent) -> bool {
        if self.lagged {
            match self.sender.try_send(LiveEvent::Lagged) {
                Ok(()) => self.lagged = false,
                Err(TrySendError::Full(_)) => return true,
                Err(TrySendError::Closed(_)) => return false,
            }
        }
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.lagged = true;
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Debug, Default)]
struct Subscribers(Vec<Subscriber>);

impl Subscribers {
    fn subscribe(&mut self, sender: mpsc::Sender<LiveEvent>) {
        self.0.push(Subscriber {
            sender,
            lagged: false,
        })
    }

    fn send(&mut self, event: LiveEvent) -> bool {
        self.0.retain_mut(|subscriber| subscriber.send(event.clone()));
        !self.0.is_empty()
    }
}

fn fmt_accept_peer(res: &SyncAcceptRes) -> String {
    match res {
        Ok(res) => res.peer.fmt_short(),
        Err(err) => err
            .peer()
            .map(|x| x.fmt_short())
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

fn fmt_accept_namespace(res: &SyncAcceptRes) -> String {
    match res {
        Ok(res) => res.namespace.fmt_short(),
        Err(err) => err
            .namespace()
            .map(|x| x.fmt_short())
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let peer = iroh::SecretKey::from_bytes(&[1; 32]).public();
        let (a_tx, a_rx) = mpsc::channel(4);
        let (b_tx, mut b_rx) = mpsc::channel(4);
        let mut subscribers = Subscribers::default();
        subscribers.subscribe(a_tx);
        subscribers.subscribe(b_tx);
        drop(a_rx);
        assert!(subscribers.send(LiveEvent::NeighborUp(peer)));
        assert_eq!(subscribers.0.len(), 1);
        assert_eq!(b_rx.recv().await, Some(LiveEvent::NeighborUp(peer)));
        drop(b_rx);
        assert!(!subscribers.send(LiveEvent::NeighborDown(peer)));
    }

    #[tokio::test]
    async fn full_subscriber_lags_instead_of_blocking() {
        let peer = iroh::SecretKey::from_bytes(&[1; 32]).public();
        let (slow_tx, mut slow_rx) = mpsc::channel(2);
        let (fast_tx, mut fast_rx) = mpsc::channel(16);
        let mut subscribers = Subscribers::default();
        subscribers.subscribe(slow_tx);
        subscribers.subscribe(fast_tx);

        for _ in 0..5 {
            assert!(subscribers.send(LiveEvent::NeighborUp(peer)));
        }
        for _ in 0..5 {
            assert_eq!(fast_rx.recv().await, Some(LiveEvent::NeighborUp(peer)));
        }
        assert_eq!(slow_rx.recv().await, Some(LiveEvent::NeighborUp(peer)));
        assert_eq!(slow_rx.recv().await, Some(LiveEvent::NeighborUp(peer)));
        assert!(slow_rx.try_recv().is_err());

        // room again: the gap is reported before the next event
        assert!(subscribers.send(LiveEvent::NeighborDown(peer)));
        assert_eq!(slow_rx.recv().await, Some(LiveEvent::Lagged));
        assert_eq!(slow_rx.recv().await, Some(LiveEvent::NeighborDown(peer)));
    }

    #[test]
    fn queued_hashes_report_completed_documents() {
        let a = NamespaceId::from_bytes([1; 32]);
        let b = NamespaceId::from_bytes([2; 32]);
        let h1 = Hash::new(b"one");
        let h2 = Hash::new(b"two");
        let mut queued = QueuedHashes::default();
        queued.insert(h1, a);
        queued.insert(h1, b);
        queued.insert(h2, a);

        let (mut waiting, completed) = queued.remove_hash(&h1);
        waiting.sort();
        assert_eq!(waiting, vec![a, b]);
        assert_eq!(completed, vec![b]);
        assert!(queued.contains_namespace(&a));

        let (_, completed) = queued.remove_hash(&h2);
        assert_eq!(completed, vec![a]);
        assert!(!queued.contains_hash(&h2));
    }
}
