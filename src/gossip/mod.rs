//! Topic based publish-subscribe over an epidemic broadcast tree.
//!
//! Every topic is a separate swarm with its own membership and broadcast tree, see
//! [`proto`] for the protocol. [`Gossip`] runs one actor per node that owns all connections
//! on [`GOSSIP_ALPN`], feeds the protocol state and hands events to topic subscriptions.
//!
//! To join a topic you need the [`PeerId`] of at least one peer that already joined it,
//! unless you are the first. Messages broadcast on a topic reach every peer of the swarm, and
//! every member relays messages of others.

use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use iroh::endpoint::Connection;
use n0_future::{boxed::BoxFuture, task::AbortOnDropHandle};
use n0_watcher::Watcher as _;
use rand::rngs::StdRng;
use rand_core::SeedableRng;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinSet,
};
use tokio_stream::{StreamExt, StreamMap, wrappers::BroadcastStream};
use tracing::{Instrument, debug, error_span, trace, warn};

use self::{metrics::Metrics, util::Timers};
use crate::{
    endpoint::{Endpoint, remote_peer},
    error::{Error, Result},
    key::{AddrInfoOptions, EndpointAddr, PeerId},
    protocol::ProtocolHandler,
    ticket::TopicTicket,
    util::{read_message, write_message},
};

mod handles;
pub mod metrics;
pub mod proto;
mod util;

pub use self::{
    handles::{
        GossipEvent, GossipReceiver, GossipSender, GossipTopic, JoinOptions,
        TOPIC_EVENTS_DEFAULT_CAP, TopicState,
    },
    proto::{
        DeliveryScope, Scope, TopicId, hyparview::Config as HyparviewConfig,
        plumtree::Config as PlumtreeConfig,
    },
};
use self::handles::{Command, TopicStatus};

/// ALPN protocol name.
pub const GOSSIP_ALPN: &[u8] = b"/iroh-node-gossip/1";
/// Default maximum size of an encoded protocol message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4096;
/// Bytes of a message frame that are not payload: topic, message id, origin and framing.
const MESSAGE_OVERHEAD: usize = 160;
/// Channel capacity for the commands of one subscription.
const TOPIC_COMMANDS_CAP: usize = 64;
/// Channel capacity for the send queue (one per connection).
const SEND_QUEUE_CAP: usize = 64;
/// Channel capacity for the ToActor message queue (single).
const TO_ACTOR_CAP: usize = 64;
/// Channel capacity for the InEvent message queue (single).
const IN_EVENT_CAP: usize = 1024;
/// How long a closing connection waits for the remote to read what we sent.
const FLUSH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

type InEvent = proto::InEvent<PeerId>;
type OutEvent = proto::OutEvent<PeerId>;
type Timer = proto::Timer<PeerId>;
type ProtoMessage = proto::Message<PeerId>;
type ProtoEvent = proto::Event<PeerId>;
type ProtoCommand = proto::Command<PeerId>;

/// Options of the gossip protocol.
#[derive(Debug, Clone)]
pub struct GossipOptions {
    /// Membership layer.
    pub membership: HyparviewConfig,
    /// Broadcast layer.
    pub broadcast: PlumtreeConfig,
    /// Maximum size of an encoded protocol message. Larger broadcasts are rejected.
    pub max_message_size: usize,
}

impl Default for GossipOptions {
    fn default() -> Self {
        Self {
            membership: Default::default(),
            broadcast: Default::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Publish and subscribe on gossip topics. Cheap to clone.
///
/// Inbound connections reach the actor through the [`ProtocolHandler`] impl, register it on
/// the router under [`GOSSIP_ALPN`]. The actor dials peers by itself.
#[derive(Debug, Clone)]
pub struct Gossip {
    inner: Arc<Inner>,
}

#[derive(derive_more::Debug)]
struct Inner {
    to_actor_tx: mpsc::Sender<ToActor>,
    endpoint: Endpoint,
    #[debug(skip)]
    _actor_handle: AbortOnDropHandle<()>,
    metrics: Arc<Metrics>,
    max_message_size: usize,
}

impl Gossip {
    /// Spawns the gossip actor on the endpoint.
    pub fn spawn(endpoint: Endpoint, options: GossipOptions) -> Self {
        let me = endpoint.peer_id();
        let me_data = encode_peer_data(&endpoint.addr()).unwrap_or_else(|err| {
            warn!("failed to encode our address: {err:#}");
            PeerData::new()
        });
        let config = proto::Config {
            membership: options.membership,
            broadcast: options.broadcast,
        };
        let state = proto::State::new(me, me_data, config, StdRng::from_entropy());
        let (to_actor_tx, to_actor_rx) = mpsc::channel(TO_ACTOR_CAP);
        let (in_event_tx, in_event_rx) = mpsc::channel(IN_EVENT_CAP);
        let metrics = Arc::new(Metrics::default());

        let actor = Actor {
            endpoint: endpoint.clone(),
            state,
            to_actor_rx,
            in_event_rx,
            in_event_tx,
            timers: Timers::default(),
            command_rx: StreamMap::new(),
            next_subscription: 0,
            peers: Default::default(),
            topics: Default::default(),
            quit_queue: Default::default(),
            dialing: JoinSet::new(),
            connection_tasks: JoinSet::new(),
            metrics: metrics.clone(),
            max_message_size: options.max_message_size,
        };
        let actor_handle = tokio::spawn(
            actor
                .run()
                .instrument(error_span!("gossip", me = %me.fmt_short())),
        );
        Self {
            inner: Arc::new(Inner {
                to_actor_tx,
                endpoint,
                _actor_handle: AbortOnDropHandle::new(actor_handle),
                metrics,
                max_message_size: options.max_message_size,
            }),
        }
    }

    /// The gossip metrics.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Largest payload a broadcast may carry.
    pub fn max_payload_size(&self) -> usize {
        self.inner.max_message_size.saturating_sub(MESSAGE_OVERHEAD)
    }

    /// Hands an inbound connection to the actor.
    pub async fn handle_connection(&self, conn: Connection) -> Result<()> {
        let peer = remote_peer(&conn)?;
        self.send(ToActor::HandleConnection(peer, ConnOrigin::Accept, conn))
            .await
    }

    /// Subscribes to a topic and joins its swarm through `bootstrap`.
    ///
    /// Returns immediately with a handle in [`TopicState::Joining`]. Subscribing to a topic that
    /// is already joined adds a subscription that sees the same events.
    pub async fn subscribe(
        &self,
        topic: TopicId,
        bootstrap: impl IntoIterator<Item = PeerId>,
    ) -> Result<GossipTopic> {
        self.subscribe_with_opts(topic, JoinOptions::with_bootstrap(bootstrap))
            .await
    }

    /// Subscribes and waits until the first neighbor is connected.
    pub async fn subscribe_and_join(
        &self,
        topic: TopicId,
        bootstrap: impl IntoIterator<Item = PeerId>,
    ) -> Result<GossipTopic> {
        let sub = self.subscribe(topic, bootstrap).await?;
        sub.joined().await?;
        Ok(sub)
    }

    /// Subscribes with explicit [`JoinOptions`].
    pub async fn subscribe_with_opts(
        &self,
        topic: TopicId,
        opts: JoinOptions,
    ) -> Result<GossipTopic> {
        let (command_tx, command_rx) = mpsc::channel(TOPIC_COMMANDS_CAP);
        let (event_tx, event_rx) = broadcast::channel(opts.subscription_capacity.max(1));
        let (reply, status_rx) = oneshot::channel();
        self.send(ToActor::Join {
            topic,
            bootstrap: opts.bootstrap,
            command_rx,
            event_tx,
            reply,
        })
        .await?;
        let status = status_rx.await.map_err(|_| Error::cancelled())?;
        let sender = GossipSender::new(topic, command_tx, status.clone(), self.max_payload_size());
        let receiver = GossipReceiver::new(
            topic,
            BroadcastStream::new(event_rx),
            status,
            self.inner.to_actor_tx.clone(),
        );
        Ok(GossipTopic::new(sender, receiver))
    }

    /// Subscribes to the topic of a ticket, joining through the peers it names.
    pub async fn subscribe_ticket(&self, ticket: &TopicTicket) -> Result<GossipTopic> {
        let mut bootstrap = Vec::new();
        for addr in ticket.bootstrap() {
            self.inner.endpoint.add_known_addr(addr.clone());
            if addr.peer_id != self.inner.endpoint.peer_id() {
                bootstrap.push(addr.peer_id);
            }
        }
        self.subscribe(ticket.topic(), bootstrap).await
    }

    /// A ticket for joining `topic` through this node.
    pub fn ticket(&self, topic: TopicId, options: AddrInfoOptions) -> TopicTicket {
        let mut addr = self.inner.endpoint.addr();
        addr.apply_options(options);
        TopicTicket::new(topic, [addr])
    }

    /// Leaves all topics and stops the actor.
    ///
    /// Every handle fails with [`Error::Cancelled`] afterwards. Calling it again does nothing.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .inner
            .to_actor_tx
            .send(ToActor::Shutdown { reply })
            .await
            .is_ok()
        {
            done.await.ok();
        }
    }

    async fn send(&self, msg: ToActor) -> Result<()> {
        self.inner
            .to_actor_tx
            .send(msg)
            .await
            .map_err(|_| Error::cancelled())
    }
}

impl ProtocolHandler for Gossip {
    fn accept(&self, conn: Connection) -> BoxFuture<anyhow::Result<()>> {
        let this = self.clone();
        Box::pin(async move {
            this.handle_connection(conn).await?;
            Ok(())
        })
    }

    fn shutdown(&self) -> BoxFuture<()> {
        let this = self.clone();
        Box::pin(async move { this.shutdown().await })
    }
}

/// Messages from the handles to the actor.
#[derive(derive_more::Debug)]
pub(crate) enum ToActor {
    HandleConnection(PeerId, ConnOrigin, #[debug("Connection")] Connection),
    Join {
        topic: TopicId,
        bootstrap: BTreeSet<PeerId>,
        #[debug(skip)]
        command_rx: mpsc::Receiver<Command>,
        #[debug(skip)]
        event_tx: broadcast::Sender<GossipEvent>,
        #[debug(skip)]
        reply: oneshot::Sender<watch::Receiver<TopicStatus>>,
    },
    Quit {
        topic: TopicId,
        #[debug(skip)]
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        #[debug(skip)]
        reply: oneshot::Sender<()>,
    },
}

/// Whether a connection was initiated by us (Dial) or by the remote peer (Accept).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnOrigin {
    Accept,
    Dial,
}

type PeerData = proto::PeerData;

struct Actor {
    endpoint: Endpoint,
    /// Protocol state of all topics.
    state: proto::State<PeerId, StdRng>,
    to_actor_rx: mpsc::Receiver<ToActor>,
    /// Messages read by the connection loops.
    in_event_rx: mpsc::Receiver<InEvent>,
    in_event_tx: mpsc::Sender<InEvent>,
    timers: Timers<Timer>,
    /// Commands of all subscriptions, keyed by subscription.
    command_rx: StreamMap<u64, TopicCommandStream>,
    next_subscription: u64,
    topics: HashMap<TopicId, TopicEntry>,
    peers: HashMap<PeerId, PeerInfo>,
    /// Topics to leave once the current event is processed.
    quit_queue: VecDeque<TopicId>,
    dialing: JoinSet<(PeerId, Result<Connection>)>,
    /// Connection loops, each returns its peer and connection id when it ends.
    connection_tasks: JoinSet<(PeerId, usize)>,
    metrics: Arc<Metrics>,
    max_message_size: usize,
}

impl Actor {
    async fn run(mut self) {
        let mut addr_watcher = self.endpoint.inner().watch_node_addr();
        let mut watching_addr = true;
        let mut i = 0;
        loop {
            i += 1;
            trace!(?i, "tick");
            self.metrics.actor_tick_main.inc();
            tokio::select! {
                biased;
                msg = self.to_actor_rx.recv() => {
                    trace!(?i, "tick: to_actor_rx");
                    self.metrics.actor_tick_rx.inc();
                    match msg {
                        Some(ToActor::Shutdown { reply }) => {
                            self.shutdown().await;
                            reply.send(()).ok();
                            break;
                        }
                        Some(msg) => self.handle_to_actor_msg(msg).await,
                        None => {
                            debug!("all gossip handles dropped, stop gossip actor");
                            break;
                        }
                    }
                }
                Some((key, (topic, command))) = self.command_rx.next(), if !self.command_rx.is_empty() => {
                    trace!(?i, "tick: command_rx");
                    self.handle_command(topic, key, command).await;
                }
                addr = addr_watcher.updated(), if watching_addr => {
                    trace!(?i, "tick: addr");
                    self.metrics.actor_tick_endpoint.inc();
                    match addr {
                        Ok(addr) => match encode_peer_data(&addr.into()) {
                            Ok(data) => self.handle_in_event(InEvent::UpdatePeerData(data)).await,
                            Err(err) => warn!("failed to encode our address: {err:#}"),
                        },
                        Err(_) => watching_addr = false,
                    }
                }
                Some(res) = self.dialing.join_next(), if !self.dialing.is_empty() => {
                    trace!(?i, "tick: dialer");
                    self.metrics.actor_tick_dialer.inc();
                    match res {
                        Ok((peer, Ok(conn))) => {
                            debug!(peer = %peer.fmt_short(), "dial successful");
                            self.metrics.actor_tick_dialer_success.inc();
                            self.handle_connection(peer, ConnOrigin::Dial, conn);
                        }
                        Ok((peer, Err(err))) => {
                            self.metrics.actor_tick_dialer_failure.inc();
                            self.on_dial_failed(peer, err).await;
                        }
                        Err(err) => warn!("dial task failed: {err:?}"),
                    }
                }
                Some(event) = self.in_event_rx.recv() => {
                    trace!(?i, "tick: in_event_rx");
                    self.metrics.actor_tick_in_event_rx.inc();
                    self.handle_in_event(event).await;
                }
                drain = self.timers.wait_and_drain() => {
                    trace!(?i, "tick: timers");
                    self.metrics.actor_tick_timers.inc();
                    for (_instant, timer) in drain {
                        self.handle_in_event(InEvent::TimerExpired(timer)).await;
                    }
                }
                Some(res) = self.connection_tasks.join_next(), if !self.connection_tasks.is_empty() => {
                    match res {
                        Ok((peer, conn_id)) => self.on_connection_closed(peer, conn_id).await,
                        Err(err) if !err.is_cancelled() => warn!("connection task panicked: {err:?}"),
                        Err(_) => {}
                    }
                }
            }
        }
    }

    async fn handle_to_actor_msg(&mut self, msg: ToActor) {
        trace!("handle to_actor {msg:?}");
        match msg {
            ToActor::HandleConnection(peer, origin, conn) => {
                self.handle_connection(peer, origin, conn)
            }
            ToActor::Join {
                topic,
                bootstrap,
                command_rx,
                event_tx,
                reply,
            } => {
                let key = self.next_subscription;
                self.next_subscription += 1;
                let entry = self.topics.entry(topic).or_default();
                entry.bootstrap.extend(bootstrap.iter().copied());
                // A late subscriber learns about the neighbors that are already up.
                for neighbor in entry.status.borrow().neighbors.iter() {
                    event_tx.send(GossipEvent::PeerJoined(*neighbor)).ok();
                }
                entry.event_senders.push(event_tx);
                entry.command_keys.insert(key);
                reply.send(entry.status.subscribe()).ok();
                self.command_rx
                    .insert(key, TopicCommandStream::new(topic, command_rx));
                let bootstrap = bootstrap.into_iter().collect();
                self.handle_in_event(InEvent::Command(topic, ProtoCommand::Join(bootstrap)))
                    .await;
            }
            ToActor::Quit { topic, reply } => {
                self.quit_queue.push_back(topic);
                self.process_quit_queue().await;
                reply.send(()).ok();
            }
            ToActor::Shutdown { .. } => {}
        }
    }

    async fn handle_command(&mut self, topic: TopicId, key: u64, command: Option<Command>) {
        debug!(?topic, ?key, ?command, "handle command");
        let Some(entry) = self.topics.get_mut(&topic) else {
            return;
        };
        let command = match command {
            Some(Command::Broadcast(message)) => ProtoCommand::Broadcast(message, Scope::Swarm),
            Some(Command::BroadcastNeighbors(message)) => {
                ProtoCommand::Broadcast(message, Scope::Neighbors)
            }
            Some(Command::JoinPeers(peers)) => {
                entry.bootstrap.extend(peers.iter().copied());
                ProtoCommand::Join(peers)
            }
            Some(Command::Quit) => {
                self.quit_queue.push_back(topic);
                self.process_quit_queue().await;
                return;
            }
            None => {
                entry.command_keys.remove(&key);
                if entry.is_unused() {
                    self.quit_queue.push_back(topic);
                    self.process_quit_queue().await;
                }
                return;
            }
        };
        self.handle_in_event(InEvent::Command(topic, command)).await;
    }

    fn handle_connection(&mut self, peer: PeerId, origin: ConnOrigin, conn: Connection) {
        let conn_id = conn.stable_id();
        let info = self.peers.entry(peer).or_default();
        // One connection per peer and direction.
        if info.conns.iter().any(|c| c.origin == origin) {
            debug!(peer = %peer.fmt_short(), ?origin, "ignoring connection: already have one");
            return;
        }

        let (send_rx, queue) = match &mut info.state {
            PeerState::Pending {
                queue,
                close_after_flush,
            } => {
                let queue = std::mem::take(queue);
                let close = *close_after_flush;
                let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAP);
                if close {
                    // Nothing needs this peer anymore: deliver the queue, then let it close.
                    self.peers.remove(&peer);
                } else {
                    info.state = PeerState::Active { send_tx, conn_id };
                    info.conns.push(ConnInfo {
                        id: conn_id,
                        origin,
                        conn: conn.clone(),
                    });
                }
                (Some(send_rx), queue)
            }
            PeerState::Active { .. } if origin == ConnOrigin::Dial => {
                // The remote connected first and we already send on that connection.
                conn.close(0u8.into(), b"duplicate");
                return;
            }
            PeerState::Active { .. } => {
                info.conns.push(ConnInfo {
                    id: conn_id,
                    origin,
                    conn: conn.clone(),
                });
                (None, Vec::new())
            }
        };

        let in_event_tx = self.in_event_tx.clone();
        let metrics = self.metrics.clone();
        let max_message_size = self.max_message_size;
        self.connection_tasks.spawn(
            async move {
                let res = connection_loop(
                    peer,
                    conn,
                    origin,
                    send_rx,
                    queue,
                    &in_event_tx,
                    &metrics,
                    max_message_size,
                )
                .await;
                match res {
                    Ok(()) => debug!("connection closed without error"),
                    Err(err) => debug!("connection closed: {err:#}"),
                }
                (peer, conn_id)
            }
            .instrument(error_span!("gossip_conn", peer = %peer.fmt_short())),
        );
    }

    async fn on_dial_failed(&mut self, peer: PeerId, err: Error) {
        warn!(peer = %peer.fmt_short(), "dial failed: {err}");
        // The remote may have connected to us in the meantime.
        if !matches!(
            self.peers.get(&peer).map(|info| &info.state),
            Some(PeerState::Pending { .. })
        ) {
            return;
        }
        self.peers.remove(&peer);
        for entry in self.topics.values_mut() {
            if entry.bootstrap.contains(&peer) && entry.status.borrow().state == TopicState::Joining
            {
                entry.event_senders.send(&GossipEvent::Error(format!(
                    "failed to reach bootstrap peer {}: {err}",
                    peer.fmt_short()
                )));
            }
        }
        self.handle_in_event(InEvent::PeerDisconnected(peer)).await;
    }

    async fn on_connection_closed(&mut self, peer: PeerId, conn_id: usize) {
        let Some(info) = self.peers.get_mut(&peer) else {
            return;
        };
        let Some(pos) = info.conns.iter().position(|c| c.id == conn_id) else {
            return;
        };
        info.conns.remove(pos);
        let was_sending =
            matches!(info.state, PeerState::Active { conn_id: id, .. } if id == conn_id);
        if !was_sending {
            return;
        }
        if let Some(info) = self.peers.remove(&peer) {
            for c in info.conns {
                c.conn.close(0u8.into(), b"peer disconnected");
            }
        }
        self.handle_in_event(InEvent::PeerDisconnected(peer)).await;
    }

    async fn handle_in_event(&mut self, event: InEvent) {
        self.handle_in_event_inner(event).await;
        self.process_quit_queue().await;
    }

    async fn process_quit_queue(&mut self) {
        while let Some(topic) = self.quit_queue.pop_front() {
            let Some(entry) = self.topics.remove(&topic) else {
                continue;
            };
            debug!(?topic, "leave topic");
            entry.status.send_modify(|status| {
                status.state = TopicState::Left;
                status.neighbors.clear();
            });
            for key in entry.command_keys.iter() {
                self.command_rx.remove(key);
            }
            drop(entry);
            self.handle_in_event_inner(InEvent::Command(topic, ProtoCommand::Quit))
                .await;
        }
    }

    async fn handle_in_event_inner(&mut self, event: InEvent) {
        if matches!(event, InEvent::TimerExpired(_)) {
            trace!(?event, "handle in_event");
        } else {
            debug!(?event, "handle in_event");
        }
        let out: Vec<OutEvent> = self.state.handle(event).collect();
        for event in out {
            if matches!(event, OutEvent::ScheduleTimer(_, _)) {
                trace!(?event, "handle out_event");
            } else {
                debug!(?event, "handle out_event");
            }
            match event {
                OutEvent::SendMessage(peer, message) => self.send_message(peer, message).await,
                OutEvent::EmitEvent(topic, event) => self.emit_event(topic, event),
                OutEvent::ScheduleTimer(delay, timer) => {
                    self.timers.insert(Instant::now() + delay, timer)
                }
                OutEvent::DisconnectPeer(peer) => self.disconnect_peer(peer),
                OutEvent::PeerData(peer, data) => match decode_peer_data(&data) {
                    Ok(mut addr) => {
                        debug!(peer = %peer.fmt_short(), ?addr, "add known addr");
                        addr.peer_id = peer;
                        self.endpoint.add_known_addr(addr);
                    }
                    Err(err) => warn!(peer = %peer.fmt_short(), "failed to decode peer data: {err:#}"),
                },
            }
        }
    }

    async fn send_message(&mut self, peer: PeerId, message: ProtoMessage) {
        let info = self.peers.entry(peer).or_default();
        match &mut info.state {
            PeerState::Active { send_tx, .. } => {
                if send_tx.send(message).await.is_err() {
                    // The peer is removed once the connection task ends.
                    warn!(peer = %peer.fmt_short(), "connection loop dropped");
                }
            }
            PeerState::Pending {
                queue,
                close_after_flush,
            } => {
                *close_after_flush = false;
                if queue.is_empty() {
                    let endpoint = self.endpoint.clone();
                    self.dialing.spawn(async move {
                        let res = endpoint.connect(peer, GOSSIP_ALPN).await;
                        (peer, res)
                    });
                }
                queue.push(message);
            }
        }
    }

    fn emit_event(&mut self, topic: TopicId, event: ProtoEvent) {
        let Some(entry) = self.topics.get_mut(&topic) else {
            return;
        };
        let event = match event {
            ProtoEvent::NeighborUp(peer) => {
                self.metrics.neighbor_up.inc();
                entry.status.send_modify(|status| {
                    status.neighbors.insert(peer);
                    status.state = TopicState::Active;
                });
                GossipEvent::PeerJoined(peer)
            }
            ProtoEvent::NeighborDown(peer) => {
                self.metrics.neighbor_down.inc();
                entry.status.send_modify(|status| {
                    status.neighbors.remove(&peer);
                });
                GossipEvent::PeerLeft(peer)
            }
            ProtoEvent::Received(message) => GossipEvent::MessageReceived {
                from: message.origin,
                content: message.content,
                delivered_via: message.delivered_from,
                scope: message.scope,
            },
        };
        entry.event_senders.send(&event);
        if entry.is_unused() {
            self.quit_queue.push_back(topic);
        }
    }

    fn disconnect_peer(&mut self, peer: PeerId) {
        let Some(info) = self.peers.get_mut(&peer) else {
            return;
        };
        if let PeerState::Pending {
            queue,
            close_after_flush,
        } = &mut info.state
        {
            if !queue.is_empty() {
                // A dial is in flight, deliver the queue before closing.
                *close_after_flush = true;
                return;
            }
        }
        if let Some(info) = self.peers.remove(&peer) {
            let sending = match info.state {
                PeerState::Active { conn_id, .. } => Some(conn_id),
                PeerState::Pending { .. } => None,
            };
            // Dropping the sender lets the sending connection flush and finish on its own.
            for c in info.conns {
                if Some(c.id) != sending {
                    c.conn.close(0u8.into(), b"close from disconnect");
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        let topics: Vec<_> = self.topics.keys().copied().collect();
        self.quit_queue.extend(topics);
        self.process_quit_queue().await;
        let peers: Vec<_> = self.peers.keys().copied().collect();
        for peer in peers {
            self.peers.remove(&peer);
        }
        self.dialing.abort_all();
        // Give the connections a moment to deliver the final disconnect messages.
        let drain = async { while self.connection_tasks.join_next().await.is_some() {} };
        if tokio::time::timeout(FLUSH_TIMEOUT, drain).await.is_err() {
            debug!("connections did not close in time");
        }
        self.connection_tasks.abort_all();
    }
}

#[derive(Debug, Default)]
struct PeerInfo {
    state: PeerState,
    conns: Vec<ConnInfo>,
}

#[derive(Debug)]
struct ConnInfo {
    id: usize,
    origin: ConnOrigin,
    conn: Connection,
}

#[derive(Debug)]
enum PeerState {
    Pending {
        queue: Vec<ProtoMessage>,
        close_after_flush: bool,
    },
    Active {
        send_tx: mpsc::Sender<ProtoMessage>,
        /// The connection we send on.
        conn_id: usize,
    },
}

impl Default for PeerState {
    fn default() -> Self {
        PeerState::Pending {
            queue: Vec::new(),
            close_after_flush: false,
        }
    }
}

#[derive(Debug)]
struct TopicEntry {
    status: watch::Sender<TopicStatus>,
    /// Peers we were asked to join through.
    bootstrap: BTreeSet<PeerId>,
    event_senders: EventSenders,
    command_keys: HashSet<u64>,
}

impl Default for TopicEntry {
    fn default() -> Self {
        Self {
            status: watch::Sender::new(TopicStatus::default()),
            bootstrap: Default::default(),
            event_senders: Default::default(),
            command_keys: Default::default(),
        }
    }
}

impl TopicEntry {
    /// No handle for the topic is left.
    fn is_unused(&mut self) -> bool {
        self.event_senders.prune();
        self.command_keys.is_empty() && self.event_senders.is_empty()
    }
}

#[derive(Debug, Default)]
struct EventSenders {
    senders: Vec<broadcast::Sender<GossipEvent>>,
}

impl EventSenders {
    fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    fn push(&mut self, sender: broadcast::Sender<GossipEvent>) {
        self.senders.push(sender);
    }

    fn prune(&mut self) {
        self.senders.retain(|send| send.receiver_count() > 0);
    }

    /// Sends an event to all subscribers.
    ///
    /// Never waits: a full subscriber loses its oldest event and is told so on its next read.
    fn send(&mut self, event: &GossipEvent) {
        self.senders
            .retain(|send| send.receiver_count() > 0 && send.send(event.clone()).is_ok());
    }
}

/// Commands of one subscription tagged with their topic. Yields `None` once when closed.
struct TopicCommandStream {
    topic: TopicId,
    stream: mpsc::Receiver<Command>,
    closed: bool,
}

impl TopicCommandStream {
    fn new(topic: TopicId, stream: mpsc::Receiver<Command>) -> Self {
        Self {
            topic,
            stream,
            closed: false,
        }
    }
}

impl Stream for TopicCommandStream {
    type Item = (TopicId, Option<Command>);

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.closed {
            return Poll::Ready(None);
        }
        match self.stream.poll_recv(cx) {
            Poll::Ready(Some(item)) => Poll::Ready(Some((self.topic, Some(item)))),
            Poll::Ready(None) => {
                self.closed = true;
                Poll::Ready(Some((self.topic, None)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Runs one connection until either side is done with it.
///
/// With a send queue, this connection carries our messages to the peer. Without one it only
/// receives, because we already send on another connection to the same peer.
#[allow(clippy::too_many_arguments)]
async fn connection_loop(
    from: PeerId,
    conn: Connection,
    origin: ConnOrigin,
    send_rx: Option<mpsc::Receiver<ProtoMessage>>,
    queue: Vec<ProtoMessage>,
    in_event_tx: &mpsc::Sender<InEvent>,
    metrics: &Metrics,
    max_message_size: usize,
) -> anyhow::Result<()> {
    let (mut send, mut recv) = match origin {
        ConnOrigin::Accept => conn.accept_bi().await?,
        ConnOrigin::Dial => conn.open_bi().await?,
    };
    debug!(?origin, "connection established");
    let mut send_buf = BytesMut::new();
    let mut recv_buf = BytesMut::new();

    let send_loop = async {
        let Some(mut send_rx) = send_rx else {
            return std::future::pending().await;
        };
        for msg in queue {
            write_message(&mut send, &mut send_buf, &msg, max_message_size).await?;
            track(metrics, &msg, send_buf.len(), true);
        }
        while let Some(msg) = send_rx.recv().await {
            write_message(&mut send, &mut send_buf, &msg, max_message_size).await?;
            track(metrics, &msg, send_buf.len(), true);
        }
        send.finish()?;
        // Wait until the remote read everything we sent.
        tokio::time::timeout(FLUSH_TIMEOUT, send.stopped())
            .await
            .ok();
        Ok::<_, anyhow::Error>(())
    };

    let recv_loop = async {
        while let Some(msg) =
            read_message::<ProtoMessage>(&mut recv, &mut recv_buf, max_message_size).await?
        {
            let size = postcard::experimental::serialized_size(&msg).unwrap_or_default();
            track(metrics, &msg, size, false);
            in_event_tx.send(InEvent::RecvMessage(from, msg)).await?;
        }
        Ok::<_, anyhow::Error>(())
    };

    let res = tokio::select! {
        res = send_loop => res,
        res = recv_loop => res,
    };
    conn.close(0u8.into(), b"close");
    res
}

fn track(metrics: &Metrics, msg: &ProtoMessage, size: usize, sent: bool) {
    let size = size as u64;
    match (msg.is_data(), sent) {
        (true, true) => {
            metrics.msgs_data_sent.inc();
            metrics.msgs_data_sent_size.inc_by(size);
        }
        (true, false) => {
            metrics.msgs_data_recv.inc();
            metrics.msgs_data_recv_size.inc_by(size);
        }
        (false, true) => {
            metrics.msgs_ctrl_sent.inc();
            metrics.msgs_ctrl_sent_size.inc_by(size);
        }
        (false, false) => {
            metrics.msgs_ctrl_recv.inc();
            metrics.msgs_ctrl_recv_size.inc_by(size);
        }
    }
}

fn encode_peer_data(addr: &EndpointAddr) -> anyhow::Result<PeerData> {
    let bytes = postcard::to_stdvec(addr)?;
    Ok(Bytes::from(bytes))
}

fn decode_peer_data(data: &PeerData) -> anyhow::Result<EndpointAddr> {
    Ok(postcard::from_bytes(data)?)
}
