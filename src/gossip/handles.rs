//! Topic handles returned by [`super::Gossip::subscribe`].

use std::{
    collections::BTreeSet,
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tracing::debug;

use super::{ToActor, proto::DeliveryScope};
use crate::{
    error::{Error, Result},
    gossip::TopicId,
    key::PeerId,
};

/// Default number of events buffered per subscription.
pub const TOPIC_EVENTS_DEFAULT_CAP: usize = 2048;

/// Events of a topic subscription.
#[derive(Clone, derive_more::Debug, PartialEq, Eq)]
pub enum GossipEvent {
    /// A peer became a direct neighbor.
    PeerJoined(PeerId),
    /// A peer is no longer a direct neighbor.
    PeerLeft(PeerId),
    /// A message was delivered.
    MessageReceived {
        /// The peer that broadcast the message.
        from: PeerId,
        /// The payload.
        #[debug("<{}b>", content.len())]
        content: Bytes,
        /// The neighbor that handed the message to us.
        delivered_via: PeerId,
        /// Whether it came through the swarm or directly from a neighbor.
        scope: DeliveryScope,
    },
    /// The subscriber fell behind and missed events.
    Lagged,
    /// A problem that does not end the subscription, e.g. an unreachable bootstrap peer.
    Error(String),
}

/// Lifecycle of a topic subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum TopicState {
    /// Waiting for the first neighbor.
    Joining,
    /// Connected to at least one neighbor at some point.
    Active,
    /// The topic was left. Terminal.
    Left,
}

/// Shared view of a topic, updated by the actor.
#[derive(Debug, Clone)]
pub(crate) struct TopicStatus {
    pub(crate) state: TopicState,
    pub(crate) neighbors: BTreeSet<PeerId>,
}

impl Default for TopicStatus {
    fn default() -> Self {
        Self {
            state: TopicState::Joining,
            neighbors: Default::default(),
        }
    }
}

/// Options for joining a topic.
#[derive(Debug, Clone)]
pub struct JoinOptions {
    /// Peers to join the swarm through.
    pub bootstrap: BTreeSet<PeerId>,
    /// Number of events buffered for this subscription before the oldest are dropped.
    pub subscription_capacity: usize,
}

impl JoinOptions {
    /// Options with the given bootstrap peers and the default capacity.
    pub fn with_bootstrap(bootstrap: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            bootstrap: bootstrap.into_iter().collect(),
            subscription_capacity: TOPIC_EVENTS_DEFAULT_CAP,
        }
    }
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self::with_bootstrap([])
    }
}

/// Commands from a topic handle to the actor.
#[derive(Clone)]
pub(crate) enum Command {
    Broadcast(Bytes),
    BroadcastNeighbors(Bytes),
    JoinPeers(Vec<PeerId>),
    Quit,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast(msg) => write!(f, "Broadcast(<{}b>)", msg.len()),
            Self::BroadcastNeighbors(msg) => write!(f, "BroadcastNeighbors(<{}b>)", msg.len()),
            Self::JoinPeers(peers) => write!(f, "JoinPeers({peers:?})"),
            Self::Quit => write!(f, "Quit"),
        }
    }
}

/// A subscription to a topic. Send with it and read its [`GossipEvent`]s as a stream.
///
/// Dropping every handle of a topic leaves it.
#[derive(Debug)]
pub struct GossipTopic {
    sender: GossipSender,
    receiver: GossipReceiver,
}

impl GossipTopic {
    pub(crate) fn new(sender: GossipSender, receiver: GossipReceiver) -> Self {
        Self { sender, receiver }
    }

    /// Splits into the sending and the receiving half.
    pub fn split(self) -> (GossipSender, GossipReceiver) {
        (self.sender, self.receiver)
    }

    /// The topic id.
    pub fn topic(&self) -> TopicId {
        self.sender.topic
    }

    /// Broadcasts to the whole swarm.
    pub async fn broadcast(&self, content: impl Into<Bytes>) -> Result<()> {
        self.sender.broadcast(content).await
    }

    /// Sends to the direct neighbors only.
    pub async fn broadcast_neighbors(&self, content: impl Into<Bytes>) -> Result<()> {
        self.sender.broadcast_neighbors(content).await
    }

    /// Waits until the first neighbor is connected.
    pub async fn joined(&self) -> Result<()> {
        self.receiver.joined().await
    }

    /// Whether a neighbor was connected at some point.
    pub fn is_joined(&self) -> bool {
        self.receiver.is_joined()
    }

    /// The current state.
    pub fn state(&self) -> TopicState {
        self.receiver.state()
    }

    /// The current direct neighbors.
    pub fn neighbors(&self) -> Vec<PeerId> {
        self.receiver.neighbors()
    }

    /// Leaves the topic. Calling it again does nothing.
    pub async fn cancel(&self) -> Result<()> {
        self.sender.cancel().await
    }
}

impl Stream for GossipTopic {
    type Item = GossipEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_next(cx)
    }
}

/// Sending half of a [`GossipTopic`]. Cheap to clone.
#[derive(Debug, Clone)]
pub struct GossipSender {
    topic: TopicId,
    command_tx: mpsc::Sender<Command>,
    status: watch::Receiver<TopicStatus>,
    max_payload_size: usize,
}

impl GossipSender {
    pub(crate) fn new(
        topic: TopicId,
        command_tx: mpsc::Sender<Command>,
        status: watch::Receiver<TopicStatus>,
        max_payload_size: usize,
    ) -> Self {
        Self {
            topic,
            command_tx,
            status,
            max_payload_size,
        }
    }

    /// The topic id.
    pub fn topic(&self) -> TopicId {
        self.topic
    }

    /// Broadcasts to the whole swarm.
    pub async fn broadcast(&self, content: impl Into<Bytes>) -> Result<()> {
        let content = self.check_size(content.into())?;
        self.send(Command::Broadcast(content)).await
    }

    /// Sends to the direct neighbors only. They deliver it but do not pass it on.
    pub async fn broadcast_neighbors(&self, content: impl Into<Bytes>) -> Result<()> {
        let content = self.check_size(content.into())?;
        self.send(Command::BroadcastNeighbors(content)).await
    }

    /// Joins the swarm through additional peers.
    pub async fn join_peers(&self, peers: impl IntoIterator<Item = PeerId>) -> Result<()> {
        self.send(Command::JoinPeers(peers.into_iter().collect()))
            .await
    }

    /// The current state.
    pub fn state(&self) -> TopicState {
        self.status.borrow().state
    }

    /// The current direct neighbors.
    pub fn neighbors(&self) -> Vec<PeerId> {
        self.status.borrow().neighbors.iter().copied().collect()
    }

    /// Leaves the topic. Calling it again does nothing.
    pub async fn cancel(&self) -> Result<()> {
        if self.state() == TopicState::Left {
            return Ok(());
        }
        // Fails only if the topic is already gone.
        self.command_tx.send(Command::Quit).await.ok();
        wait_left(self.status.clone()).await;
        Ok(())
    }

    fn check_size(&self, content: Bytes) -> Result<Bytes> {
        if content.len() > self.max_payload_size {
            return Err(Error::protocol(format!(
                "message of {} bytes exceeds the limit of {}",
                content.len(),
                self.max_payload_size
            )));
        }
        Ok(content)
    }

    async fn send(&self, command: Command) -> Result<()> {
        if self.state() == TopicState::Left {
            return Err(Error::cancelled());
        }
        self.command_tx
            .send(command)
            .await
            .map_err(|_| Error::cancelled())
    }
}

/// Receiving half of a [`GossipTopic`].
///
/// If events arrive faster than they are read, the oldest are dropped and a single
/// [`GossipEvent::Lagged`] is yielded in their place. The stream ends when the topic is left.
#[derive(derive_more::Debug)]
pub struct GossipReceiver {
    topic: TopicId,
    #[debug(skip)]
    events: BroadcastStream<GossipEvent>,
    status: watch::Receiver<TopicStatus>,
    to_actor_tx: mpsc::Sender<ToActor>,
}

impl GossipReceiver {
    pub(crate) fn new(
        topic: TopicId,
        events: BroadcastStream<GossipEvent>,
        status: watch::Receiver<TopicStatus>,
        to_actor_tx: mpsc::Sender<ToActor>,
    ) -> Self {
        Self {
            topic,
            events,
            status,
            to_actor_tx,
        }
    }

    /// The topic id.
    pub fn topic(&self) -> TopicId {
        self.topic
    }

    /// The current state.
    pub fn state(&self) -> TopicState {
        self.status.borrow().state
    }

    /// Whether a neighbor was connected at some point.
    pub fn is_joined(&self) -> bool {
        self.state() == TopicState::Active
    }

    /// The current direct neighbors.
    pub fn neighbors(&self) -> Vec<PeerId> {
        self.status.borrow().neighbors.iter().copied().collect()
    }

    /// Waits until the first neighbor is connected.
    ///
    /// Fails with [`Error::Cancelled`] if the topic is left first.
    pub async fn joined(&self) -> Result<()> {
        let mut status = self.status.clone();
        let joined = match status.wait_for(|s| s.state != TopicState::Joining).await {
            Ok(status) => status.state == TopicState::Active,
            Err(_) => false,
        };
        if joined {
            Ok(())
        } else {
            Err(Error::cancelled())
        }
    }

    /// Leaves the topic. Calling it again does nothing.
    pub async fn cancel(&self) -> Result<()> {
        if self.state() == TopicState::Left {
            return Ok(());
        }
        let (reply, done) = oneshot::channel();
        let msg = ToActor::Quit {
            topic: self.topic,
            reply,
        };
        if self.to_actor_tx.send(msg).await.is_ok() {
            done.await.ok();
        }
        wait_left(self.status.clone()).await;
        Ok(())
    }
}

impl Stream for GossipReceiver {
    type Item = GossipEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.events).poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => Poll::Ready(Some(event)),
            Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                debug!(topic = ?self.topic, skipped, "subscriber lagged");
                Poll::Ready(Some(GossipEvent::Lagged))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

async fn wait_left(mut status: watch::Receiver<TopicStatus>) {
    // A closed channel means the actor dropped the topic, which only happens after leaving it.
    status
        .wait_for(|s| s.state == TopicState::Left)
        .await
        .ok();
}
