//! Gossip protocol for a single topic: membership and broadcast combined.

use std::{collections::VecDeque, fmt, time::Duration};

use bytes::Bytes;
use derive_more::From;
use rand::Rng;
use rand_core::SeedableRng;
use serde::{Deserialize, Serialize};

use super::{
    PeerAddress, PeerData,
    hyparview::{self, InEvent as SwarmIn},
    plumtree::{self, GossipMessage, InEvent as GossipIn, Scope},
};

/// Input event to the topic state.
#[derive(Debug)]
pub enum InEvent<PA> {
    /// Message received from the network.
    RecvMessage(PA, Message<PA>),
    /// Execute a command from the application.
    Command(Command<PA>),
    /// A previously scheduled timer fired.
    TimerExpired(Timer<PA>),
    /// The connection to a peer was lost.
    PeerDisconnected(PA),
    /// Our own peer data changed.
    UpdatePeerData(PeerData),
}

/// Output event of the topic state.
#[derive(Debug, PartialEq, Eq)]
pub enum OutEvent<PA> {
    /// Send a message on the network.
    SendMessage(PA, Message<PA>),
    /// Emit an event to the application.
    EmitEvent(Event<PA>),
    /// Schedule a timer. The runtime returns it with [`InEvent::TimerExpired`] after the delay.
    ScheduleTimer(Duration, Timer<PA>),
    /// The topic no longer needs the connection to this peer.
    DisconnectPeer(PA),
    /// New [`PeerData`] was received for a peer.
    PeerData(PA, PeerData),
}

impl<PA> From<hyparview::OutEvent<PA>> for OutEvent<PA> {
    fn from(event: hyparview::OutEvent<PA>) -> Self {
        use hyparview::OutEvent::*;
        match event {
            SendMessage(to, message) => Self::SendMessage(to, message.into()),
            ScheduleTimer(delay, timer) => Self::ScheduleTimer(delay, timer.into()),
            DisconnectPeer(peer) => Self::DisconnectPeer(peer),
            EmitEvent(event) => Self::EmitEvent(event.into()),
            PeerData(peer, data) => Self::PeerData(peer, data),
        }
    }
}

impl<PA> From<plumtree::OutEvent<PA>> for OutEvent<PA> {
    fn from(event: plumtree::OutEvent<PA>) -> Self {
        use plumtree::OutEvent::*;
        match event {
            SendMessage(to, message) => Self::SendMessage(to, message.into()),
            ScheduleTimer(delay, timer) => Self::ScheduleTimer(delay, timer.into()),
            EmitEvent(event) => Self::EmitEvent(event.into()),
        }
    }
}

/// Sink for [`OutEvent`]s.
///
/// The protocol layers push into whatever container the caller supplies.
pub trait IO<PA> {
    /// Stores the event.
    fn push(&mut self, event: impl Into<OutEvent<PA>>);
}

impl<PA> IO<PA> for VecDeque<OutEvent<PA>> {
    fn push(&mut self, event: impl Into<OutEvent<PA>>) {
        self.push_back(event.into())
    }
}

/// A protocol message for a topic.
#[derive(From, Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Message<PA> {
    /// Membership layer.
    Swarm(hyparview::Message<PA>),
    /// Broadcast layer.
    Gossip(plumtree::Message<PA>),
}

impl<PA> Message<PA> {
    /// Whether this carries a payload, as opposed to control traffic.
    pub fn is_data(&self) -> bool {
        matches!(self, Message::Gossip(plumtree::Message::Gossip(_)))
    }
}

/// An event for the application.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Event<PA> {
    /// A peer became a direct neighbor.
    NeighborUp(PA),
    /// A peer is no longer a direct neighbor.
    NeighborDown(PA),
    /// A message was delivered.
    Received(GossipMessage<PA>),
}

impl<PA> From<hyparview::Event<PA>> for Event<PA> {
    fn from(value: hyparview::Event<PA>) -> Self {
        match value {
            hyparview::Event::NeighborUp(peer) => Self::NeighborUp(peer),
            hyparview::Event::NeighborDown(peer) => Self::NeighborDown(peer),
        }
    }
}

impl<PA> From<plumtree::Event<PA>> for Event<PA> {
    fn from(value: plumtree::Event<PA>) -> Self {
        match value {
            plumtree::Event::Received(message) => Self::Received(message),
        }
    }
}

/// A timer of a topic. Opaque to the runtime.
#[derive(Clone, From, Debug, PartialEq, Eq)]
pub enum Timer<PA> {
    /// Membership layer.
    Swarm(hyparview::Timer<PA>),
    /// Broadcast layer.
    Gossip(plumtree::Timer),
}

/// A command from the application.
#[derive(Clone)]
pub enum Command<PA> {
    /// Join the swarm through these peers.
    Join(Vec<PA>),
    /// Broadcast a message.
    Broadcast(Bytes, Scope),
    /// Leave the topic.
    Quit,
}

impl<PA: fmt::Debug> fmt::Debug for Command<PA> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Join(peers) => write!(f, "Join({peers:?})"),
            Self::Broadcast(msg, scope) => write!(f, "Broadcast(<{}b>, {scope:?})", msg.len()),
            Self::Quit => write!(f, "Quit"),
        }
    }
}

/// Protocol configuration.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Membership layer.
    pub membership: hyparview::Config,
    /// Broadcast layer.
    pub broadcast: plumtree::Config,
}

/// Membership and broadcast tree of one topic.
#[derive(Debug)]
pub struct State<PA, R> {
    pub(crate) swarm: hyparview::State<PA, R>,
    pub(crate) gossip: plumtree::State<PA>,
    outbox: VecDeque<OutEvent<PA>>,
}

impl<PA: PeerAddress> State<PA, rand::rngs::StdRng> {
    /// Creates the state with an entropy seeded random number generator.
    pub fn new(me: PA, me_data: PeerData, config: Config) -> Self {
        Self::with_rng(me, me_data, config, rand::rngs::StdRng::from_entropy())
    }
}

impl<PA: PeerAddress, R: Rng> State<PA, R> {
    /// Creates the state with the given random number generator.
    pub fn with_rng(me: PA, me_data: PeerData, config: Config, rng: R) -> Self {
        Self {
            swarm: hyparview::State::new(me, me_data, config.membership, rng),
            gossip: plumtree::State::new(me, config.broadcast),
            outbox: VecDeque::new(),
        }
    }

    /// Handles an event and returns the resulting output events.
    pub fn handle(&mut self, event: InEvent<PA>) -> impl Iterator<Item = OutEvent<PA>> + '_ {
        let io = &mut self.outbox;
        match event {
            InEvent::Command(command) => match command {
                Command::Join(peers) => {
                    for peer in peers {
                        self.swarm.handle(SwarmIn::RequestJoin(peer), io);
                    }
                }
                Command::Broadcast(data, scope) => {
                    self.gossip.handle(GossipIn::Broadcast(data, scope), io)
                }
                Command::Quit => self.swarm.handle(SwarmIn::Quit, io),
            },
            InEvent::RecvMessage(from, message) => match message {
                Message::Swarm(message) => {
                    self.swarm.handle(SwarmIn::RecvMessage(from, message), io)
                }
                Message::Gossip(message) => {
                    self.gossip.handle(GossipIn::RecvMessage(from, message), io)
                }
            },
            InEvent::TimerExpired(timer) => match timer {
                Timer::Swarm(timer) => self.swarm.handle(SwarmIn::TimerExpired(timer), io),
                Timer::Gossip(timer) => self.gossip.handle(GossipIn::TimerExpired(timer), io),
            },
            InEvent::PeerDisconnected(peer) => {
                self.swarm.handle(SwarmIn::PeerDisconnected(peer), io)
            }
            InEvent::UpdatePeerData(data) => self.swarm.handle(SwarmIn::UpdatePeerData(data), io),
        }

        // The broadcast tree follows the membership changes.
        let mut neighbor_io = VecDeque::new();
        for event in self.outbox.iter() {
            match event {
                OutEvent::EmitEvent(Event::NeighborUp(peer)) => self
                    .gossip
                    .handle(GossipIn::NeighborUp(*peer), &mut neighbor_io),
                OutEvent::EmitEvent(Event::NeighborDown(peer)) => self
                    .gossip
                    .handle(GossipIn::NeighborDown(*peer), &mut neighbor_io),
                _ => {}
            }
        }
        self.outbox.extend(neighbor_io);

        self.outbox.drain(..)
    }

    /// Whether the topic has any direct neighbors.
    pub fn has_active_peers(&self) -> bool {
        !self.swarm.active_view.is_empty()
    }

    /// The direct neighbors.
    pub fn active_peers(&self) -> impl Iterator<Item = &PA> + '_ {
        self.swarm.active_view.iter()
    }
}
