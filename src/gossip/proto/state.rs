//! Gossip protocol state for all topics of a node.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    str::FromStr,
    time::Duration,
};

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{Config, PeerAddress, PeerData, topic};
use crate::docs::{KeyParseError, base32};

/// Identifies a gossip topic.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Ord, PartialOrd, Deserialize)]
pub struct TopicId([u8; 32]);

impl TopicId {
    /// Creates a topic id from its bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The bytes of the topic id.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<blake3::Hash> for TopicId {
    fn from(value: blake3::Hash) -> Self {
        Self(value.into())
    }
}

impl From<[u8; 32]> for TopicId {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", base32::fmt(self.0))
    }
}

impl fmt::Debug for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0);
        text.make_ascii_lowercase();
        write!(f, "{}…{}", &text[..5], &text[(text.len() - 2)..])
    }
}

impl FromStr for TopicId {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(base32::parse_array(s)?))
    }
}

/// A protocol message for a topic, as sent over the wire.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message<PA> {
    pub(crate) topic: TopicId,
    pub(crate) message: topic::Message<PA>,
}

impl<PA> Message<PA> {
    /// The topic the message belongs to.
    pub fn topic(&self) -> TopicId {
        self.topic
    }

    /// Whether this carries a payload, as opposed to control traffic.
    pub fn is_data(&self) -> bool {
        self.message.is_data()
    }
}

/// A timer of a topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timer<PA> {
    topic: TopicId,
    timer: topic::Timer<PA>,
}

/// Input event to the state.
#[derive(Debug)]
pub enum InEvent<PA> {
    /// Message received from the network.
    RecvMessage(PA, Message<PA>),
    /// Execute a command for a topic.
    Command(TopicId, topic::Command<PA>),
    /// A previously scheduled timer fired.
    TimerExpired(Timer<PA>),
    /// The connection to a peer was lost.
    PeerDisconnected(PA),
    /// Our own peer data changed.
    UpdatePeerData(PeerData),
}

/// Output event of the state.
#[derive(Debug, PartialEq, Eq)]
pub enum OutEvent<PA> {
    /// Send a message on the network.
    SendMessage(PA, Message<PA>),
    /// Emit an event for a topic.
    EmitEvent(TopicId, topic::Event<PA>),
    /// Schedule a timer. The runtime returns it with [`InEvent::TimerExpired`] after the delay.
    ScheduleTimer(Duration, Timer<PA>),
    /// No topic needs the connection to this peer anymore.
    DisconnectPeer(PA),
    /// New peer data was received for a peer.
    PeerData(PA, PeerData),
}

type ConnsMap<PA> = HashMap<PA, HashSet<TopicId>>;
type Outbox<PA> = Vec<OutEvent<PA>>;

/// Protocol state of all joined topics.
#[derive(Debug)]
pub struct State<PA, R> {
    me: PA,
    me_data: PeerData,
    config: Config,
    rng: R,
    states: HashMap<TopicId, topic::State<PA, R>>,
    outbox: Outbox<PA>,
    conns: ConnsMap<PA>,
}

impl<PA: PeerAddress, R: Rng + Clone> State<PA, R> {
    /// Creates the state.
    pub fn new(me: PA, me_data: PeerData, config: Config, rng: R) -> Self {
        Self {
            me,
            me_data,
            config,
            rng,
            states: Default::default(),
            outbox: Default::default(),
            conns: Default::default(),
        }
    }

    /// Our own address.
    pub fn me(&self) -> &PA {
        &self.me
    }

    /// The state of a topic, if joined.
    pub fn state(&self, topic: &TopicId) -> Option<&topic::State<PA, R>> {
        self.states.get(topic)
    }

    /// The joined topics.
    pub fn topics(&self) -> impl Iterator<Item = &TopicId> {
        self.states.keys()
    }

    /// Whether the topic has any direct neighbors.
    pub fn has_active_peers(&self, topic: &TopicId) -> bool {
        self.state(topic).is_some_and(|s| s.has_active_peers())
    }

    /// Handles an event and returns the resulting output events.
    pub fn handle(&mut self, event: InEvent<PA>) -> impl Iterator<Item = OutEvent<PA>> + '_ {
        match event {
            InEvent::RecvMessage(from, Message { topic, message }) => {
                self.handle_topic_event(topic, topic::InEvent::RecvMessage(from, message))
            }
            InEvent::Command(topic, command) => {
                self.handle_topic_event(topic, topic::InEvent::Command(command))
            }
            InEvent::TimerExpired(Timer { topic, timer }) => {
                self.handle_topic_event(topic, topic::InEvent::TimerExpired(timer))
            }
            InEvent::PeerDisconnected(peer) => {
                self.conns.remove(&peer);
                for (topic, state) in self.states.iter_mut() {
                    let out = state.handle(topic::InEvent::PeerDisconnected(peer));
                    for event in out {
                        handle_out_event(*topic, event, &mut self.conns, &mut self.outbox);
                    }
                }
            }
            InEvent::UpdatePeerData(data) => {
                self.me_data = data.clone();
                for (topic, state) in self.states.iter_mut() {
                    let out = state.handle(topic::InEvent::UpdatePeerData(data.clone()));
                    for event in out {
                        handle_out_event(*topic, event, &mut self.conns, &mut self.outbox);
                    }
                }
            }
        }
        self.outbox.drain(..)
    }

    fn handle_topic_event(&mut self, topic: TopicId, event: topic::InEvent<PA>) {
        let quit = matches!(event, topic::InEvent::Command(topic::Command::Quit));
        if let topic::InEvent::Command(topic::Command::Join(_)) = &event {
            if !self.states.contains_key(&topic) {
                let state = topic::State::with_rng(
                    self.me,
                    self.me_data.clone(),
                    self.config.clone(),
                    self.rng.clone(),
                );
                self.states.insert(topic, state);
            }
        }
        // Anything but a join is ignored for topics we are not part of.
        let Some(state) = self.states.get_mut(&topic) else {
            return;
        };
        if let topic::InEvent::RecvMessage(from, _) = &event {
            self.conns.entry(*from).or_default().insert(topic);
        }
        for event in state.handle(event) {
            handle_out_event(topic, event, &mut self.conns, &mut self.outbox);
        }
        if quit {
            self.states.remove(&topic);
            let mut unused = Vec::new();
            for (peer, topics) in self.conns.iter_mut() {
                if topics.remove(&topic) && topics.is_empty() {
                    unused.push(*peer);
                }
            }
            for peer in unused {
                self.conns.remove(&peer);
                self.outbox.push(OutEvent::DisconnectPeer(peer));
            }
        }
    }
}

fn handle_out_event<PA: PeerAddress>(
    topic: TopicId,
    event: topic::OutEvent<PA>,
    conns: &mut ConnsMap<PA>,
    outbox: &mut Outbox<PA>,
) {
    match event {
        topic::OutEvent::SendMessage(to, message) => {
            conns.entry(to).or_default().insert(topic);
            outbox.push(OutEvent::SendMessage(to, Message { topic, message }))
        }
        topic::OutEvent::EmitEvent(event) => outbox.push(OutEvent::EmitEvent(topic, event)),
        topic::OutEvent::ScheduleTimer(delay, timer) => {
            outbox.push(OutEvent::ScheduleTimer(delay, Timer { topic, timer }))
        }
        topic::OutEvent::DisconnectPeer(peer) => {
            let empty = conns
                .get_mut(&peer)
                .map(|list| list.remove(&topic) && list.is_empty())
                .unwrap_or(false);
            if empty {
                conns.remove(&peer);
                outbox.push(OutEvent::DisconnectPeer(peer));
            }
        }
        topic::OutEvent::PeerData(peer, data) => outbox.push(OutEvent::PeerData(peer, data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_id_display_roundtrip() {
        let topic = TopicId::from(blake3::hash(b"chat"));
        let parsed: TopicId = topic.to_string().parse().unwrap();
        assert_eq!(parsed, topic);
        assert!("abc".parse::<TopicId>().is_err());
    }
}
