//! Broadcast over an epidemic tree after Plumtree.
//!
//! The protocol is described in [this paper][paper] by Joao Leitao, Jose Pereira and Luís
//! Rodrigues.
//!
//! Message payloads are pushed eagerly along a spanning tree of the active views. All other
//! neighbors get only the message ids, batched and slightly delayed. A peer that learns about
//! a message id without receiving the payload in time asks for it with a graft, which also
//! repairs the tree. Duplicate payloads prune the link they arrived on.
//!
//! [paper]: https://asc.di.fct.unl.pt/~jleitao/pdf/srds07-leitao.pdf

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    time::Duration,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{IO, PeerAddress, util::BoundedMap};

/// Input event for the broadcast layer.
#[derive(Debug)]
pub enum InEvent<PA> {
    /// A message was received from a peer.
    RecvMessage(PA, Message<PA>),
    /// The application broadcasts a message.
    Broadcast(Bytes, Scope),
    /// A scheduled timer fired.
    TimerExpired(Timer),
    /// A peer was added to the active view.
    NeighborUp(PA),
    /// A peer was removed from the active view.
    NeighborDown(PA),
}

/// Output event of the broadcast layer.
#[derive(Debug, PartialEq, Eq)]
pub enum OutEvent<PA> {
    /// Send a message to a peer.
    SendMessage(PA, Message<PA>),
    /// Schedule a timer.
    ScheduleTimer(Duration, Timer),
    /// Emit an event to the application.
    EmitEvent(Event<PA>),
}

/// Timers of the broadcast layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Timer {
    /// Ask for a message we only know the id of.
    SendGraft(MessageId),
    /// Send the queued [`Message::IHave`]s.
    DispatchLazyPush,
}

/// Events of the broadcast layer.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Event<PA> {
    /// A message was delivered.
    Received(GossipMessage<PA>),
}

/// A message delivered to the application.
#[derive(Clone, derive_more::Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GossipMessage<PA> {
    /// The payload.
    #[debug("<{}b>", content.len())]
    pub content: Bytes,
    /// The peer that broadcast the message.
    pub origin: PA,
    /// The neighbor we received the message from.
    pub delivered_from: PA,
    /// How the message reached us.
    pub scope: DeliveryScope,
}

/// Who a broadcast is sent to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    /// The whole swarm.
    Swarm,
    /// Direct neighbors only, they do not forward.
    Neighbors,
}

/// How a delivered message reached us.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeliveryScope {
    /// Through the swarm, after this many hops.
    Swarm(Round),
    /// Directly from a neighbor that sent it to its neighbors only.
    Neighbors,
}

/// A message id: the blake3 hash of the content.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId([u8; 32]);

impl MessageId {
    /// Hashes `content` into its id.
    pub fn from_content(content: &[u8]) -> Self {
        Self(blake3::hash(content).into())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0[..5]);
        text.make_ascii_lowercase();
        write!(f, "{text}")
    }
}

/// Number of hops a message travelled.
#[derive(
    Serialize, Deserialize, Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Debug, Hash, Default,
)]
pub struct Round(pub u16);

impl Round {
    fn next(self) -> Round {
        Round(self.0.saturating_add(1))
    }
}

/// Broadcast layer messages.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub enum Message<PA> {
    /// A payload. Delivered, then pushed to eager peers and announced to lazy peers.
    Gossip(Gossip<PA>),
    /// The sender moves us to its lazy set.
    Prune,
    /// The sender moves us to its eager set and asks for a payload.
    Graft(Graft),
    /// Ids of messages the sender has.
    IHave(Vec<IHave>),
}

/// A message payload.
#[derive(Serialize, Deserialize, Clone, derive_more::Debug, PartialEq, Eq)]
pub struct Gossip<PA> {
    id: MessageId,
    round: Round,
    origin: PA,
    scope: Scope,
    #[debug("<{}b>", content.len())]
    content: Bytes,
}

/// Announcement of a message id.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct IHave {
    id: MessageId,
    round: Round,
}

/// Request to be moved to the eager set, optionally asking for a payload.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Graft {
    id: Option<MessageId>,
    round: Round,
}

/// Broadcast layer configuration.
///
/// All peers of a swarm should use the same values.
#[derive(Clone, Debug)]
pub struct Config {
    /// Time to wait for a payload after an [`Message::IHave`] before grafting.
    pub graft_timeout_1: Duration,
    /// Time to wait for the answer to a graft before grafting the next announcer.
    pub graft_timeout_2: Duration,
    /// Delay for batching [`Message::IHave`]s.
    pub dispatch_timeout: Duration,
    /// Hops a lazy link has to save over the eager link before the tree is rewired.
    pub optimization_threshold: Round,
    /// Number of payloads kept to answer grafts.
    pub message_cache_capacity: usize,
    /// Number of message ids remembered for deduplication.
    pub message_id_retention: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            graft_timeout_1: Duration::from_millis(80),
            graft_timeout_2: Duration::from_millis(40),
            dispatch_timeout: Duration::from_millis(5),
            // from the experiments in the paper
            optimization_threshold: Round(7),
            message_cache_capacity: 1024,
            message_id_retention: 16 * 1024,
        }
    }
}

/// Broadcast state for one topic.
#[derive(Debug)]
pub struct State<PA> {
    me: PA,
    config: Config,
    pub(crate) eager_push_peers: HashSet<PA>,
    pub(crate) lazy_push_peers: HashSet<PA>,
    lazy_push_queue: HashMap<PA, Vec<IHave>>,
    missing_messages: HashMap<MessageId, VecDeque<(PA, Round)>>,
    received_messages: BoundedMap<MessageId, ()>,
    cache: BoundedMap<MessageId, Gossip<PA>>,
    graft_timer_scheduled: HashSet<MessageId>,
    dispatch_timer_scheduled: bool,
}

impl<PA: PeerAddress> State<PA> {
    /// Creates the state.
    pub fn new(me: PA, config: Config) -> Self {
        Self {
            me,
            eager_push_peers: Default::default(),
            lazy_push_peers: Default::default(),
            lazy_push_queue: Default::default(),
            missing_messages: Default::default(),
            received_messages: BoundedMap::new(config.message_id_retention),
            cache: BoundedMap::new(config.message_cache_capacity),
            graft_timer_scheduled: Default::default(),
            dispatch_timer_scheduled: false,
            config,
        }
    }

    /// Handles an event.
    pub fn handle(&mut self, event: InEvent<PA>, io: &mut impl IO<PA>) {
        match event {
            InEvent::RecvMessage(from, message) => self.handle_message(from, message, io),
            InEvent::Broadcast(content, scope) => self.broadcast(content, scope, io),
            InEvent::NeighborUp(peer) => self.add_eager(peer),
            InEvent::NeighborDown(peer) => self.on_neighbor_down(peer),
            InEvent::TimerExpired(Timer::DispatchLazyPush) => self.on_dispatch_timer(io),
            InEvent::TimerExpired(Timer::SendGraft(id)) => self.on_send_graft_timer(id, io),
        }
    }

    fn handle_message(&mut self, sender: PA, message: Message<PA>, io: &mut impl IO<PA>) {
        match message {
            Message::Gossip(details) => self.on_gossip(sender, details, io),
            Message::Prune => self.add_lazy(sender),
            Message::IHave(details) => self.on_ihave(sender, details, io),
            Message::Graft(details) => self.on_graft(sender, details, io),
        }
    }

    fn on_dispatch_timer(&mut self, io: &mut impl IO<PA>) {
        for (peer, list) in self.lazy_push_queue.drain() {
            io.push(OutEvent::SendMessage(peer, Message::IHave(list)));
        }
        self.dispatch_timer_scheduled = false;
    }

    fn broadcast(&mut self, content: Bytes, scope: Scope, io: &mut impl IO<PA>) {
        let id = MessageId::from_content(&content);
        let message = Gossip {
            id,
            round: Round(0),
            origin: self.me,
            scope,
            content,
        };
        let me = self.me;
        match scope {
            Scope::Neighbors => {
                for peer in self.eager_push_peers.iter().chain(self.lazy_push_peers.iter()) {
                    io.push(OutEvent::SendMessage(*peer, Message::Gossip(message.clone())));
                }
            }
            Scope::Swarm => {
                self.received_messages.insert(id, ());
                self.cache.insert(id, message.clone());
                self.eager_push(&message, &me, io);
                self.lazy_push(&message, &me, io);
            }
        }
    }

    fn on_gossip(&mut self, sender: PA, message: Gossip<PA>, io: &mut impl IO<PA>) {
        if message.scope == Scope::Neighbors {
            let event = GossipMessage {
                content: message.content,
                origin: message.origin,
                delivered_from: sender,
                scope: DeliveryScope::Neighbors,
            };
            io.push(OutEvent::EmitEvent(Event::Received(event)));
            return;
        }
        if self.received_messages.contains_key(&message.id) {
            // A duplicate: the link is redundant in the tree.
            self.add_lazy(sender);
            io.push(OutEvent::SendMessage(sender, Message::Prune));
            return;
        }
        self.received_messages.insert(message.id, ());
        let message = Gossip {
            round: message.round.next(),
            ..message
        };
        self.cache.insert(message.id, message.clone());

        self.eager_push(&message, &sender, io);
        self.lazy_push(&message, &sender, io);

        self.graft_timer_scheduled.remove(&message.id);
        if let Some(previous_ihaves) = self.missing_messages.remove(&message.id) {
            self.optimize_tree(&sender, &message, previous_ihaves, io);
        }

        let event = GossipMessage {
            content: message.content,
            origin: message.origin,
            delivered_from: sender,
            scope: DeliveryScope::Swarm(message.round),
        };
        io.push(OutEvent::EmitEvent(Event::Received(event)));
    }

    /// Promotes a lazy link that is much closer to the origin than the eager link the payload
    /// arrived on.
    fn optimize_tree(
        &mut self,
        sender: &PA,
        message: &Gossip<PA>,
        previous_ihaves: VecDeque<(PA, Round)>,
        io: &mut impl IO<PA>,
    ) {
        let round = message.round;
        let best_ihave = previous_ihaves.iter().min_by_key(|(_, round)| *round).copied();
        if let Some((ihave_peer, ihave_round)) = best_ihave {
            if ihave_round < round
                && round.0 - ihave_round.0 >= self.config.optimization_threshold.0
            {
                let graft = Graft {
                    id: None,
                    round: ihave_round,
                };
                io.push(OutEvent::SendMessage(ihave_peer, Message::Graft(graft)));
                io.push(OutEvent::SendMessage(*sender, Message::Prune));
            }
        }
    }

    fn on_ihave(&mut self, sender: PA, ihaves: Vec<IHave>, io: &mut impl IO<PA>) {
        for ihave in ihaves {
            if self.received_messages.contains_key(&ihave.id) {
                continue;
            }
            self.missing_messages
                .entry(ihave.id)
                .or_default()
                .push_back((sender, ihave.round));
            if self.graft_timer_scheduled.insert(ihave.id) {
                io.push(OutEvent::ScheduleTimer(
                    self.config.graft_timeout_1,
                    Timer::SendGraft(ihave.id),
                ));
            }
        }
    }

    fn on_send_graft_timer(&mut self, id: MessageId, io: &mut impl IO<PA>) {
        if self.received_messages.contains_key(&id) {
            return;
        }
        let next = self
            .missing_messages
            .get_mut(&id)
            .and_then(|entries| entries.pop_front());
        if let Some((peer, round)) = next {
            self.add_eager(peer);
            let graft = Graft {
                id: Some(id),
                round,
            };
            io.push(OutEvent::SendMessage(peer, Message::Graft(graft)));
            io.push(OutEvent::ScheduleTimer(
                self.config.graft_timeout_2,
                Timer::SendGraft(id),
            ));
        } else {
            self.missing_messages.remove(&id);
            self.graft_timer_scheduled.remove(&id);
        }
    }

    fn on_graft(&mut self, sender: PA, details: Graft, io: &mut impl IO<PA>) {
        self.add_eager(sender);
        if let Some(message) = details.id.and_then(|id| self.cache.get(&id)) {
            io.push(OutEvent::SendMessage(sender, Message::Gossip(message.clone())));
        }
    }

    fn on_neighbor_down(&mut self, peer: PA) {
        self.missing_messages.retain(|_, ihaves| {
            ihaves.retain(|(ihave_peer, _)| *ihave_peer != peer);
            !ihaves.is_empty()
        });
        self.eager_push_peers.remove(&peer);
        self.lazy_push_peers.remove(&peer);
        self.lazy_push_queue.remove(&peer);
    }

    fn add_eager(&mut self, peer: PA) {
        self.eager_push_peers.insert(peer);
        self.lazy_push_peers.remove(&peer);
    }

    fn add_lazy(&mut self, peer: PA) {
        self.eager_push_peers.remove(&peer);
        self.lazy_push_peers.insert(peer);
    }

    fn eager_push(&mut self, gossip: &Gossip<PA>, sender: &PA, io: &mut impl IO<PA>) {
        for peer in self
            .eager_push_peers
            .iter()
            .filter(|peer| **peer != self.me && *peer != sender && **peer != gossip.origin)
        {
            io.push(OutEvent::SendMessage(*peer, Message::Gossip(gossip.clone())));
        }
    }

    /// Queues announcements for the lazy peers, sent in one batch when
    /// [`Timer::DispatchLazyPush`] fires.
    fn lazy_push(&mut self, gossip: &Gossip<PA>, sender: &PA, io: &mut impl IO<PA>) {
        let mut queued = false;
        for peer in self
            .lazy_push_peers
            .iter()
            .filter(|peer| *peer != sender && **peer != gossip.origin)
        {
            self.lazy_push_queue.entry(*peer).or_default().push(IHave {
                id: gossip.id,
                round: gossip.round,
            });
            queued = true;
        }
        if queued && !self.dispatch_timer_scheduled {
            io.push(OutEvent::ScheduleTimer(
                self.config.dispatch_timeout,
                Timer::DispatchLazyPush,
            ));
            self.dispatch_timer_scheduled = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::proto::topic;

    type Io = VecDeque<topic::OutEvent<u32>>;

    fn gossip(content: &Bytes, round: u16, origin: u32) -> Message<u32> {
        Message::Gossip(Gossip {
            id: MessageId::from_content(content),
            round: Round(round),
            origin,
            scope: Scope::Swarm,
            content: content.clone(),
        })
    }

    fn ihave(content: &Bytes, round: u16) -> Message<u32> {
        Message::IHave(vec![IHave {
            id: MessageId::from_content(content),
            round: Round(round),
        }])
    }

    fn received(content: &Bytes, from: u32, origin: u32, round: u16) -> topic::OutEvent<u32> {
        topic::OutEvent::EmitEvent(topic::Event::Received(GossipMessage {
            content: content.clone(),
            origin,
            delivered_from: from,
            scope: DeliveryScope::Swarm(Round(round)),
        }))
    }

    #[test]
    fn optimize_tree() {
        let mut io = Io::new();
        let mut state = State::new(1, Config::default());

        // Peer 2 announces a message that was 2 hops away from its origin. The payload then
        // arrives from peer 3 after 6 hops, not enough to rewire with the default threshold
        // of 7.
        let content = Bytes::from_static(b"hi");
        state.handle(InEvent::RecvMessage(2, ihave(&content, 2)), &mut io);
        io.clear();
        state.handle(InEvent::RecvMessage(3, gossip(&content, 6, 9)), &mut io);
        assert_eq!(io, VecDeque::from([received(&content, 3, 9, 7)]));
        io.clear();

        // This time the payload took 9 hops: peer 2 is grafted and peer 3 pruned.
        let content = Bytes::from_static(b"hi2");
        state.handle(InEvent::RecvMessage(2, ihave(&content, 2)), &mut io);
        io.clear();
        state.handle(InEvent::RecvMessage(3, gossip(&content, 9, 9)), &mut io);
        let expected = VecDeque::from([
            topic::OutEvent::SendMessage(
                2,
                topic::Message::Gossip(Message::Graft(Graft {
                    id: None,
                    round: Round(2),
                })),
            ),
            topic::OutEvent::SendMessage(3, topic::Message::Gossip(Message::Prune)),
            received(&content, 3, 9, 10),
        ]);
        assert_eq!(io, expected);
    }

    #[test]
    fn duplicates_prune_the_link() {
        let mut io = Io::new();
        let mut state = State::new(1, Config::default());
        state.handle(InEvent::NeighborUp(2), &mut io);
        state.handle(InEvent::NeighborUp(3), &mut io);
        let content = Bytes::from_static(b"dup");

        state.handle(InEvent::RecvMessage(2, gossip(&content, 0, 2)), &mut io);
        assert!(io.contains(&received(&content, 2, 2, 1)));
        io.clear();

        state.handle(InEvent::RecvMessage(3, gossip(&content, 3, 2)), &mut io);
        assert_eq!(
            io,
            VecDeque::from([topic::OutEvent::SendMessage(
                3,
                topic::Message::Gossip(Message::Prune)
            )])
        );
        assert!(state.lazy_push_peers.contains(&3));
    }

    #[test]
    fn missing_payload_is_grafted() {
        let mut io = Io::new();
        let mut state = State::new(1, Config::default());
        let content = Bytes::from_static(b"late");
        let id = MessageId::from_content(&content);
        state.handle(InEvent::RecvMessage(4, ihave(&content, 1)), &mut io);
        assert_eq!(
            io.pop_front(),
            Some(topic::OutEvent::ScheduleTimer(
                Config::default().graft_timeout_1,
                topic::Timer::Gossip(Timer::SendGraft(id))
            ))
        );

        state.handle(InEvent::TimerExpired(Timer::SendGraft(id)), &mut io);
        assert_eq!(
            io.pop_front(),
            Some(topic::OutEvent::SendMessage(
                4,
                topic::Message::Gossip(Message::Graft(Graft {
                    id: Some(id),
                    round: Round(1)
                }))
            ))
        );
        assert!(state.eager_push_peers.contains(&4));
    }

    #[test]
    fn neighbor_scope_is_not_forwarded() {
        let mut io = Io::new();
        let mut state = State::new(1, Config::default());
        state.handle(InEvent::NeighborUp(2), &mut io);
        state.handle(InEvent::NeighborUp(3), &mut io);
        let content = Bytes::from_static(b"near");
        let message = Message::Gossip(Gossip {
            id: MessageId::from_content(&content),
            round: Round(0),
            origin: 2,
            scope: Scope::Neighbors,
            content: content.clone(),
        });
        state.handle(InEvent::RecvMessage(2, message), &mut io);
        let expected = topic::OutEvent::EmitEvent(topic::Event::Received(GossipMessage {
            content,
            origin: 2,
            delivered_from: 2,
            scope: DeliveryScope::Neighbors,
        }));
        assert_eq!(io, VecDeque::from([expected]));
    }
}
