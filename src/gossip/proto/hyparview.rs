//! Swarm membership after HyParView.
//!
//! The protocol is described in [this paper][paper] by Joao Leitao, Jose Pereira and Luís
//! Rodrigues.
//!
//! Every peer keeps a small *active view* of peers it is connected to and a larger *passive
//! view* of peers it knows about. Links are symmetric: when we add a peer to our active view
//! it adds us to its own. When an active peer leaves or fails, we ask peers from the passive
//! view to become neighbors until the active view is full again. The passive view is kept
//! fresh by periodic shuffles, which exchange random samples of both views with peers a few
//! hops away.
//!
//! [paper]: https://asc.di.fct.unl.pt/~jleitao/pdf/dsn07-leitao.pdf

use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{IO, PeerAddress, PeerData, PeerInfo, util::IndexSet};

/// Number of hops a forwarded message may still travel.
pub type Ttl = u16;

/// Input event for the membership layer.
#[derive(Debug)]
pub enum InEvent<PA> {
    /// A message was received from a peer.
    RecvMessage(PA, Message<PA>),
    /// A scheduled timer fired.
    TimerExpired(Timer<PA>),
    /// The connection to a peer was lost.
    PeerDisconnected(PA),
    /// The application asked to join the swarm through this peer.
    RequestJoin(PA),
    /// Our own peer data changed.
    UpdatePeerData(PeerData),
    /// Leave the swarm.
    Quit,
}

/// Output event of the membership layer.
#[derive(Debug)]
pub enum OutEvent<PA> {
    /// Send a message to a peer.
    SendMessage(PA, Message<PA>),
    /// Schedule a timer.
    ScheduleTimer(Duration, Timer<PA>),
    /// We no longer need the connection to this peer.
    DisconnectPeer(PA),
    /// Emit an event to the application.
    EmitEvent(Event<PA>),
    /// We learned new peer data for a peer.
    PeerData(PA, PeerData),
}

/// Membership changes.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Event<PA> {
    /// A peer was added to the active view.
    NeighborUp(PA),
    /// A peer was removed from the active view.
    NeighborDown(PA),
}

/// Timers of the membership layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Timer<PA> {
    /// Start a shuffle.
    DoShuffle,
    /// A neighbor request to this peer was not answered in time.
    PendingNeighborRequest(PA),
}

/// Membership messages.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Message<PA> {
    /// Sent to the contact peer when joining the swarm.
    Join(PeerData),
    /// Random walk that introduces a new peer to the swarm.
    ForwardJoin(ForwardJoin<PA>),
    /// Random walk carrying a sample of the sender's views.
    Shuffle(Shuffle<PA>),
    /// Reply to a [`Message::Shuffle`] with a sample of the receiver's passive view.
    ShuffleReply(Vec<PeerInfo<PA>>),
    /// Asks the receiver to add us to its active view, or accepts such a request.
    Neighbor(Neighbor),
    /// The sender removed us from its active view.
    Disconnect(Disconnect),
}

/// A new peer doing a random walk through the swarm.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForwardJoin<PA> {
    /// The peer that joined.
    pub peer: PeerInfo<PA>,
    /// Remaining hops.
    pub ttl: Ttl,
}

/// A shuffle request doing a random walk through the swarm.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Shuffle<PA> {
    /// The peer that started the shuffle. The reply goes to this peer.
    pub origin: PeerInfo<PA>,
    /// Sample of the origin's active and passive views.
    pub nodes: Vec<PeerInfo<PA>>,
    /// Remaining hops.
    pub ttl: Ttl,
}

/// How urgently a neighbor is needed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Priority {
    /// The sender has no neighbors left. Must be accepted.
    High,
    /// May be rejected if the receiver's active view is full.
    Low,
}

/// Neighbor request or acceptance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Neighbor {
    /// How urgent the request is.
    pub priority: Priority,
    /// The sender's current peer data.
    pub data: PeerData,
}

/// Notice that the sender dropped the link.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Disconnect {
    /// `false` if the sender is leaving the swarm and should be forgotten.
    pub alive: bool,
}

/// Membership layer configuration.
///
/// All peers of a swarm should use the same values.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of peers we keep connections to.
    pub active_view_capacity: usize,
    /// Number of peers we remember as replacement candidates.
    pub passive_view_capacity: usize,
    /// Hops a [`Message::ForwardJoin`] travels before the new peer is added to an active view.
    pub active_random_walk_length: Ttl,
    /// Remaining hops at which a forwarded new peer is added to the passive view.
    pub passive_random_walk_length: Ttl,
    /// Hops a [`Message::Shuffle`] travels.
    pub shuffle_random_walk_length: Ttl,
    /// Number of active peers included in a shuffle.
    pub shuffle_active_view_count: usize,
    /// Number of passive peers included in a shuffle.
    pub shuffle_passive_view_count: usize,
    /// Time between shuffles.
    pub shuffle_interval: Duration,
    /// Time after which an unanswered neighbor request is given up.
    pub neighbor_request_timeout: Duration,
}

impl Default for Config {
    /// Defaults from the experiments in the paper, except for the timeouts.
    fn default() -> Self {
        Self {
            active_view_capacity: 5,
            passive_view_capacity: 30,
            active_random_walk_length: 6,
            passive_random_walk_length: 3,
            shuffle_random_walk_length: 6,
            shuffle_active_view_count: 3,
            shuffle_passive_view_count: 4,
            shuffle_interval: Duration::from_secs(60),
            neighbor_request_timeout: Duration::from_secs(5),
        }
    }
}

/// Membership state for one topic.
#[derive(Debug)]
pub struct State<PA, R> {
    me: PA,
    me_data: PeerData,
    pub(crate) active_view: IndexSet<PA>,
    pub(crate) passive_view: IndexSet<PA>,
    pending_neighbor_requests: HashSet<PA>,
    peer_data: HashMap<PA, PeerData>,
    config: Config,
    shuffle_scheduled: bool,
    rng: R,
}

impl<PA: PeerAddress, R: Rng> State<PA, R> {
    /// Creates the state.
    pub fn new(me: PA, me_data: PeerData, config: Config, rng: R) -> Self {
        Self {
            me,
            me_data,
            active_view: Default::default(),
            passive_view: Default::default(),
            pending_neighbor_requests: Default::default(),
            peer_data: Default::default(),
            config,
            shuffle_scheduled: false,
            rng,
        }
    }

    /// Handles an event.
    pub fn handle(&mut self, event: InEvent<PA>, io: &mut impl IO<PA>) {
        match event {
            InEvent::RecvMessage(from, message) => self.handle_message(from, message, io),
            InEvent::TimerExpired(Timer::DoShuffle) => self.on_shuffle_timer(io),
            InEvent::TimerExpired(Timer::PendingNeighborRequest(peer)) => {
                self.on_neighbor_request_timeout(peer, io)
            }
            InEvent::PeerDisconnected(peer) => self.on_peer_disconnected(peer, io),
            InEvent::RequestJoin(peer) => self.on_request_join(peer, io),
            InEvent::UpdatePeerData(data) => self.on_update_peer_data(data, io),
            InEvent::Quit => {
                self.on_quit(io);
                return;
            }
        }
        if !self.shuffle_scheduled {
            io.push(OutEvent::ScheduleTimer(
                self.config.shuffle_interval,
                Timer::DoShuffle,
            ));
            self.shuffle_scheduled = true;
        }
    }

    fn handle_message(&mut self, from: PA, message: Message<PA>, io: &mut impl IO<PA>) {
        if from == self.me {
            return;
        }
        match message {
            Message::Join(data) => self.on_join(from, data, io),
            Message::ForwardJoin(details) => self.on_forward_join(from, details, io),
            Message::Shuffle(details) => self.on_shuffle(from, details, io),
            Message::ShuffleReply(nodes) => self.on_shuffle_reply(nodes, io),
            Message::Neighbor(details) => self.on_neighbor(from, details, io),
            Message::Disconnect(details) => self.on_disconnect(from, details, io),
        }
        // Peers that are neither neighbors nor about to become one only needed a one-off
        // exchange.
        if !self.active_view.contains(&from) && !self.pending_neighbor_requests.contains(&from) {
            io.push(OutEvent::DisconnectPeer(from));
        }
    }

    fn on_request_join(&mut self, peer: PA, io: &mut impl IO<PA>) {
        if peer == self.me || self.active_view.contains(&peer) {
            return;
        }
        // The contact answers with a neighbor message, which completes the join.
        if self.pending_neighbor_requests.insert(peer) {
            io.push(OutEvent::ScheduleTimer(
                self.config.neighbor_request_timeout,
                Timer::PendingNeighborRequest(peer),
            ));
        }
        io.push(OutEvent::SendMessage(
            peer,
            Message::Join(self.me_data.clone()),
        ));
    }

    fn on_join(&mut self, from: PA, data: PeerData, io: &mut impl IO<PA>) {
        self.store_peer_data(from, data, io);
        // The contact always accepts a joining peer, evicting a neighbor if needed.
        self.add_active(from, true, io);
        let peer = self.peer_info(from);
        let ttl = self.config.active_random_walk_length;
        for neighbor in self.active_view.iter_without(&from) {
            let message = ForwardJoin {
                peer: peer.clone(),
                ttl,
            };
            io.push(OutEvent::SendMessage(
                *neighbor,
                Message::ForwardJoin(message),
            ));
        }
    }

    fn on_forward_join(&mut self, from: PA, details: ForwardJoin<PA>, io: &mut impl IO<PA>) {
        let ForwardJoin { peer, ttl } = details;
        if peer.id == self.me {
            return;
        }
        self.store_peer_data(peer.id, peer.data.clone(), io);
        if ttl == 0 || self.active_view.len() <= 1 {
            self.add_active(peer.id, true, io);
            return;
        }
        if ttl == self.config.passive_random_walk_length {
            self.add_passive(peer.id);
        }
        let next = self
            .active_view
            .pick_random_without(&[&from, &peer.id], &mut self.rng)
            .copied();
        match next {
            Some(next) => {
                let message = ForwardJoin { peer, ttl: ttl - 1 };
                io.push(OutEvent::SendMessage(next, Message::ForwardJoin(message)));
            }
            None => {
                self.add_active(peer.id, true, io);
            }
        }
    }

    fn on_neighbor(&mut self, from: PA, details: Neighbor, io: &mut impl IO<PA>) {
        let Neighbor { priority, data } = details;
        self.store_peer_data(from, data, io);
        if self.active_view.contains(&from) {
            self.pending_neighbor_requests.remove(&from);
            return;
        }
        let answers_our_request = self.pending_neighbor_requests.contains(&from);
        let accept = answers_our_request
            || priority == Priority::High
            || self.active_view.len() < self.config.active_view_capacity;
        if accept {
            self.add_active(from, !answers_our_request, io);
        } else {
            debug!(peer = ?from, "reject neighbor request");
            io.push(OutEvent::SendMessage(
                from,
                Message::Disconnect(Disconnect { alive: true }),
            ));
            self.add_passive(from);
        }
    }

    fn on_disconnect(&mut self, from: PA, details: Disconnect, io: &mut impl IO<PA>) {
        self.pending_neighbor_requests.remove(&from);
        self.remove_active(from, None, io);
        self.passive_view.remove(&from);
        // The peer is not a candidate for this refill, it just turned us down.
        self.refill_active_view(io);
        if details.alive {
            self.add_passive(from);
        } else {
            self.peer_data.remove(&from);
        }
    }

    fn on_peer_disconnected(&mut self, peer: PA, io: &mut impl IO<PA>) {
        let was_pending = self.pending_neighbor_requests.remove(&peer);
        if self.active_view.contains(&peer) || was_pending {
            // A failed link: forget the peer, it may be gone for good.
            self.remove_active(peer, None, io);
            self.passive_view.remove(&peer);
            self.refill_active_view(io);
        }
    }

    fn on_neighbor_request_timeout(&mut self, peer: PA, io: &mut impl IO<PA>) {
        if self.pending_neighbor_requests.remove(&peer) {
            debug!(?peer, "neighbor request timed out");
            self.passive_view.remove(&peer);
            io.push(OutEvent::DisconnectPeer(peer));
            self.refill_active_view(io);
        }
    }

    fn on_update_peer_data(&mut self, data: PeerData, io: &mut impl IO<PA>) {
        self.me_data = data;
        for peer in self.active_view.iter() {
            let message = Neighbor {
                priority: Priority::High,
                data: self.me_data.clone(),
            };
            io.push(OutEvent::SendMessage(*peer, Message::Neighbor(message)));
        }
    }

    fn on_quit(&mut self, io: &mut impl IO<PA>) {
        for peer in self.active_view.drain() {
            io.push(OutEvent::SendMessage(
                peer,
                Message::Disconnect(Disconnect { alive: false }),
            ));
            io.push(OutEvent::EmitEvent(Event::NeighborDown(peer)));
            io.push(OutEvent::DisconnectPeer(peer));
        }
        for peer in self.pending_neighbor_requests.drain() {
            io.push(OutEvent::DisconnectPeer(peer));
        }
    }

    fn on_shuffle_timer(&mut self, io: &mut impl IO<PA>) {
        let target = self.active_view.pick_random(&mut self.rng).copied();
        if let Some(target) = target {
            let active = self.active_view.shuffled_without_and_capped(
                &[&target],
                self.config.shuffle_active_view_count,
                &mut self.rng,
            );
            let passive = self.passive_view.shuffled_without_and_capped(
                &[&target],
                self.config.shuffle_passive_view_count,
                &mut self.rng,
            );
            let nodes = active
                .into_iter()
                .chain(passive)
                .map(|peer| self.peer_info(peer))
                .collect();
            let message = Shuffle {
                origin: self.peer_info(self.me),
                nodes,
                ttl: self.config.shuffle_random_walk_length,
            };
            io.push(OutEvent::SendMessage(target, Message::Shuffle(message)));
        }
        io.push(OutEvent::ScheduleTimer(
            self.config.shuffle_interval,
            Timer::DoShuffle,
        ));
    }

    fn on_shuffle(&mut self, from: PA, details: Shuffle<PA>, io: &mut impl IO<PA>) {
        let Shuffle { origin, nodes, ttl } = details;
        if origin.id == self.me {
            return;
        }
        if ttl > 1 && self.active_view.len() > 1 {
            let next = self
                .active_view
                .pick_random_without(&[&from, &origin.id], &mut self.rng)
                .copied();
            if let Some(next) = next {
                let message = Shuffle {
                    origin,
                    nodes,
                    ttl: ttl - 1,
                };
                io.push(OutEvent::SendMessage(next, Message::Shuffle(message)));
                return;
            }
        }
        let reply = self
            .passive_view
            .shuffled_without_and_capped(&[&origin.id], nodes.len(), &mut self.rng)
            .into_iter()
            .map(|peer| self.peer_info(peer))
            .collect();
        self.store_peer_data(origin.id, origin.data, io);
        io.push(OutEvent::SendMessage(
            origin.id,
            Message::ShuffleReply(reply),
        ));
        if !self.active_view.contains(&origin.id) {
            io.push(OutEvent::DisconnectPeer(origin.id));
        }
        self.add_passive(origin.id);
        self.on_shuffle_reply(nodes, io);
    }

    fn on_shuffle_reply(&mut self, nodes: Vec<PeerInfo<PA>>, io: &mut impl IO<PA>) {
        for PeerInfo { id, data } in nodes {
            if id == self.me {
                continue;
            }
            self.store_peer_data(id, data, io);
            self.add_passive(id);
        }
    }

    /// Adds a peer to the active view, evicting a random neighbor if the view is full.
    ///
    /// With `reply`, the peer is sent a high priority [`Message::Neighbor`] so that it adds us
    /// as well.
    fn add_active(&mut self, peer: PA, reply: bool, io: &mut impl IO<PA>) -> bool {
        self.pending_neighbor_requests.remove(&peer);
        if peer == self.me || self.active_view.contains(&peer) {
            return false;
        }
        if self.active_view.len() >= self.config.active_view_capacity {
            let evicted = self.active_view.pick_random(&mut self.rng).copied();
            if let Some(evicted) = evicted {
                debug!(peer = ?evicted, "active view full, evict");
                self.remove_active(evicted, Some(Disconnect { alive: true }), io);
                self.add_passive(evicted);
            }
        }
        self.passive_view.remove(&peer);
        self.active_view.insert(peer);
        if reply {
            let message = Neighbor {
                priority: Priority::High,
                data: self.me_data.clone(),
            };
            io.push(OutEvent::SendMessage(peer, Message::Neighbor(message)));
        }
        io.push(OutEvent::EmitEvent(Event::NeighborUp(peer)));
        true
    }

    fn remove_active(&mut self, peer: PA, notify: Option<Disconnect>, io: &mut impl IO<PA>) {
        if self.active_view.remove(&peer).is_none() {
            return;
        }
        if let Some(message) = notify {
            io.push(OutEvent::SendMessage(peer, Message::Disconnect(message)));
        }
        io.push(OutEvent::EmitEvent(Event::NeighborDown(peer)));
        io.push(OutEvent::DisconnectPeer(peer));
    }

    fn add_passive(&mut self, peer: PA) {
        if peer == self.me || self.active_view.contains(&peer) || self.passive_view.contains(&peer)
        {
            return;
        }
        if self.passive_view.len() >= self.config.passive_view_capacity {
            if let Some(dropped) = self.passive_view.remove_random(&mut self.rng) {
                self.peer_data.remove(&dropped);
            }
        }
        self.passive_view.insert(peer);
    }

    /// Sends neighbor requests to passive peers until active and pending peers fill the
    /// active view.
    fn refill_active_view(&mut self, io: &mut impl IO<PA>) {
        while self.active_view.len() + self.pending_neighbor_requests.len()
            < self.config.active_view_capacity
        {
            let pending = &self.pending_neighbor_requests;
            let candidate = self
                .passive_view
                .iter()
                .filter(|peer| !pending.contains(*peer))
                .copied()
                .collect::<Vec<_>>();
            if candidate.is_empty() {
                break;
            }
            let peer = candidate[self.rng.gen_range(0..candidate.len())];
            let priority = if self.active_view.is_empty() {
                Priority::High
            } else {
                Priority::Low
            };
            debug!(?peer, ?priority, "send neighbor request");
            self.pending_neighbor_requests.insert(peer);
            let message = Neighbor {
                priority,
                data: self.me_data.clone(),
            };
            io.push(OutEvent::SendMessage(peer, Message::Neighbor(message)));
            io.push(OutEvent::ScheduleTimer(
                self.config.neighbor_request_timeout,
                Timer::PendingNeighborRequest(peer),
            ));
        }
    }

    fn store_peer_data(&mut self, peer: PA, data: PeerData, io: &mut impl IO<PA>) {
        if data.is_empty() || peer == self.me {
            return;
        }
        if self.peer_data.get(&peer) != Some(&data) {
            self.peer_data.insert(peer, data.clone());
            io.push(OutEvent::PeerData(peer, data));
        }
    }

    fn peer_info(&self, id: PA) -> PeerInfo<PA> {
        let data = if id == self.me {
            self.me_data.clone()
        } else {
            self.peer_data.get(&id).cloned().unwrap_or_default()
        };
        PeerInfo { id, data }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use rand::SeedableRng;

    use super::*;
    use crate::gossip::proto::topic;

    type Io = VecDeque<topic::OutEvent<u32>>;

    fn state(me: u32, capacity: usize) -> State<u32, rand_chacha::ChaCha8Rng> {
        let config = Config {
            active_view_capacity: capacity,
            ..Default::default()
        };
        State::new(
            me,
            Default::default(),
            config,
            rand_chacha::ChaCha8Rng::seed_from_u64(me as u64),
        )
    }

    fn sent(io: &Io) -> Vec<(u32, Message<u32>)> {
        io.iter()
            .filter_map(|e| match e {
                topic::OutEvent::SendMessage(to, topic::Message::Swarm(m)) => Some((*to, m.clone())),
                _ => None,
            })
            .collect()
    }

    fn events(io: &Io) -> Vec<topic::Event<u32>> {
        io.iter()
            .filter_map(|e| match e {
                topic::OutEvent::EmitEvent(ev) => Some(ev.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn join_is_accepted_and_forwarded() {
        let mut s = state(0, 5);
        let mut io = Io::new();
        s.handle(InEvent::RecvMessage(1, Message::Join(Default::default())), &mut io);
        assert_eq!(events(&io), vec![topic::Event::NeighborUp(1)]);
        io.clear();

        s.handle(InEvent::RecvMessage(2, Message::Join(Default::default())), &mut io);
        let sent = sent(&io);
        assert!(sent.contains(&(
            2,
            Message::Neighbor(Neighbor {
                priority: Priority::High,
                data: Default::default()
            })
        )));
        assert!(sent.iter().any(|(to, m)| *to == 1
            && matches!(m, Message::ForwardJoin(ForwardJoin { peer, .. }) if peer.id == 2)));
    }

    #[test]
    fn full_view_rejects_low_priority() {
        let mut s = state(0, 1);
        let mut io = Io::new();
        s.handle(InEvent::RecvMessage(1, Message::Join(Default::default())), &mut io);
        io.clear();
        let request = Neighbor {
            priority: Priority::Low,
            data: Default::default(),
        };
        s.handle(InEvent::RecvMessage(2, Message::Neighbor(request)), &mut io);
        assert_eq!(
            sent(&io),
            vec![(2, Message::Disconnect(Disconnect { alive: true }))]
        );
        assert!(s.passive_view.contains(&2));
        assert!(io
            .iter()
            .any(|e| matches!(e, topic::OutEvent::DisconnectPeer(2))));
    }

    #[test]
    fn lost_neighbor_is_replaced_from_passive_view() {
        let mut s = state(0, 1);
        let mut io = Io::new();
        s.handle(InEvent::RecvMessage(1, Message::Join(Default::default())), &mut io);
        s.handle(
            InEvent::RecvMessage(1, Message::ShuffleReply(vec![PeerInfo {
                id: 7,
                data: Default::default(),
            }])),
            &mut io,
        );
        io.clear();

        s.handle(InEvent::PeerDisconnected(1), &mut io);
        assert_eq!(events(&io), vec![topic::Event::NeighborDown(1)]);
        assert_eq!(
            sent(&io),
            vec![(
                7,
                Message::Neighbor(Neighbor {
                    priority: Priority::High,
                    data: Default::default()
                })
            )]
        );
        io.clear();

        // the peer accepts
        let accept = Neighbor {
            priority: Priority::High,
            data: Default::default(),
        };
        s.handle(InEvent::RecvMessage(7, Message::Neighbor(accept)), &mut io);
        assert_eq!(events(&io), vec![topic::Event::NeighborUp(7)]);
        assert!(sent(&io).is_empty());
    }

    #[test]
    fn unanswered_request_tries_next_candidate() {
        let mut s = state(0, 1);
        let mut io = Io::new();
        s.handle(
            InEvent::RecvMessage(9, Message::ShuffleReply(vec![
                PeerInfo { id: 7, data: Default::default() },
                PeerInfo { id: 8, data: Default::default() },
            ])),
            &mut io,
        );
        s.handle(InEvent::PeerDisconnected(9), &mut io);
        // nothing was active, so nothing to replace yet
        assert!(sent(&io).is_empty());

        s.handle(InEvent::RecvMessage(9, Message::Disconnect(Disconnect { alive: false })), &mut io);
        let first = sent(&io)[0].0;
        io.clear();
        s.handle(InEvent::TimerExpired(Timer::PendingNeighborRequest(first)), &mut io);
        let second = sent(&io)[0].0;
        assert_ne!(first, second);
        assert!(!s.passive_view.contains(&first));
    }

    #[test]
    fn quit_disconnects_everyone() {
        let mut s = state(0, 5);
        let mut io = Io::new();
        for peer in 1..4 {
            s.handle(InEvent::RecvMessage(peer, Message::Join(Default::default())), &mut io);
        }
        io.clear();
        s.handle(InEvent::Quit, &mut io);
        let goodbyes = sent(&io)
            .into_iter()
            .filter(|(_, m)| *m == Message::Disconnect(Disconnect { alive: false }))
            .count();
        assert_eq!(goodbyes, 3);
        assert!(s.active_view.is_empty());
    }
}
