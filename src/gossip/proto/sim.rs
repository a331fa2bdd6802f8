//! A simulated network to run many protocol states against each other.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    time::{Duration, Instant},
};

use bytes::Bytes;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use super::{
    Command, Config, DeliveryScope, Event, GossipMessage, InEvent, OutEvent, Scope, State, Timer,
    TopicId, util::TimerMap,
};

type PeerState = State<u32, ChaCha8Rng>;

/// All messages sent in one tick are delivered in the next.
pub(crate) struct Network {
    time: Instant,
    tick_duration: Duration,
    peers: BTreeMap<u32, PeerState>,
    inqueues: BTreeMap<u32, VecDeque<InEvent<u32>>>,
    timers: TimerMap<(u32, Timer<u32>)>,
    events: Vec<(u32, TopicId, Event<u32>)>,
    conns: BTreeSet<(u32, u32)>,
}

impl Network {
    pub fn new() -> Self {
        Self {
            time: Instant::now(),
            tick_duration: Duration::from_millis(10),
            peers: Default::default(),
            inqueues: Default::default(),
            timers: Default::default(),
            events: Default::default(),
            conns: Default::default(),
        }
    }

    pub fn add_peer(&mut self, id: u32, config: Config) {
        let rng = ChaCha8Rng::seed_from_u64(id as u64);
        let state = State::new(id, Bytes::new(), config, rng);
        self.peers.insert(id, state);
    }

    pub fn command(&mut self, peer: u32, topic: TopicId, command: Command<u32>) {
        self.handle(peer, InEvent::Command(topic, command));
    }

    /// Removes a peer without notice, as if its process died.
    pub fn kill(&mut self, peer: u32) {
        self.peers.remove(&peer);
        self.inqueues.remove(&peer);
        let lost = self
            .conns
            .iter()
            .filter(|(a, b)| *a == peer || *b == peer)
            .copied()
            .collect::<Vec<_>>();
        for (a, b) in lost {
            self.conns.remove(&(a, b));
            let other = if a == peer { b } else { a };
            self.inqueues
                .entry(other)
                .or_default()
                .push_back(InEvent::PeerDisconnected(peer));
        }
    }

    pub fn ticks(&mut self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }

    fn tick(&mut self) {
        self.time += self.tick_duration;
        let inqueues = std::mem::take(&mut self.inqueues);
        for (peer, queue) in inqueues {
            for event in queue {
                self.handle(peer, event);
            }
        }
        let expired = self.timers.drain_until(&self.time).collect::<Vec<_>>();
        for (_, (peer, timer)) in expired {
            self.handle(peer, InEvent::TimerExpired(timer));
        }
    }

    fn handle(&mut self, peer: u32, event: InEvent<u32>) {
        let Some(state) = self.peers.get_mut(&peer) else {
            return;
        };
        let out = state.handle(event).collect::<Vec<_>>();
        for out in out {
            match out {
                OutEvent::SendMessage(to, message) => {
                    if !self.peers.contains_key(&to) {
                        // Dialing a dead peer fails.
                        self.inqueues
                            .entry(peer)
                            .or_default()
                            .push_back(InEvent::PeerDisconnected(to));
                        continue;
                    }
                    self.conns.insert(ordered(peer, to));
                    self.inqueues
                        .entry(to)
                        .or_default()
                        .push_back(InEvent::RecvMessage(peer, message));
                }
                OutEvent::EmitEvent(topic, event) => {
                    debug!(peer, ?topic, ?event, "emit");
                    self.events.push((peer, topic, event));
                }
                OutEvent::ScheduleTimer(delay, timer) => {
                    self.timers.insert(self.time + delay, (peer, timer));
                }
                OutEvent::DisconnectPeer(to) => {
                    self.conns.remove(&ordered(peer, to));
                }
                OutEvent::PeerData(_, _) => {}
            }
        }
    }

    /// Drains the emitted events, sorted.
    pub fn events(&mut self) -> Vec<(u32, TopicId, Event<u32>)> {
        let mut events = std::mem::take(&mut self.events);
        events.sort();
        events
    }

    /// The open connections, as ordered pairs.
    pub fn conns(&self) -> Vec<(u32, u32)> {
        self.conns.iter().copied().collect()
    }

    pub fn active_view(&self, peer: u32, topic: &TopicId) -> BTreeSet<u32> {
        self.peers
            .get(&peer)
            .and_then(|state| state.state(topic))
            .map(|state| state.active_peers().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_joined(&self, peer: u32, topic: &TopicId) -> bool {
        self.peers
            .get(&peer)
            .is_some_and(|state| state.state(topic).is_some())
    }

    /// Checks that every neighbor relation is mutual.
    pub fn assert_symmetric(&self, topic: &TopicId) {
        for peer in self.peers.keys() {
            for other in self.active_view(*peer, topic) {
                assert!(
                    self.active_view(other, topic).contains(peer),
                    "{peer} has {other} as neighbor but not the other way around"
                );
            }
        }
    }
}

fn ordered(a: u32, b: u32) -> (u32, u32) {
    if a < b { (a, b) } else { (b, a) }
}

fn messages_received(events: &[(u32, TopicId, Event<u32>)]) -> Vec<(u32, GossipMessage<u32>)> {
    events
        .iter()
        .filter_map(|(peer, _, event)| match event {
            Event::Received(message) => Some((*peer, message.clone())),
            _ => None,
        })
        .collect()
}

fn topic() -> TopicId {
    TopicId::from(blake3::hash(b"sim"))
}

fn network(peers: u32, config: Config) -> Network {
    let mut network = Network::new();
    for i in 0..peers {
        network.add_peer(i, config.clone());
    }
    network
}

#[test]
fn join_is_symmetric() {
    let topic = topic();
    let mut config = Config::default();
    config.membership.active_view_capacity = 2;
    let mut network = network(4, config);

    for i in 0..3 {
        network.command(i, topic, Command::Join(vec![]));
    }
    network.command(0, topic, Command::Join(vec![1, 2]));
    network.command(1, topic, Command::Join(vec![2]));
    network.ticks(10);

    let expected = vec![
        (0, topic, Event::NeighborUp(1)),
        (0, topic, Event::NeighborUp(2)),
        (1, topic, Event::NeighborUp(0)),
        (1, topic, Event::NeighborUp(2)),
        (2, topic, Event::NeighborUp(0)),
        (2, topic, Event::NeighborUp(1)),
    ];
    assert_eq!(network.events(), expected);
    assert_eq!(network.conns(), vec![(0, 1), (0, 2), (1, 2)]);
    network.assert_symmetric(&topic);

    // Peers that have not joined a topic ignore requests for it.
    let other = TopicId::from_bytes([1; 32]);
    network.command(3, other, Command::Join(vec![0]));
    network.ticks(5);
    assert!(network.events().is_empty());
    assert!(!network.is_joined(0, &other));
}

#[test]
fn full_view_evicts_a_neighbor() {
    let topic = topic();
    let mut config = Config::default();
    config.membership.active_view_capacity = 2;
    let mut network = network(4, config);
    for i in 0..4 {
        network.command(i, topic, Command::Join(vec![]));
    }
    network.command(0, topic, Command::Join(vec![1, 2]));
    network.command(1, topic, Command::Join(vec![2]));
    network.ticks(10);
    network.events();

    network.command(3, topic, Command::Join(vec![0]));
    network.ticks(20);

    let events = network.events();
    assert!(events.contains(&(3, topic, Event::NeighborUp(0))));
    assert!(events.contains(&(0, topic, Event::NeighborUp(3))));
    let evicted = events
        .iter()
        .filter_map(|(peer, _, event)| match (peer, event) {
            (0, Event::NeighborDown(evicted)) => Some(*evicted),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(evicted.len(), 1);
    assert!(events.contains(&(evicted[0], topic, Event::NeighborDown(0))));

    for i in 0..4 {
        assert!(network.active_view(i, &topic).len() <= 2);
    }
    assert!(network.active_view(0, &topic).contains(&3));
    network.assert_symmetric(&topic);
}

#[test]
fn broadcast_reaches_everyone_once() {
    let topic = topic();
    let mut network = network(6, Config::default());
    for i in 0..6 {
        network.command(i, topic, Command::Join(vec![]));
    }
    // Two separate swarms.
    network.command(1, topic, Command::Join(vec![0]));
    network.command(2, topic, Command::Join(vec![0]));
    network.command(4, topic, Command::Join(vec![3]));
    network.command(5, topic, Command::Join(vec![3]));
    network.ticks(12);
    network.events();
    network.assert_symmetric(&topic);

    network.command(1, topic, Command::Broadcast("hi1".into(), Scope::Swarm));
    network.ticks(12);
    let received = messages_received(&network.events());
    let mut receivers = received.iter().map(|(peer, _)| *peer).collect::<Vec<_>>();
    receivers.sort();
    assert_eq!(receivers, vec![0, 2]);

    // Connect the two swarms.
    network.command(2, topic, Command::Join(vec![5]));
    network.ticks(12);
    network.events();

    network.command(1, topic, Command::Broadcast("hi2".into(), Scope::Swarm));
    network.ticks(20);
    let received = messages_received(&network.events());
    let mut receivers = received.iter().map(|(peer, _)| *peer).collect::<Vec<_>>();
    receivers.sort();
    assert_eq!(receivers, vec![0, 2, 3, 4, 5]);
    for (_, message) in received {
        assert_eq!(message.origin, 1);
        assert_eq!(&message.content[..], b"hi2");
        assert!(matches!(message.scope, DeliveryScope::Swarm(_)));
    }
}

#[test]
fn messages_of_one_sender_arrive_in_order() {
    let topic = topic();
    let mut network = network(4, Config::default());
    for i in 0..4 {
        network.command(i, topic, Command::Join(vec![]));
    }
    network.command(1, topic, Command::Join(vec![0]));
    network.command(2, topic, Command::Join(vec![1]));
    network.command(3, topic, Command::Join(vec![2]));
    network.ticks(12);
    network.events();

    network.command(0, topic, Command::Broadcast("m1".into(), Scope::Swarm));
    network.command(0, topic, Command::Broadcast("m2".into(), Scope::Swarm));
    network.ticks(20);
    // in emission order, not sorted
    let events = std::mem::take(&mut network.events);
    for peer in 1..4 {
        let contents = messages_received(&events)
            .into_iter()
            .filter(|(p, _)| *p == peer)
            .map(|(_, message)| message.content)
            .collect::<Vec<_>>();
        assert_eq!(contents, vec![Bytes::from("m1"), Bytes::from("m2")], "peer {peer}");
    }
}

#[test]
fn neighbor_broadcast_stays_local() {
    let topic = topic();
    let mut network = network(4, Config::default());
    for i in 0..4 {
        network.command(i, topic, Command::Join(vec![]));
    }
    // Joins along a line, 0 - 1 - 2 - 3.
    network.command(0, topic, Command::Join(vec![1]));
    network.command(2, topic, Command::Join(vec![1]));
    network.command(3, topic, Command::Join(vec![2]));
    network.ticks(12);
    network.events();

    let neighbors = network.active_view(1, &topic);
    network.command(1, topic, Command::Broadcast("near".into(), Scope::Neighbors));
    network.ticks(12);
    let received = messages_received(&network.events());
    let receivers = received.iter().map(|(peer, _)| *peer).collect::<BTreeSet<_>>();
    assert_eq!(receivers, neighbors);
    assert_eq!(received.len(), neighbors.len());
    for (_, message) in received {
        assert_eq!(message.scope, DeliveryScope::Neighbors);
        assert_eq!(message.delivered_from, 1);
    }
}

#[test]
fn quit_leaves_the_swarm() {
    let topic = topic();
    let mut network = network(3, Config::default());
    for i in 0..3 {
        network.command(i, topic, Command::Join(vec![]));
    }
    network.command(1, topic, Command::Join(vec![0]));
    network.command(2, topic, Command::Join(vec![0]));
    network.ticks(10);
    network.events();

    network.command(0, topic, Command::Quit);
    network.ticks(10);
    assert!(!network.is_joined(0, &topic));
    let events = network.events();
    assert!(events.contains(&(1, topic, Event::NeighborDown(0))));
    assert!(events.contains(&(2, topic, Event::NeighborDown(0))));
    assert!(network.conns().iter().all(|(a, b)| *a != 0 && *b != 0));

    // Nothing is delivered to a peer that left.
    network.command(1, topic, Command::Broadcast("bye".into(), Scope::Swarm));
    network.ticks(10);
    assert!(messages_received(&network.events()).iter().all(|(peer, _)| *peer != 0));
}

#[test]
fn dead_neighbor_is_replaced() {
    let topic = topic();
    let mut config = Config::default();
    config.membership.active_view_capacity = 1;
    let mut network = network(3, config);
    for i in 0..3 {
        network.command(i, topic, Command::Join(vec![]));
    }
    network.command(1, topic, Command::Join(vec![0]));
    network.ticks(5);
    network.command(2, topic, Command::Join(vec![0]));
    network.ticks(10);
    network.events();
    // 0 kept only 2, 1 was moved to the passive view of 0.
    assert_eq!(network.active_view(0, &topic), BTreeSet::from([2]));

    network.kill(2);
    network.ticks(10);
    assert_eq!(network.active_view(0, &topic), BTreeSet::from([1]));
    network.assert_symmetric(&topic);
}
