//! Per document and peer sync bookkeeping of the live engine.

use std::{
    collections::HashMap,
    time::{Duration, Instant, SystemTime},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    NamespaceId,
    net::{AbortReason, AcceptOutcome},
};
use crate::key::PeerId;

/// A new neighbor that we synced with this recently is not synced with again.
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Why we started a sync request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum SyncReason {
    /// Direct join request via API
    DirectJoin,
    /// Peer showed up as new neighbor in the gossip swarm
    NewNeighbor,
    /// A sync request arrived while one was running, so run again afterwards
    Resync,
}

/// Why we performed a sync exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub enum Origin {
    /// We initiated the exchange
    Connect(SyncReason),
    /// A peer connected to us and we accepted the exchange
    Accept,
}

#[derive(Debug, Clone, Default)]
enum SyncState {
    #[default]
    Idle,
    Running {
        start: SystemTime,
        origin: Origin,
    },
}

/// Contains an entry for each syncing namespace, and in there an entry for each peer we
/// synced with.
#[derive(Debug, Default)]
pub(crate) struct NamespaceStates(HashMap<NamespaceId, NamespaceState>);

#[derive(Debug, Default)]
struct NamespaceState {
    peers: HashMap<PeerId, PeerState>,
    may_emit_ready: bool,
}

impl NamespaceStates {
    /// Are we syncing this namespace?
    pub(crate) fn is_syncing(&self, namespace: &NamespaceId) -> bool {
        self.0.contains_key(namespace)
    }

    /// Inserts a namespace into the set of syncing namespaces.
    pub(crate) fn insert(&mut self, namespace: NamespaceId) {
        self.0.entry(namespace).or_default();
    }

    /// Removes a namespace from the set of syncing namespaces.
    pub(crate) fn remove(&mut self, namespace: &NamespaceId) -> bool {
        self.0.remove(namespace).is_some()
    }

    /// Starts a sync request.
    ///
    /// Returns true if the request should be performed, and false if it should be aborted.
    pub(crate) fn start_connect(
        &mut self,
        namespace: &NamespaceId,
        peer: PeerId,
        reason: SyncReason,
    ) -> bool {
        let Some(state) = self.entry(namespace, peer) else {
            debug!("abort connect: namespace is not in sync set");
            return false;
        };
        state.start_connect(Instant::now(), reason)
    }

    /// Decides on an incoming sync request.
    pub(crate) fn accept_request(
        &mut self,
        me: &PeerId,
        namespace: &NamespaceId,
        peer: PeerId,
    ) -> AcceptOutcome {
        let Some(state) = self.entry(namespace, peer) else {
            return AcceptOutcome::Reject(AbortReason::NotFound);
        };
        state.accept_request(me, &peer)
    }

    /// Records a finished sync operation.
    ///
    /// Returns the time the operation was started, and whether another sync should run right
    /// afterwards. Returns `None` if the namespace is not syncing or no sync was running.
    pub(crate) fn finish(
        &mut self,
        namespace: &NamespaceId,
        peer: PeerId,
        origin: &Origin,
        success: bool,
    ) -> Option<(SystemTime, bool)> {
        let state = self.entry(namespace, peer)?;
        state.finish(origin, success)
    }

    /// Resets a sync we initiated that the remote refused, unless an accepted sync replaced it.
    pub(crate) fn abort_connect(&mut self, namespace: &NamespaceId, peer: PeerId, reason: SyncReason) {
        if let Some(state) = self.entry(namespace, peer) {
            if matches!(state.state, SyncState::Running { origin: Origin::Connect(r), .. } if r == reason)
            {
                state.state = SyncState::Idle;
            }
        }
    }

    /// Whether a `PendingContentReady` event may be emitted for the namespace.
    pub(crate) fn may_emit_ready(&self, namespace: &NamespaceId) -> Option<bool> {
        self.0.get(namespace).map(|state| state.may_emit_ready)
    }

    pub(crate) fn set_may_emit_ready(&mut self, namespace: &NamespaceId, value: bool) {
        if let Some(state) = self.0.get_mut(namespace) {
            state.may_emit_ready = value;
        }
    }

    /// The state of a peer, created on first use. `None` if the namespace is not syncing.
    fn entry(&mut self, namespace: &NamespaceId, peer: PeerId) -> Option<&mut PeerState> {
        self.0
            .get_mut(namespace)
            .map(|n| n.peers.entry(peer).or_default())
    }
}

/// State of a peer with regard to a namespace.
#[derive(Debug, Default)]
struct PeerState {
    state: SyncState,
    resync_requested: bool,
    /// When the last sync finished, and whether it succeeded.
    last_sync: Option<(Instant, bool)>,
}

impl PeerState {
    fn finish(&mut self, origin: &Origin, success: bool) -> Option<(SystemTime, bool)> {
        let start = match &self.state {
            SyncState::Running {
                start,
                origin: origin2,
            } => {
                if origin2 != origin {
                    warn!(actual = ?origin, expected = ?origin2, "finished sync origin does not match state")
                }
                Some(*start)
            }
            SyncState::Idle => {
                warn!("sync state finish called but not in running state");
                None
            }
        };

        self.last_sync = Some((Instant::now(), success));
        self.state = SyncState::Idle;
        start.map(|s| (s, self.resync_requested))
    }

    fn start_connect(&mut self, now: Instant, reason: SyncReason) -> bool {
        let start_sync = match self.state {
            // never run two syncs at the same time
            SyncState::Running { .. } => {
                if matches!(reason, SyncReason::DirectJoin) {
                    debug!("sync already running, resync queued");
                    self.resync_requested = true;
                } else {
                    debug!("abort connect: sync already running");
                }
                false
            }
            SyncState::Idle => match (reason, &self.last_sync) {
                (SyncReason::NewNeighbor, Some((time, true))) => {
                    let do_sync = now
                        .checked_duration_since(*time)
                        .map(|duration| duration > RESYNC_INTERVAL)
                        .unwrap_or(true);
                    if !do_sync {
                        debug!("abort connect: last sync too recent for new neighbor sync");
                    }
                    do_sync
                }
                (_, _) => true,
            },
        };
        if start_sync {
            self.set_sync_running(Origin::Connect(reason));
        }
        start_sync
    }

    fn accept_request(&mut self, me: &PeerId, peer: &PeerId) -> AcceptOutcome {
        let outcome = match &self.state {
            SyncState::Idle => AcceptOutcome::Allow,
            SyncState::Running { origin, .. } => match origin {
                Origin::Accept => AcceptOutcome::Reject(AbortReason::AlreadySyncing),
                // Both sides dialed at the same time. The byte order of the peer ids decides
                // which of the two connections carries the sync.
                Origin::Connect(_reason) => match expected_sync_direction(me, peer) {
                    SyncDirection::Accept => AcceptOutcome::Allow,
                    SyncDirection::Connect => AcceptOutcome::Reject(AbortReason::AlreadySyncing),
                },
            },
        };
        if let AcceptOutcome::Allow = outcome {
            self.set_sync_running(Origin::Accept);
        }
        outcome
    }

    fn set_sync_running(&mut self, origin: Origin) {
        self.state = SyncState::Running {
            origin,
            start: SystemTime::now(),
        };
        self.resync_requested = false;
    }
}

#[derive(Debug)]
enum SyncDirection {
    Accept,
    Connect,
}

fn expected_sync_direction(self_peer_id: &PeerId, other_peer_id: &PeerId) -> SyncDirection {
    if self_peer_id.as_bytes() > other_peer_id.as_bytes() {
        SyncDirection::Accept
    } else {
        SyncDirection::Connect
    }
}

#[cfg(test)]
mod tests {
    use iroh::SecretKey;
    use rand::SeedableRng;

    use super::*;

    fn peers() -> (PeerId, PeerId) {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
        let a = SecretKey::generate(&mut rng).public();
        let b = SecretKey::generate(&mut rng).public();
        if a.as_bytes() < b.as_bytes() { (a, b) } else { (b, a) }
    }

    #[test]
    fn concurrent_dials_pick_one_direction() {
        let (low, high) = peers();
        let namespace = NamespaceId::from_bytes([1; 32]);

        let mut low_states = NamespaceStates::default();
        let mut high_states = NamespaceStates::default();
        low_states.insert(namespace);
        high_states.insert(namespace);
        assert!(low_states.start_connect(&namespace, high, SyncReason::DirectJoin));
        assert!(high_states.start_connect(&namespace, low, SyncReason::DirectJoin));

        // The higher id accepts the incoming request, the lower one keeps its own dial.
        assert_eq!(
            high_states.accept_request(&high, &namespace, low),
            AcceptOutcome::Allow
        );
        assert_eq!(
            low_states.accept_request(&low, &namespace, high),
            AcceptOutcome::Reject(AbortReason::AlreadySyncing)
        );
    }

    #[test]
    fn new_neighbor_does_not_resync_right_away() {
        let (_, peer) = peers();
        let namespace = NamespaceId::from_bytes([2; 32]);
        let mut states = NamespaceStates::default();
        assert!(!states.start_connect(&namespace, peer, SyncReason::DirectJoin));

        states.insert(namespace);
        assert!(states.start_connect(&namespace, peer, SyncReason::DirectJoin));
        assert!(!states.start_connect(&namespace, peer, SyncReason::NewNeighbor));
        assert!(!states.start_connect(&namespace, peer, SyncReason::DirectJoin));
        let (_, resync) = states
            .finish(&namespace, peer, &Origin::Connect(SyncReason::DirectJoin), true)
            .unwrap();
        assert!(resync);

        assert!(!states.start_connect(&namespace, peer, SyncReason::NewNeighbor));
        assert!(states.start_connect(&namespace, peer, SyncReason::Resync));
        states.finish(&namespace, peer, &Origin::Connect(SyncReason::Resync), false);
        // After a failure a new neighbor is synced with again.
        assert!(states.start_connect(&namespace, peer, SyncReason::NewNeighbor));
    }

    #[test]
    fn refused_connect_is_reset() {
        let (me, peer) = peers();
        let namespace = NamespaceId::from_bytes([3; 32]);
        let mut states = NamespaceStates::default();
        states.insert(namespace);
        assert!(states.start_connect(&namespace, peer, SyncReason::DirectJoin));
        states.abort_connect(&namespace, peer, SyncReason::DirectJoin);
        assert!(states.start_connect(&namespace, peer, SyncReason::DirectJoin));

        // An accepted sync that replaced our dial is left alone.
        assert_eq!(
            states.accept_request(&me, &namespace, peer),
            if me.as_bytes() > peer.as_bytes() {
                AcceptOutcome::Allow
            } else {
                AcceptOutcome::Reject(AbortReason::AlreadySyncing)
            }
        );
        states.abort_connect(&namespace, peer, SyncReason::DirectJoin);
        if me.as_bytes() > peer.as_bytes() {
            assert!(!states.start_connect(&namespace, peer, SyncReason::NewNeighbor));
        }
    }
}
