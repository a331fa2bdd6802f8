//! The gossip protocol as a state machine without IO.
//!
//! [`State`] takes [`InEvent`]s and returns [`OutEvent`]s. The networking actor in
//! [`crate::gossip`] drives it with messages from connections, commands from topic handles and
//! expired timers. Keeping the protocol free of IO makes it testable with a simulated network.

use std::{fmt, hash::Hash};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub mod hyparview;
pub mod plumtree;
pub mod state;
pub mod topic;
pub(crate) mod util;

#[cfg(test)]
mod sim;

pub use self::{
    plumtree::{DeliveryScope, GossipMessage, Scope},
    state::{InEvent, Message, OutEvent, State, Timer, TopicId},
    topic::{Command, Config, Event, IO},
};

/// Identifies a peer in protocol messages.
///
/// The network layer uses [`crate::key::PeerId`]; tests use small integers.
pub trait PeerAddress: Hash + Eq + Copy + Ord + fmt::Debug + Serialize + DeserializeOwned {}
impl<T> PeerAddress for T where T: Hash + Eq + Copy + Ord + fmt::Debug + Serialize + DeserializeOwned {}

/// Opaque bytes sent along when a peer is introduced to others.
///
/// The node puts the encoded addresses of the peer here, so receivers can dial it.
pub type PeerData = bytes::Bytes;

/// A peer together with its [`PeerData`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PeerInfo<PA> {
    /// The peer.
    pub id: PA,
    /// How to reach it.
    pub data: PeerData,
}
