//! Peer identities and network addresses.

use std::{collections::BTreeSet, net::SocketAddr};

use iroh::{NodeAddr, RelayUrl};
use serde::{Deserialize, Serialize};

/// Network identity of a node: its ed25519 public key.
///
/// Equality and ordering are byte-wise.
pub type PeerId = iroh::NodeId;

/// Everything known about how to reach a peer.
///
/// A node holds at most one of these per peer. Updates replace the whole record,
/// the direct address set is never merged.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointAddr {
    /// The identity of the peer.
    pub peer_id: PeerId,
    /// The home relay of the peer.
    pub relay_url: Option<RelayUrl>,
    /// Socket addresses where the peer might be reached directly.
    pub direct_addrs: BTreeSet<SocketAddr>,
}

impl EndpointAddr {
    /// Creates an address with only the peer id.
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            relay_url: None,
            direct_addrs: Default::default(),
        }
    }

    /// Adds a relay url.
    pub fn with_relay_url(mut self, relay_url: RelayUrl) -> Self {
        self.relay_url = Some(relay_url);
        self
    }

    /// Adds direct addresses.
    pub fn with_direct_addrs(mut self, addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.direct_addrs.extend(addrs);
        self
    }

    /// Returns `true` if neither a relay url nor direct addresses are known.
    pub fn is_empty(&self) -> bool {
        self.relay_url.is_none() && self.direct_addrs.is_empty()
    }

    /// Strips the parts of the address that `opts` excludes.
    pub fn apply_options(&mut self, opts: AddrInfoOptions) {
        match opts {
            AddrInfoOptions::Id => {
                self.direct_addrs.clear();
                self.relay_url = None;
            }
            AddrInfoOptions::RelayAndAddresses => {}
            AddrInfoOptions::Relay => {
                self.direct_addrs.clear();
            }
            AddrInfoOptions::Addresses => {
                self.relay_url = None;
            }
        }
    }
}

impl From<PeerId> for EndpointAddr {
    fn from(peer_id: PeerId) -> Self {
        Self::new(peer_id)
    }
}

impl From<NodeAddr> for EndpointAddr {
    fn from(addr: NodeAddr) -> Self {
        Self {
            peer_id: addr.node_id,
            relay_url: addr.relay_url().cloned(),
            direct_addrs: addr.direct_addresses().copied().collect(),
        }
    }
}

impl From<EndpointAddr> for NodeAddr {
    fn from(addr: EndpointAddr) -> Self {
        NodeAddr::from_parts(addr.peer_id, addr.relay_url, addr.direct_addrs)
    }
}

/// Selects what goes into an address embedded in a ticket.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    Default,
    Debug,
    derive_more::Display,
    derive_more::FromStr,
    Serialize,
    Deserialize,
)]
pub enum AddrInfoOptions {
    /// Only the peer id is added.
    ///
    /// The receiver has to rely on discovery to find addresses.
    Id,
    /// Both the relay url and the direct addresses.
    #[default]
    RelayAndAddresses,
    /// The relay url only.
    Relay,
    /// The direct addresses only.
    Addresses,
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use iroh::SecretKey;
    use rand::SeedableRng;

    use super::*;

    fn addr() -> EndpointAddr {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
        let peer_id = SecretKey::generate(&mut rng).public();
        EndpointAddr::new(peer_id)
            .with_relay_url("https://relay.example.org./".parse().unwrap())
            .with_direct_addrs([SocketAddr::from((Ipv4Addr::LOCALHOST, 1234))])
    }

    #[test]
    fn apply_options() {
        let full = addr();

        let mut a = full.clone();
        a.apply_options(AddrInfoOptions::Id);
        assert!(a.is_empty());

        let mut a = full.clone();
        a.apply_options(AddrInfoOptions::Relay);
        assert!(a.direct_addrs.is_empty());
        assert!(a.relay_url.is_some());

        let mut a = full.clone();
        a.apply_options(AddrInfoOptions::Addresses);
        assert!(a.relay_url.is_none());
        assert_eq!(a.direct_addrs.len(), 1);

        let mut a = full.clone();
        a.apply_options(AddrInfoOptions::RelayAndAddresses);
        assert_eq!(a, full);
    }

    #[test]
    fn node_addr_conversion() {
        let a = addr();
        let node_addr: NodeAddr = a.clone().into();
        assert_eq!(node_addr.node_id, a.peer_id);
        assert_eq!(EndpointAddr::from(node_addr), a);
    }

    #[test]
    fn addr_options_from_str() {
        let opts: AddrInfoOptions = "Relay".parse().unwrap();
        assert_eq!(opts, AddrInfoOptions::Relay);
    }
}
