//! The node's QUIC endpoint.
//!
//! Wraps [`iroh::Endpoint`] with an address book of known peers and coalescing of concurrent
//! dials to the same peer and ALPN.

use std::{
    collections::{BTreeMap, HashMap},
    net::{SocketAddrV4, SocketAddrV6},
    sync::Arc,
};

use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use iroh::{
    discovery::static_provider::StaticProvider,
    endpoint::Connection,
    NodeAddr, RelayMode, SecretKey,
};
use parking_lot::{Mutex, RwLock};
use snafu::ResultExt;
use tracing::{debug, trace};

use crate::{
    error::{BindSnafu, ConfigSnafu, ConnectSnafu, Result},
    key::{EndpointAddr, PeerId},
};

/// Options for binding an [`Endpoint`].
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Identity to reuse. A fresh one is generated when unset.
    pub secret_key: Option<SecretKey>,
    /// IPv4 socket to bind. Defaults to an ephemeral port on all interfaces.
    pub ipv4_addr: Option<SocketAddrV4>,
    /// IPv6 socket to bind. Defaults to an ephemeral port on all interfaces.
    pub ipv6_addr: Option<SocketAddrV6>,
    /// Whether to publish and resolve addresses through the n0 discovery services.
    pub discovery: bool,
    /// Relay servers to use.
    pub relay_mode: RelayMode,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            secret_key: None,
            ipv4_addr: None,
            ipv6_addr: None,
            discovery: true,
            relay_mode: RelayMode::Default,
        }
    }
}

type PendingConnect = Shared<BoxFuture<'static, Result<Connection, String>>>;

/// A bound endpoint.
///
/// Cheap to clone.
#[derive(Debug, Clone)]
pub struct Endpoint {
    inner: iroh::Endpoint,
    book: Arc<AddressBook>,
    relay_disabled: bool,
}

#[derive(derive_more::Debug, Default)]
struct AddressBook {
    /// Resolves peer ids for the endpoint, holds the same records as `known`.
    provider: StaticProvider,
    known: RwLock<BTreeMap<PeerId, Arc<EndpointAddr>>>,
    #[debug("{} pending", pending.lock().len())]
    pending: Mutex<HashMap<(PeerId, Vec<u8>), PendingConnect>>,
}

impl Endpoint {
    /// Binds a new endpoint.
    pub async fn bind(options: EndpointOptions) -> Result<Self> {
        if let Some(addr) = options.ipv4_addr {
            if addr.ip().is_multicast() {
                return Err(ConfigSnafu {
                    message: format!("cannot bind to multicast address {addr}"),
                }
                .build());
            }
        }

        let book = Arc::new(AddressBook::default());
        let relay_disabled = options.relay_mode == RelayMode::Disabled;
        let mut builder = iroh::Endpoint::builder()
            .relay_mode(options.relay_mode)
            .add_discovery(book.provider.clone());
        if options.discovery {
            builder = builder.discovery_n0();
        }
        if let Some(secret_key) = options.secret_key {
            builder = builder.secret_key(secret_key);
        }
        if let Some(addr) = options.ipv4_addr {
            builder = builder.bind_addr_v4(addr);
        }
        if let Some(addr) = options.ipv6_addr {
            builder = builder.bind_addr_v6(addr);
        }
        let inner = builder.bind().await.context(BindSnafu)?;
        debug!(me = %inner.node_id().fmt_short(), "endpoint bound");
        Ok(Self {
            inner,
            book,
            relay_disabled,
        })
    }

    pub(crate) fn inner(&self) -> &iroh::Endpoint {
        &self.inner
    }

    /// Our peer id.
    pub fn peer_id(&self) -> PeerId {
        self.inner.node_id()
    }

    /// Our secret key.
    pub fn secret_key(&self) -> &SecretKey {
        self.inner.secret_key()
    }

    /// Waits until we have at least one reachable address.
    ///
    /// With relays configured this waits for a home relay, which never happens when fully
    /// offline. Without relays the bound direct addresses suffice.
    pub async fn online(&self) {
        if self.relay_disabled {
            return;
        }
        self.inner.online().await;
    }

    /// Snapshot of our current address.
    pub fn addr(&self) -> EndpointAddr {
        self.inner.node_addr().into()
    }

    /// Records how to reach a peer, replacing whatever was known before.
    pub fn add_known_addr(&self, addr: EndpointAddr) {
        if addr.is_empty() {
            return;
        }
        trace!(remote = %addr.peer_id.fmt_short(), "add known addr");
        let node_addr = NodeAddr::from(addr.clone());
        let mut known = self.book.known.write();
        self.book.provider.set_node_addr(node_addr);
        known.insert(addr.peer_id, Arc::new(addr));
    }

    /// The address we know for `peer`, if any.
    pub fn known_addr(&self, peer: &PeerId) -> Option<EndpointAddr> {
        self.book.known.read().get(peer).map(|a| EndpointAddr::clone(a))
    }

    /// Connects to a peer with the given ALPN.
    ///
    /// Concurrent calls for the same peer and ALPN share one dial. If `target` carries no
    /// addressing info, the address book and discovery are used.
    pub async fn connect(
        &self,
        target: impl Into<EndpointAddr>,
        alpn: &[u8],
    ) -> Result<Connection> {
        let target = target.into();
        let peer = target.peer_id;
        if !target.is_empty() {
            self.add_known_addr(target.clone());
        }
        let dial_addr = match self.known_addr(&peer) {
            Some(known) if target.is_empty() => known,
            _ => target,
        };

        let key = (peer, alpn.to_vec());
        let fut = {
            let mut pending = self.book.pending.lock();
            pending
                .entry(key.clone())
                .or_insert_with(|| {
                    let inner = self.inner.clone();
                    let alpn = alpn.to_vec();
                    async move {
                        inner
                            .connect(NodeAddr::from(dial_addr), &alpn)
                            .await
                            .map_err(|err| format!("{err:#}"))
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };
        let res = fut.clone().await;
        {
            let mut pending = self.book.pending.lock();
            if pending.get(&key).is_some_and(|f| f.ptr_eq(&fut)) {
                pending.remove(&key);
            }
        }
        res.map_err(|reason| ConnectSnafu { peer, reason }.build())
    }

    /// Closes all connections and the sockets.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Returns `true` once [`Self::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// The authenticated peer id of a connection.
pub(crate) fn remote_peer(conn: &Connection) -> anyhow::Result<PeerId> {
    Ok(conn.remote_node_id()?)
}
