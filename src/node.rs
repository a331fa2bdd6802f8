//! Node API.
//!
//! A [`Node`] binds an [`Endpoint`] and runs the blobs, gossip and (optionally) docs protocols
//! on it. Memory nodes keep everything in RAM, persistent nodes keep their identity and data
//! below one root directory:
//!
//! ```text
//! <root>/secret.key   raw 32 byte secret key
//! <root>/blobs/       blob data and outboards
//! <root>/tags.redb    tags
//! <root>/docs.redb    documents and authors, when docs are enabled
//! ```

use std::{
    net::{SocketAddrV4, SocketAddrV6},
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use iroh::{RelayMode, SecretKey};
use n0_future::task::AbortOnDropHandle;
use tracing::{debug, info};

use crate::{
    blobs::{self, Blobs, ExtraRoots, Tags},
    docs::{self, Docs, SYNC_ALPN},
    endpoint::{Endpoint, EndpointOptions},
    error::{ConfigSnafu, Result},
    gossip::{GOSSIP_ALPN, Gossip, GossipOptions},
    key::{EndpointAddr, PeerId},
    protocol::Router,
};

const SECRET_KEY_FILE: &str = "secret.key";
const BLOBS_DIR: &str = "blobs";
const TAGS_FILE: &str = "tags.redb";
const DOCS_FILE: &str = "docs.redb";

/// Options for spawning a [`Node`].
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// How often to run garbage collection on the blob store, in milliseconds.
    ///
    /// `None` or `Some(0)` disables garbage collection.
    pub gc_interval_millis: Option<u64>,
    /// Whether to run the docs protocol.
    pub enable_docs: bool,
    /// IPv4 socket to bind.
    pub ipv4_addr: Option<SocketAddrV4>,
    /// IPv6 socket to bind.
    pub ipv6_addr: Option<SocketAddrV6>,
    /// Whether to publish and resolve addresses through the n0 discovery services.
    pub node_discovery: bool,
    /// Identity of the node. Persistent nodes load or create `secret.key` when unset.
    pub secret_key: Option<SecretKey>,
    /// Relay servers to use.
    pub relay_mode: RelayMode,
    /// Gossip protocol tuning.
    pub gossip: GossipOptions,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            gc_interval_millis: None,
            enable_docs: false,
            ipv4_addr: None,
            ipv6_addr: None,
            node_discovery: true,
            secret_key: None,
            relay_mode: RelayMode::Default,
            gossip: GossipOptions::default(),
        }
    }
}

impl NodeOptions {
    /// Sets the secret key from its raw bytes, which must be exactly 32 bytes long.
    pub fn with_secret_key_bytes(mut self, bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            ConfigSnafu {
                message: format!("secret key must be 32 bytes, got {}", bytes.len()),
            }
            .build()
        })?;
        self.secret_key = Some(SecretKey::from_bytes(&bytes));
        Ok(self)
    }

    /// Parses and sets the IPv4 bind address, e.g. `"0.0.0.0:11204"`.
    pub fn with_ipv4_addr(mut self, addr: &str) -> Result<Self> {
        self.ipv4_addr = Some(parse_addr(addr)?);
        Ok(self)
    }

    /// Parses and sets the IPv6 bind address, e.g. `"[::]:11205"`.
    pub fn with_ipv6_addr(mut self, addr: &str) -> Result<Self> {
        self.ipv6_addr = Some(parse_addr(addr)?);
        Ok(self)
    }

    fn gc_interval(&self) -> Option<Duration> {
        self.gc_interval_millis
            .filter(|millis| *millis > 0)
            .map(Duration::from_millis)
    }
}

fn parse_addr<T: std::str::FromStr>(addr: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    addr.parse().map_err(|err| {
        ConfigSnafu {
            message: format!("invalid bind address {addr:?}: {err}"),
        }
        .build()
    })
}

/// Where a node keeps its data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StorageConfig {
    /// In memory, lost when the node is dropped.
    #[default]
    Mem,
    /// Below the given root directory.
    Persistent(PathBuf),
}

/// Builder for a [`Node`].
#[derive(Debug, Default)]
pub struct NodeBuilder {
    storage: StorageConfig,
    options: NodeOptions,
}

impl NodeBuilder {
    /// Replaces all options at once.
    pub fn options(mut self, options: NodeOptions) -> Self {
        self.options = options;
        self
    }

    /// Keeps all data below `root`.
    pub fn persist(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage = StorageConfig::Persistent(root.into());
        self
    }

    /// Runs the docs protocol.
    pub fn enable_docs(mut self) -> Self {
        self.options.enable_docs = true;
        self
    }

    /// Runs garbage collection every `interval`. A zero interval disables it.
    pub fn gc_interval(mut self, interval: Duration) -> Self {
        let millis = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self.options.gc_interval_millis = Some(millis);
        self
    }

    /// Uses the given identity.
    pub fn secret_key(mut self, secret_key: SecretKey) -> Self {
        self.options.secret_key = Some(secret_key);
        self
    }

    /// Binds the IPv4 socket to `addr`.
    pub fn bind_addr_v4(mut self, addr: SocketAddrV4) -> Self {
        self.options.ipv4_addr = Some(addr);
        self
    }

    /// Binds the IPv6 socket to `addr`.
    pub fn bind_addr_v6(mut self, addr: SocketAddrV6) -> Self {
        self.options.ipv6_addr = Some(addr);
        self
    }

    /// Enables or disables the n0 discovery services.
    pub fn node_discovery(mut self, enabled: bool) -> Self {
        self.options.node_discovery = enabled;
        self
    }

    /// Sets the relay servers to use.
    pub fn relay_mode(mut self, relay_mode: RelayMode) -> Self {
        self.options.relay_mode = relay_mode;
        self
    }

    /// Sets the gossip protocol tuning.
    pub fn gossip(mut self, options: GossipOptions) -> Self {
        self.options.gossip = options;
        self
    }

    /// Opens the stores, binds the endpoint and starts all protocols.
    pub async fn spawn(self) -> Result<Node> {
        let Self { storage, options } = self;
        let (blob_store, tags, docs_store, secret_key) = match &storage {
            StorageConfig::Mem => {
                let docs_store = match options.enable_docs {
                    true => Some(docs::Store::memory()?),
                    false => None,
                };
                (
                    blobs::Store::memory(),
                    Tags::memory()?,
                    docs_store,
                    options.secret_key.clone(),
                )
            }
            StorageConfig::Persistent(root) => {
                tokio::fs::create_dir_all(root).await?;
                let blob_store = blobs::Store::persistent(root.join(BLOBS_DIR)).await?;
                let tags = Tags::persistent(root.join(TAGS_FILE))?;
                let docs_store = match options.enable_docs {
                    true => Some(docs::Store::persistent(root.join(DOCS_FILE))?),
                    false => None,
                };
                let secret_key = match options.secret_key.clone() {
                    Some(secret_key) => secret_key,
                    None => load_secret_key(root.join(SECRET_KEY_FILE)).await?,
                };
                (blob_store, tags, docs_store, Some(secret_key))
            }
        };

        let endpoint = Endpoint::bind(EndpointOptions {
            secret_key,
            ipv4_addr: options.ipv4_addr,
            ipv6_addr: options.ipv6_addr,
            discovery: options.node_discovery,
            relay_mode: options.relay_mode.clone(),
        })
        .await?;

        // Document contents are not tagged, the docs store keeps them alive.
        let extra_roots = docs_store.clone().map(|store| {
            let roots: ExtraRoots = Arc::new(move || store.content_hashes());
            roots
        });
        let blobs = Blobs::new(endpoint.clone(), blob_store, tags, extra_roots);
        let gossip = Gossip::spawn(endpoint.clone(), options.gossip.clone());
        let docs = docs_store
            .map(|store| Docs::spawn(endpoint.clone(), gossip.clone(), blobs.clone(), store))
            .transpose()?;

        let mut router = Router::builder(endpoint.clone())
            .accept(blobs::protocol::ALPN, blobs.protocol())
            .accept(GOSSIP_ALPN, gossip.clone());
        if let Some(docs) = &docs {
            router = router.accept(SYNC_ALPN, docs.clone());
        }
        let router = router.spawn();

        let gc_task = options
            .gc_interval()
            .and_then(|period| blobs.spawn_gc(period));

        info!(
            me = %endpoint.peer_id().fmt_short(),
            storage = ?storage,
            docs = docs.is_some(),
            gc = gc_task.is_some(),
            "node started"
        );
        Ok(Node {
            inner: Arc::new(NodeInner {
                router,
                blobs,
                gossip,
                docs,
                _gc_task: gc_task,
            }),
        })
    }
}

/// Loads the secret key stored at `path`, creating and storing a new one if the file is
/// missing.
async fn load_secret_key(path: PathBuf) -> Result<SecretKey> {
    match tokio::fs::read(&path).await {
        Ok(bytes) => {
            let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                ConfigSnafu {
                    message: format!("invalid secret key file {}", path.display()),
                }
                .build()
            })?;
            Ok(SecretKey::from_bytes(&bytes))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let secret_key = SecretKey::generate(&mut rand::rngs::OsRng);
            // Write next to the target and move, so a crash never leaves a truncated key.
            let temp_path = path.with_extension("key.tmp");
            tokio::fs::write(&temp_path, secret_key.to_bytes()).await?;
            tokio::fs::rename(&temp_path, &path).await?;
            debug!(path = %path.display(), "created secret key");
            Ok(secret_key)
        }
        Err(err) => Err(err.into()),
    }
}

/// A running node. Cheap to clone.
///
/// Dropping the last clone aborts all tasks, [`Node::shutdown`] stops them gracefully.
#[derive(Debug, Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

#[derive(derive_more::Debug)]
struct NodeInner {
    router: Router,
    blobs: Blobs,
    gossip: Gossip,
    docs: Option<Docs>,
    #[debug(skip)]
    _gc_task: Option<AbortOnDropHandle<()>>,
}

impl Node {
    /// Returns a builder for a node, in memory unless [`NodeBuilder::persist`] is called.
    pub fn builder() -> NodeBuilder {
        NodeBuilder::default()
    }

    /// Spawns a node that keeps everything in memory.
    pub async fn memory() -> Result<Self> {
        Self::memory_with_options(NodeOptions::default()).await
    }

    /// Spawns an in-memory node with the given options.
    pub async fn memory_with_options(options: NodeOptions) -> Result<Self> {
        Self::builder().options(options).spawn().await
    }

    /// Spawns a node that keeps its data below `root`.
    pub async fn persistent(root: impl AsRef<Path>) -> Result<Self> {
        Self::persistent_with_options(root, NodeOptions::default()).await
    }

    /// Spawns a persistent node with the given options.
    pub async fn persistent_with_options(
        root: impl AsRef<Path>,
        options: NodeOptions,
    ) -> Result<Self> {
        Self::builder()
            .options(options)
            .persist(root.as_ref())
            .spawn()
            .await
    }

    /// The endpoint of the node.
    pub fn endpoint(&self) -> &Endpoint {
        self.inner.router.endpoint()
    }

    /// Our identity and addressing.
    pub fn net(&self) -> Net {
        Net {
            endpoint: self.endpoint().clone(),
        }
    }

    /// The blobs API.
    pub fn blobs(&self) -> &Blobs {
        &self.inner.blobs
    }

    /// The gossip API.
    pub fn gossip(&self) -> &Gossip {
        &self.inner.gossip
    }

    /// The docs API. Fails with [`crate::Error::Config`] if docs are not enabled.
    pub fn docs(&self) -> Result<&Docs> {
        self.inner.docs.as_ref().ok_or_else(|| {
            ConfigSnafu {
                message: "docs are not enabled on this node",
            }
            .build()
        })
    }

    /// Stops all protocols and closes the endpoint.
    ///
    /// Documents leave their swarms first, then gossip, then the accept loop and the endpoint
    /// go down.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(docs) = &self.inner.docs {
            docs.shutdown().await;
        }
        self.inner.gossip.shutdown().await;
        self.inner.router.shutdown().await?;
        debug!("node shut down");
        Ok(())
    }
}

/// Identity and addressing of a node.
#[derive(Debug, Clone)]
pub struct Net {
    endpoint: Endpoint,
}

impl Net {
    /// Our peer id.
    pub fn node_id(&self) -> PeerId {
        self.endpoint.peer_id()
    }

    /// Our current address.
    pub fn node_addr(&self) -> EndpointAddr {
        self.endpoint.addr()
    }

    /// Waits until the node is reachable.
    pub async fn wait_online(&self) {
        self.endpoint.online().await
    }

    /// Records how to reach a peer.
    pub fn add_node_addr(&self, addr: EndpointAddr) {
        self.endpoint.add_known_addr(addr)
    }

    /// The address we know for `peer`, if any.
    pub fn remote_addr(&self, peer: &PeerId) -> Option<EndpointAddr> {
        self.endpoint.known_addr(peer)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tracing_test::traced_test;

    use super::*;

    fn local_options() -> NodeOptions {
        NodeOptions {
            node_discovery: false,
            relay_mode: RelayMode::Disabled,
            ..Default::default()
        }
    }

    #[test]
    fn secret_key_bytes_are_checked() {
        let err = NodeOptions::default()
            .with_secret_key_bytes(&[7; 31])
            .unwrap_err();
        assert!(matches!(err, crate::Error::Config { .. }));
        let options = NodeOptions::default()
            .with_secret_key_bytes(&[7; 32])
            .unwrap();
        assert_eq!(
            options.secret_key.unwrap().public(),
            SecretKey::from_bytes(&[7; 32]).public()
        );
    }

    #[test]
    fn bind_addresses_are_parsed() {
        let options = NodeOptions::default()
            .with_ipv4_addr("127.0.0.1:0")
            .unwrap()
            .with_ipv6_addr("[::1]:0")
            .unwrap();
        assert_eq!(options.ipv4_addr.unwrap().ip().octets(), [127, 0, 0, 1]);
        assert!(options.ipv6_addr.unwrap().ip().is_loopback());
        assert!(NodeOptions::default().with_ipv4_addr("[::1]:0").is_err());
    }

    #[test]
    fn zero_gc_interval_disables_gc() {
        let mut options = NodeOptions::default();
        assert_eq!(options.gc_interval(), None);
        options.gc_interval_millis = Some(0);
        assert_eq!(options.gc_interval(), None);
        options.gc_interval_millis = Some(250);
        assert_eq!(options.gc_interval(), Some(Duration::from_millis(250)));
    }

    #[tokio::test]
    #[traced_test]
    async fn docs_require_opt_in() -> Result<()> {
        let node = Node::memory_with_options(local_options()).await?;
        assert!(matches!(node.docs(), Err(crate::Error::Config { .. })));
        node.shutdown().await?;

        let node = Node::memory_with_options(NodeOptions {
            enable_docs: true,
            ..local_options()
        })
        .await?;
        let author = node.docs()?.author_default()?;
        assert!(node.docs()?.author_list()?.contains(&author));
        node.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn persistent_node_keeps_identity_and_data() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let options = NodeOptions {
            enable_docs: true,
            ..local_options()
        };

        let node = Node::persistent_with_options(dir.path(), options.clone()).await?;
        let node_id = node.net().node_id();
        let added = node.blobs().import_bytes(Bytes::from_static(b"persisted")).await?;
        let author = node.docs()?.author_default()?;
        node.shutdown().await?;
        drop(node);

        assert!(dir.path().join(SECRET_KEY_FILE).exists());
        assert!(dir.path().join(DOCS_FILE).exists());

        let node = Node::persistent_with_options(dir.path(), options).await?;
        assert_eq!(node.net().node_id(), node_id);
        assert_eq!(
            node.blobs().read_to_bytes(added.hash).await?,
            Bytes::from_static(b"persisted")
        );
        assert_eq!(node.docs()?.author_default()?, author);
        node.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn net_reports_our_addr() -> Result<()> {
        let node = Node::memory_with_options(local_options()).await?;
        node.net().wait_online().await;
        let addr = node.net().node_addr();
        assert_eq!(addr.peer_id, node.net().node_id());
        assert!(!addr.direct_addrs.is_empty());
        node.shutdown().await?;
        Ok(())
    }
}
