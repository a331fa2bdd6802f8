//! A peer-to-peer node runtime on top of [`iroh`].
//!
//! A [`Node`] runs three protocols on one QUIC endpoint:
//!
//! - [`blobs`]: a content-addressed store with verified streaming transfer between nodes.
//! - [`gossip`]: epidemic broadcast on topics, with swarm membership per topic.
//! - [`docs`]: multi-writer key-value documents, reconciled with range-based set
//!   reconciliation and kept live over gossip.
//!
//! Everything that is needed to reach some content, topic or document from another node can
//! be shared as a [`ticket`].

pub mod blobs;
pub mod docs;
pub mod endpoint;
pub mod error;
pub mod gossip;
pub mod key;
pub mod logging;
pub mod node;
pub mod protocol;
pub mod ticket;
mod util;

pub use iroh::{RelayMode, SecretKey};

pub use self::{
    error::{Error, Result},
    key::{AddrInfoOptions, EndpointAddr, PeerId},
    logging::{LogLevel, set_log_level},
    node::{Net, Node, NodeBuilder, NodeOptions, StorageConfig},
    util::{key_to_path, path_to_key},
};
