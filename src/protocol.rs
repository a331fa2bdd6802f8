//! Accept loop dispatching inbound connections by ALPN.
//!
//! The node registers one [`ProtocolHandler`] per protocol (blobs, gossip, docs sync) on a
//! [`RouterBuilder`]. Spawning the builder sets the endpoint's ALPNs and runs the loop that
//! hands each accepted connection to the matching handler.

use std::{collections::BTreeMap, sync::Arc};

use anyhow::Result;
use iroh::endpoint::{Connecting, Connection, Incoming};
use n0_future::{
    boxed::BoxFuture,
    join_all,
    task::{self, AbortOnDropHandle, JoinSet},
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, warn, Instrument};

use crate::{endpoint::Endpoint, error::ProtocolMismatchSnafu};

/// Error code used when closing a connection with an unregistered ALPN.
pub const PROTOCOL_MISMATCH_CODE: u32 = 3;

/// Handles inbound connections for one ALPN.
pub trait ProtocolHandler: Send + Sync + std::fmt::Debug + 'static {
    /// Optional interception point for the handshake.
    fn on_connecting(&self, connecting: Connecting) -> BoxFuture<Result<Connection>> {
        Box::pin(async move {
            let conn = connecting.await?;
            Ok(conn)
        })
    }

    /// Handles an established connection.
    ///
    /// The returned future runs on its own task, it can live as long as the connection.
    fn accept(&self, connection: Connection) -> BoxFuture<Result<()>>;

    /// Called once when the router shuts down.
    fn shutdown(&self) -> BoxFuture<()> {
        Box::pin(async move {})
    }
}

impl<T: ProtocolHandler> ProtocolHandler for Arc<T> {
    fn on_connecting(&self, conn: Connecting) -> BoxFuture<Result<Connection>> {
        self.as_ref().on_connecting(conn)
    }

    fn accept(&self, conn: Connection) -> BoxFuture<Result<()>> {
        self.as_ref().accept(conn)
    }

    fn shutdown(&self) -> BoxFuture<()> {
        self.as_ref().shutdown()
    }
}

#[derive(Debug, Default)]
struct ProtocolMap(BTreeMap<Vec<u8>, Box<dyn ProtocolHandler>>);

impl ProtocolMap {
    fn get(&self, alpn: &[u8]) -> Option<&dyn ProtocolHandler> {
        self.0.get(alpn).map(|p| &**p)
    }

    fn insert(&mut self, alpn: Vec<u8>, handler: Box<dyn ProtocolHandler>) {
        self.0.insert(alpn, handler);
    }

    fn alpns(&self) -> impl Iterator<Item = &Vec<u8>> {
        self.0.keys()
    }

    async fn shutdown(&self) {
        let handlers = self.0.values().map(|p| p.shutdown());
        join_all(handlers).await;
    }
}

/// The running accept loop.
#[derive(Clone, Debug)]
pub struct Router {
    endpoint: Endpoint,
    // `Router` needs to be `Clone + Send`, and `shutdown` has to await the task.
    task: Arc<Mutex<Option<AbortOnDropHandle<()>>>>,
    cancel_token: CancellationToken,
}

/// Collects protocol handlers before the accept loop starts.
#[derive(Debug)]
pub struct RouterBuilder {
    endpoint: Endpoint,
    protocols: ProtocolMap,
}

impl Router {
    /// Starts building a router on `endpoint`.
    pub fn builder(endpoint: Endpoint) -> RouterBuilder {
        RouterBuilder {
            endpoint,
            protocols: ProtocolMap::default(),
        }
    }

    /// The endpoint connections are accepted on.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Returns `true` once [`Self::shutdown`] was called or the loop exited.
    pub fn is_shutdown(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Stops accepting, shuts down all handlers and closes the endpoint.
    ///
    /// Calling this more than once is a no-op.
    pub async fn shutdown(&self) -> crate::Result<()> {
        if self.is_shutdown() {
            return Ok(());
        }
        self.cancel_token.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(err) = task.await {
                warn!("router task failed: {err:?}");
            }
        }
        Ok(())
    }
}

impl RouterBuilder {
    /// Registers `handler` for connections negotiating `alpn`.
    pub fn accept<T: ProtocolHandler>(mut self, alpn: impl AsRef<[u8]>, handler: T) -> Self {
        self.protocols
            .insert(alpn.as_ref().to_vec(), Box::new(handler));
        self
    }

    /// Sets the endpoint ALPNs and spawns the accept loop.
    pub fn spawn(self) -> Router {
        let alpns = self
            .protocols
            .alpns()
            .map(|alpn| alpn.to_vec())
            .collect::<Vec<_>>();
        self.endpoint.inner().set_alpns(alpns);

        let protocols = Arc::new(self.protocols);
        let mut join_set = JoinSet::new();
        let endpoint = self.endpoint.clone();

        let cancel = CancellationToken::new();
        let cancel_token = cancel.clone();

        let run_loop_fut = async move {
            // Cancel the token if this future ever exits.
            let _cancel_guard = cancel_token.clone().drop_guard();

            loop {
                tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => {
                        break;
                    },
                    Some(res) = join_set.join_next() => {
                        match res {
                            Err(outer) => {
                                if outer.is_panic() {
                                    error!("Task panicked: {outer:?}");
                                    break;
                                } else if outer.is_cancelled() {
                                    trace!("Task cancelled: {outer:?}");
                                } else {
                                    error!("Task failed: {outer:?}");
                                    break;
                                }
                            }
                            Ok(Some(())) => trace!("Task finished"),
                            Ok(None) => trace!("Task cancelled"),
                        }
                    },
                    incoming = endpoint.inner().accept() => {
                        let Some(incoming) = incoming else {
                            break; // Endpoint is closed.
                        };
                        let protocols = protocols.clone();
                        let token = cancel_token.child_token();
                        join_set.spawn(async move {
                            token.run_until_cancelled(handle_connection(incoming, protocols)).await
                        }.instrument(info_span!("router.accept")));
                    },
                }
            }

            shutdown(&endpoint, protocols).await;
            debug!("Shutting down remaining tasks");
            join_set.shutdown().await;
        };
        let task = AbortOnDropHandle::new(task::spawn(run_loop_fut));

        Router {
            endpoint: self.endpoint,
            task: Arc::new(Mutex::new(Some(task))),
            cancel_token: cancel,
        }
    }
}

async fn shutdown(endpoint: &Endpoint, protocols: Arc<ProtocolMap>) {
    // Protocols go first so they can still say goodbye over open connections.
    protocols.shutdown().await;
    endpoint.close().await;
}

async fn handle_connection(incoming: Incoming, protocols: Arc<ProtocolMap>) {
    let mut connecting = match incoming.accept() {
        Ok(conn) => conn,
        Err(err) => {
            warn!("Ignoring connection: accepting failed: {err:#}");
            return;
        }
    };
    let alpn = match connecting.alpn().await {
        Ok(alpn) => alpn,
        Err(err) => {
            warn!("Ignoring connection: invalid handshake: {err:#}");
            return;
        }
    };
    let Some(handler) = protocols.get(&alpn) else {
        let err = ProtocolMismatchSnafu {
            alpn: String::from_utf8_lossy(&alpn).to_string(),
        }
        .build();
        warn!("Rejecting connection: {err}");
        if let Ok(conn) = connecting.await {
            conn.close(PROTOCOL_MISMATCH_CODE.into(), err.to_string().as_bytes());
        }
        return;
    };
    debug!(alpn = %String::from_utf8_lossy(&alpn), "Handling incoming connection");
    match handler.on_connecting(connecting).await {
        Ok(connection) => {
            if let Err(err) = handler.accept(connection).await {
                debug!("Handling incoming connection ended with error: {err:#}");
            }
        }
        Err(err) => {
            warn!("Handling incoming connecting ended with error: {err:#}");
        }
    }
}
