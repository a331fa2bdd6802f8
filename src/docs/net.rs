//! Network side of document sync.
//!
//! One reconciliation runs per connection, on a single bidirectional stream. The connecting
//! side (alice) opens it with an `Init` message naming the document, the accepting side
//! (bob) answers, and both alternate until one side has nothing left to send and finishes
//! its stream.

use std::{
    future::Future,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use iroh::endpoint::Connection;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use super::{
    ContentStatus, ContentStatusCallback, NamespaceId, SignedEntry,
    entry::validate_remote,
    ranger::{self, SyncOutcome},
    store::{ReplicaStore, Store},
};
use crate::{
    endpoint::{Endpoint, remote_peer},
    key::{EndpointAddr, PeerId},
    util::{read_message, write_message},
};

/// The ALPN identifier for the document sync protocol
pub const SYNC_ALPN: &[u8] = b"/iroh-node-sync/1";

/// Upper bound for a single sync message. Leaves of the reconciliation carry whole entry sets.
const MAX_MESSAGE_SIZE: usize = 1024 * 1024 * 1024;

/// How long the accepting side waits for the initiator to close the connection.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type ProtocolMessage = ranger::Message<SignedEntry>;

/// Sync protocol
///
/// - Init message: signals which namespace is being synced
/// - N Sync messages
/// - or a single Abort message, sent by bob instead of his first reply
///
/// On any error and on success the substream is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum Message {
    Init {
        /// Namespace to sync
        namespace: NamespaceId,
        /// Initial message
        message: ProtocolMessage,
    },
    Sync(ProtocolMessage),
    Abort {
        reason: AbortReason,
    },
}

/// Why the accepting side refused to sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
pub enum AbortReason {
    /// The document is not known or not open for sync.
    #[display("document not found")]
    NotFound,
    /// A sync with this peer for this document is already running.
    #[display("already syncing")]
    AlreadySyncing,
    /// The accepting node failed internally.
    #[display("internal server error")]
    InternalServerError,
}

/// Decision on an incoming sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Run the sync.
    Allow,
    /// Refuse it.
    Reject(AbortReason),
}

/// Time spent in the phases of a sync.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timings {
    /// Time to establish the connection and stream.
    pub connect: Duration,
    /// Time to run the reconciliation.
    pub process: Duration,
}

/// A completed sync.
#[derive(Debug, Clone)]
pub struct SyncFinished {
    /// The document.
    pub namespace: NamespaceId,
    /// The other side.
    pub peer: PeerId,
    /// Entry counts.
    pub outcome: SyncOutcome,
    /// Entries that were new to us, with the content status the peer reported.
    pub inserted: Vec<(SignedEntry, ContentStatus)>,
    /// Phase durations.
    pub timings: Timings,
}

/// Failure of a sync we initiated.
#[derive(Debug, derive_more::Display)]
pub(crate) enum ConnectError {
    /// The connection could not be established.
    #[display("failed to connect: {_0:#}")]
    Connect(anyhow::Error),
    /// The remote refused.
    #[display("remote aborted: {_0}")]
    RemoteAbort(AbortReason),
    /// The exchange failed midway.
    #[display("sync failed: {_0:#}")]
    Sync(anyhow::Error),
}

impl std::error::Error for ConnectError {}

impl ConnectError {
    fn connect(err: impl Into<anyhow::Error>) -> Self {
        Self::Connect(err.into())
    }

    fn sync(err: impl Into<anyhow::Error>) -> Self {
        Self::Sync(err.into())
    }
}

/// Failure of a sync a peer initiated.
#[derive(Debug, derive_more::Display)]
pub(crate) enum AcceptError {
    /// The connection failed before we learned who is on the other side.
    #[display("failed to accept: {_0:#}")]
    Connect(anyhow::Error),
    /// We refused the request.
    #[display("aborted: {reason}")]
    Abort {
        peer: PeerId,
        namespace: NamespaceId,
        reason: AbortReason,
    },
    /// The exchange failed midway.
    #[display("sync failed: {error:#}")]
    Sync {
        peer: PeerId,
        namespace: Option<NamespaceId>,
        error: anyhow::Error,
    },
}

impl std::error::Error for AcceptError {}

impl AcceptError {
    fn sync(peer: PeerId, namespace: Option<NamespaceId>, err: impl Into<anyhow::Error>) -> Self {
        Self::Sync {
            peer,
            namespace,
            error: err.into(),
        }
    }

    /// The peer, if the failure happened after it was known.
    pub(crate) fn peer(&self) -> Option<PeerId> {
        match self {
            Self::Connect(_) => None,
            Self::Abort { peer, .. } | Self::Sync { peer, .. } => Some(*peer),
        }
    }

    /// The document, if the failure happened after the init message.
    pub(crate) fn namespace(&self) -> Option<NamespaceId> {
        match self {
            Self::Connect(_) => None,
            Self::Abort { namespace, .. } => Some(*namespace),
            Self::Sync { namespace, .. } => *namespace,
        }
    }
}

/// Connects to a peer and syncs a document.
pub(crate) async fn connect_and_sync(
    endpoint: &Endpoint,
    store: &Store,
    content_status: &ContentStatusCallback,
    namespace: NamespaceId,
    addr: EndpointAddr,
) -> Result<SyncFinished, ConnectError> {
    let t_start = Instant::now();
    let peer = addr.peer_id;
    trace!("connect");
    let conn = endpoint
        .connect(addr, SYNC_ALPN)
        .await
        .map_err(ConnectError::connect)?;
    let (mut send_stream, mut recv_stream) =
        conn.open_bi().await.map_err(ConnectError::connect)?;
    let t_connect = t_start.elapsed();
    debug!(?t_connect, "connected");

    let session = Session::new(store, namespace, content_status);
    let res = run_alice(&mut send_stream, &mut recv_stream, session, peer).await;
    send_stream.finish().map_err(ConnectError::sync)?;
    let (outcome, inserted) = res?;
    // Bob finishes his stream once he read ours, after that the connection can go.
    recv_stream
        .read_to_end(0)
        .await
        .map_err(ConnectError::sync)?;
    conn.close(0u8.into(), b"done");

    let t_process = t_start.elapsed() - t_connect;
    debug!(?t_process, recv = outcome.num_recv, sent = outcome.num_sent, "done");
    Ok(SyncFinished {
        namespace,
        peer,
        outcome,
        inserted,
        timings: Timings {
            connect: t_connect,
            process: t_process,
        },
    })
}

/// Handles an incoming sync connection.
///
/// `accept_cb` decides whether the requested document may be synced with the peer.
pub(crate) async fn handle_connection<F, Fut>(
    store: Store,
    content_status: ContentStatusCallback,
    conn: Connection,
    accept_cb: F,
) -> Result<SyncFinished, AcceptError>
where
    F: FnOnce(NamespaceId, PeerId) -> Fut,
    Fut: Future<Output = AcceptOutcome>,
{
    let t_start = Instant::now();
    let peer = remote_peer(&conn).map_err(AcceptError::Connect)?;
    let (mut send_stream, mut recv_stream) = conn
        .accept_bi()
        .await
        .map_err(|err| AcceptError::sync(peer, None, err))?;
    let t_connect = t_start.elapsed();
    debug!(?t_connect, peer = %peer.fmt_short(), "incoming sync: start");

    let res = run_bob(
        &mut send_stream,
        &mut recv_stream,
        &store,
        &content_status,
        peer,
        accept_cb,
    )
    .await;
    // Alice closes the connection once she read our finish, an abort included.
    send_stream.finish().ok();
    tokio::time::timeout(CLOSE_TIMEOUT, conn.closed()).await.ok();
    let (namespace, outcome, inserted) = res?;

    let t_process = t_start.elapsed() - t_connect;
    debug!(peer = %peer.fmt_short(), namespace = %namespace.fmt_short(), ?t_process, "incoming sync: done");
    Ok(SyncFinished {
        namespace,
        peer,
        outcome,
        inserted,
        timings: Timings {
            connect: t_connect,
            process: t_process,
        },
    })
}

/// State of one side of a running reconciliation.
struct Session<'a> {
    namespace: NamespaceId,
    ranger: ranger::Peer,
    store: ReplicaStore,
    content_status: &'a ContentStatusCallback,
    outcome: SyncOutcome,
    inserted: Vec<(SignedEntry, ContentStatus)>,
}

impl<'a> Session<'a> {
    fn new(store: &Store, namespace: NamespaceId, content_status: &'a ContentStatusCallback) -> Self {
        Self {
            namespace,
            ranger: ranger::Peer::default(),
            store: store.replica_store(namespace),
            content_status,
            outcome: SyncOutcome::default(),
            inserted: Vec::new(),
        }
    }

    fn initial_message(&self) -> anyhow::Result<ProtocolMessage> {
        Ok(self.ranger.initial_message(&self.store)?)
    }

    fn process(&mut self, message: ProtocolMessage) -> anyhow::Result<Option<ProtocolMessage>> {
        let namespace = self.namespace;
        let content_status = self.content_status;
        let inserted = &mut self.inserted;
        let reply = self.ranger.process_message(
            &mut self.store,
            message,
            |entry| validate_remote(namespace, entry),
            |entry, status| inserted.push((entry, status)),
            |entry| content_status(entry.content_hash()),
            &mut self.outcome,
        )?;
        Ok(reply)
    }

    fn finish(self) -> (SyncOutcome, Vec<(SignedEntry, ContentStatus)>) {
        (self.outcome, self.inserted)
    }
}

/// Runs the initiator side of the sync protocol.
async fn run_alice<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    writer: &mut W,
    reader: &mut R,
    mut session: Session<'_>,
    other_peer_id: PeerId,
) -> Result<(SyncOutcome, Vec<(SignedEntry, ContentStatus)>), ConnectError> {
    let mut write_buf = BytesMut::new();
    let mut read_buf = BytesMut::new();

    // Init message
    let init_message = Message::Init {
        namespace: session.namespace,
        message: session.initial_message().map_err(ConnectError::sync)?,
    };
    trace!(peer = %other_peer_id.fmt_short(), "alice -> bob: init");
    write_message(writer, &mut write_buf, &init_message, MAX_MESSAGE_SIZE)
        .await
        .map_err(ConnectError::sync)?;

    // Sync message loop
    while let Some(msg) = read_message(&mut *reader, &mut read_buf, MAX_MESSAGE_SIZE)
        .await
        .map_err(ConnectError::sync)?
    {
        match msg {
            Message::Init { .. } => {
                return Err(ConnectError::sync(anyhow::anyhow!("unexpected message: init")));
            }
            Message::Abort { reason } => return Err(ConnectError::RemoteAbort(reason)),
            Message::Sync(msg) => match session.process(msg).map_err(ConnectError::sync)? {
                Some(msg) => {
                    trace!(parts = msg.parts().len(), "alice -> bob");
                    write_message(writer, &mut write_buf, &Message::Sync(msg), MAX_MESSAGE_SIZE)
                        .await
                        .map_err(ConnectError::sync)?;
                }
                None => break,
            },
        }
    }

    Ok(session.finish())
}

/// Runs the receiver side of the sync protocol.
async fn run_bob<R, W, F, Fut>(
    writer: &mut W,
    reader: &mut R,
    store: &Store,
    content_status: &ContentStatusCallback,
    other_peer_id: PeerId,
    accept_cb: F,
) -> Result<(NamespaceId, SyncOutcome, Vec<(SignedEntry, ContentStatus)>), AcceptError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnOnce(NamespaceId, PeerId) -> Fut,
    Fut: Future<Output = AcceptOutcome>,
{
    let peer = other_peer_id;
    let mut write_buf = BytesMut::new();
    let mut read_buf = BytesMut::new();

    let first = read_message(&mut *reader, &mut read_buf, MAX_MESSAGE_SIZE)
        .await
        .map_err(|err| AcceptError::sync(peer, None, err))?;
    let (namespace, message) = match first {
        Some(Message::Init { namespace, message }) => (namespace, message),
        Some(_) => {
            return Err(AcceptError::sync(
                peer,
                None,
                anyhow::anyhow!("unexpected sync message without init"),
            ));
        }
        None => {
            return Err(AcceptError::sync(
                peer,
                None,
                anyhow::anyhow!("stream closed before init"),
            ));
        }
    };

    let known = store
        .get_capability(&namespace)
        .map_err(|err| AcceptError::sync(peer, Some(namespace), err))?
        .is_some();
    let outcome = match known {
        false => AcceptOutcome::Reject(AbortReason::NotFound),
        true => accept_cb(namespace, peer).await,
    };
    if let AcceptOutcome::Reject(reason) = outcome {
        debug!(namespace = %namespace.fmt_short(), %reason, "reject sync request");
        write_message(writer, &mut write_buf, &Message::Abort { reason }, MAX_MESSAGE_SIZE)
            .await
            .map_err(|err| AcceptError::sync(peer, Some(namespace), err))?;
        return Err(AcceptError::Abort {
            peer,
            namespace,
            reason,
        });
    }

    debug!(namespace = %namespace.fmt_short(), "run_bob: process initial message");
    let mut session = Session::new(store, namespace, content_status);
    let mut next = Some(message);
    while let Some(msg) = next.take() {
        match session
            .process(msg)
            .map_err(|err| AcceptError::sync(peer, Some(namespace), err))?
        {
            Some(msg) => {
                trace!(parts = msg.parts().len(), "bob -> alice");
                write_message(writer, &mut write_buf, &Message::Sync(msg), MAX_MESSAGE_SIZE)
                    .await
                    .map_err(|err| AcceptError::sync(peer, Some(namespace), err))?;
            }
            None => break,
        }
        next = match read_message(&mut *reader, &mut read_buf, MAX_MESSAGE_SIZE)
            .await
            .map_err(|err| AcceptError::sync(peer, Some(namespace), err))?
        {
            Some(Message::Sync(msg)) => Some(msg),
            Some(_) => {
                return Err(AcceptError::sync(
                    peer,
                    Some(namespace),
                    anyhow::anyhow!("unexpected message: init or abort"),
                ));
            }
            None => None,
        };
    }

    let (outcome, inserted) = session.finish();
    Ok((namespace, outcome, inserted))
}
