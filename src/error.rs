//! Errors returned from the public node API.

use nested_enum_utils::common_fields;
use snafu::{Backtrace, IntoError, Snafu};

use crate::key::PeerId;

/// Result type defaulting to the node [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned from node operations.
///
/// Callers can tell local misses ([`Error::NotFound`]) apart from network failures
/// ([`Error::Connect`]) and from corrupt data ([`Error::Verification`]).
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum Error {
    /// The supplied options are invalid.
    #[snafu(display("Invalid configuration: {message}"))]
    Config { message: String },
    /// The endpoint could not be bound.
    #[snafu(display("Failed to bind endpoint"))]
    Bind { source: iroh::endpoint::BindError },
    /// All connection candidates for a peer were exhausted.
    #[snafu(display("Failed to connect to {}: {reason}", peer.fmt_short()))]
    Connect { peer: PeerId, reason: String },
    /// An inbound connection used a protocol tag without a registered handler.
    #[snafu(display("No handler registered for protocol {alpn}"))]
    ProtocolMismatch { alpn: String },
    /// A hash or signature did not match.
    #[snafu(display("Verification failed: {message}"))]
    Verification { message: String },
    /// A hash, document, author or entry is not known locally.
    #[snafu(display("{what} not found"))]
    NotFound { what: String },
    /// The handle was torn down while the operation was in flight.
    #[snafu(display("Operation cancelled"))]
    Cancelled {},
    /// A caller imposed deadline elapsed.
    #[snafu(display("Operation timed out"))]
    Timeout {},
    /// The remote sent something we did not expect.
    #[snafu(display("Protocol error: {message}"))]
    Protocol { message: String },
    /// The operation is not permitted with the capability we hold.
    #[snafu(display("Permission denied: {message}"))]
    Permission { message: String },
    #[snafu(transparent)]
    Io { source: std::io::Error },
    /// The persistent storage failed.
    #[snafu(display("Storage failure"))]
    Storage {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[snafu(transparent)]
    Ticket { source: crate::ticket::ParseError },
}

impl Error {
    /// Wraps an arbitrary storage backend failure.
    pub(crate) fn storage<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        StorageSnafu.into_error(err.into())
    }

    pub(crate) fn not_found(what: impl std::fmt::Display) -> Self {
        NotFoundSnafu {
            what: what.to_string(),
        }
        .build()
    }

    pub(crate) fn protocol(message: impl std::fmt::Display) -> Self {
        ProtocolSnafu {
            message: message.to_string(),
        }
        .build()
    }

    pub(crate) fn verification(message: impl std::fmt::Display) -> Self {
        VerificationSnafu {
            message: message.to_string(),
        }
        .build()
    }

    pub(crate) fn cancelled() -> Self {
        CancelledSnafu.build()
    }

    /// Returns `true` if this is a [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Returns `true` if this is a [`Error::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled { .. })
    }

    /// Returns `true` if this is a [`Error::Verification`].
    pub fn is_verification(&self) -> bool {
        matches!(self, Error::Verification { .. })
    }
}

/// Actor internals use [`anyhow`]. Errors that started out as ours are recovered unchanged.
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(err) => err,
            Err(err) => Error::protocol(format!("{err:#}")),
        }
    }
}

macro_rules! impl_storage_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Error {
                fn from(err: $ty) -> Self {
                    Error::storage(err)
                }
            }
        )*
    };
}

impl_storage_from!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anyhow_roundtrip_keeps_kind() {
        let err = anyhow::Error::from(Error::not_found("blob abc"));
        let err = Error::from(err);
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "blob abc not found");

        let err = Error::from(anyhow::anyhow!("remote closed"));
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[test]
    fn io_is_transparent() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: Error = io.into();
        assert_eq!(err.to_string(), "nope");
    }
}
