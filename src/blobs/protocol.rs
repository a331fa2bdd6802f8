//! Wire protocol for blob transfer.
//!
//! A getter opens one bidirectional stream per request. The first request on a blob asks
//! for its size, which fixes the shape of the blob's tree. Data is then requested in runs
//! of chunks. Each run is answered with the chunks interleaved with the parent hashes that
//! prove them, so the getter verifies every chunk against the hash as it decodes.
//!
//! All messages are postcard encoded and length prefixed.

use bytes::Bytes;
use iroh::endpoint::VarInt;
use serde::{Deserialize, Serialize};

use super::Hash;

/// The ALPN used for blob transfer.
pub const ALPN: &[u8] = b"/iroh-node-blobs/2";

/// Maximum size of a single message.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum size of a request.
pub const MAX_REQUEST_SIZE: usize = 1024;

/// Most chunks served for a single [`Request::Chunks`]. Keeps responses well below
/// [`MAX_MESSAGE_SIZE`].
pub const MAX_CHUNK_BATCH: u64 = 256;

/// A request sent from the getter to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Asks for the size of a blob.
    Size {
        /// The blob.
        hash: Hash,
    },
    /// Asks for chunks `start..end` of a blob.
    Chunks {
        /// The blob.
        hash: Hash,
        /// First chunk index.
        start: u64,
        /// One past the last chunk index.
        end: u64,
    },
}

/// A response from the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    /// Size of the blob in bytes.
    Size {
        /// Size in bytes.
        size: u64,
    },
    /// The requested chunks and their proofs, in tree order.
    ///
    /// Runs past the end of the blob or longer than [`MAX_CHUNK_BATCH`] are cut short.
    Encoded {
        /// Parent hashes and chunk data.
        data: Bytes,
    },
    /// The provider does not have the blob.
    NotFound,
}

/// Reasons to close a connection or stream, used as QUIC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Closed {
    /// The stream was dropped without an explicit close.
    StreamDropped = 0,
    /// The provider is shutting down.
    ProviderTerminating = 1,
    /// The getter is done with the connection.
    GetterDone = 2,
}

impl Closed {
    /// The close reason as bytes.
    pub fn reason(&self) -> &'static [u8] {
        match self {
            Closed::StreamDropped => b"stream dropped",
            Closed::ProviderTerminating => b"provider terminating",
            Closed::GetterDone => b"getter done",
        }
    }
}

impl From<Closed> for VarInt {
    fn from(source: Closed) -> Self {
        VarInt::from(source as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_fit_the_request_limit() {
        let request = Request::Chunks {
            hash: Hash::new(b"x"),
            start: u64::MAX,
            end: u64::MAX,
        };
        let size = postcard::experimental::serialized_size(&request).unwrap();
        assert!(size < MAX_REQUEST_SIZE);
    }

    #[test]
    fn encoded_response_is_compact() {
        let response = Response::Encoded {
            data: Bytes::from(vec![0u8; 100]),
        };
        let encoded = postcard::to_stdvec(&response).unwrap();
        // variant tag, length prefix and the data itself
        assert_eq!(encoded.len(), 1 + 1 + 100);
        assert_eq!(postcard::from_bytes::<Response>(&encoded).unwrap(), response);
    }

    #[test]
    fn largest_batch_fits_a_message() {
        // chunk data plus one 64 byte parent per chunk is a generous bound
        let bound = MAX_CHUNK_BATCH as usize * (crate::blobs::tree::CHUNK_SIZE + 64);
        assert!(bound < MAX_MESSAGE_SIZE);
    }
}
