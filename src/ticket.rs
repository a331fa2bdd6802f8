//! Tickets are serializable objects combining the information required for an operation.
//!
//! A blob ticket carries the hash of the data and how to reach the provider, a topic
//! ticket carries a gossip topic and bootstrap peers, and a doc ticket carries a document
//! capability and the peers to sync with.

use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};

mod blob;
mod doc;
mod topic;

pub use self::{blob::BlobTicket, doc::DocTicket, topic::TopicTicket};

/// A ticket is a serializable object combining information required for an operation.
///
/// Tickets serialize to a string using lowercase base32. The kind of ticket is prepended
/// to the string to make it somewhat self describing.
pub trait Ticket: Sized {
    /// String prefix describing the kind of ticket.
    ///
    /// This should be lower case ascii characters.
    const KIND: &'static str;

    /// Serialize to bytes used in the base32 string representation.
    fn to_bytes(&self) -> Vec<u8>;

    /// Deserialize from the base32 string representation bytes.
    fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError>;

    /// Serialize to string.
    fn serialize(&self) -> String {
        let mut out = Self::KIND.to_string();
        data_encoding::BASE32_NOPAD.encode_append(&self.to_bytes(), &mut out);
        out.to_ascii_lowercase()
    }

    /// Deserialize from a string.
    fn deserialize(str: &str) -> Result<Self, ParseError> {
        let expected = Self::KIND;
        let Some(rest) = str.strip_prefix(expected) else {
            return Err(KindSnafu { expected }.build());
        };
        let bytes = data_encoding::BASE32_NOPAD.decode(rest.to_ascii_uppercase().as_bytes())?;
        let ticket = Self::from_bytes(&bytes)?;
        Ok(ticket)
    }
}

/// The kinds of tickets this crate mints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Kind {
    /// A [`BlobTicket`].
    Blob,
    /// A [`TopicTicket`].
    Topic,
    /// A [`DocTicket`].
    Doc,
}

impl Kind {
    /// Detects the kind of a serialized ticket from its prefix.
    pub fn detect(ticket: &str) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|kind| ticket.starts_with(kind.prefix()))
    }

    /// The string prefix of this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            Kind::Blob => BlobTicket::KIND,
            Kind::Topic => TopicTicket::KIND,
            Kind::Doc => DocTicket::KIND,
        }
    }
}

/// An error deserializing a ticket.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum ParseError {
    /// Found a ticket with the wrong prefix, indicating the wrong kind.
    #[snafu(display("wrong prefix, expected {expected}"))]
    Kind {
        /// The expected prefix.
        expected: &'static str,
    },
    /// This looks like a ticket, but postcard deserialization failed.
    #[snafu(transparent)]
    Postcard { source: postcard::Error },
    /// This looks like a ticket, but base32 decoding failed.
    #[snafu(transparent)]
    Encoding { source: data_encoding::DecodeError },
    /// Verification of the deserialized bytes failed.
    #[snafu(display("verification failed: {message}"))]
    Verify { message: &'static str },
}

impl ParseError {
    /// Returns a [`ParseError`] that indicates the given ticket has the wrong prefix.
    pub fn wrong_prefix(expected: &'static str) -> Self {
        KindSnafu { expected }.build()
    }

    /// Returns a [`ParseError`] that indicates verification of the deserialized bytes failed.
    pub fn verification_failed(message: &'static str) -> Self {
        VerifySnafu { message }.build()
    }
}

/// Decodes a postcard value, rejecting trailing bytes.
pub(crate) fn decode_exact<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ParseError> {
    let (value, rest) = postcard::take_from_bytes(bytes)?;
    if !rest.is_empty() {
        return Err(ParseError::verification_failed("trailing bytes"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_kind() {
        assert_eq!(Kind::detect("blobabcdef"), Some(Kind::Blob));
        assert_eq!(Kind::detect("docaaaa"), Some(Kind::Doc));
        assert_eq!(Kind::detect("topicaaaa"), Some(Kind::Topic));
        assert_eq!(Kind::detect("nodeaaaa"), None);
        assert_eq!("doc".parse::<Kind>().unwrap(), Kind::Doc);
    }
}
