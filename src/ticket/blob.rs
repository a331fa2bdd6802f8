//! Tickets for blobs.
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{ParseError, Ticket, decode_exact};
use crate::{
    blobs::{BlobFormat, Hash, HashAndFormat},
    key::EndpointAddr,
};

/// A token containing everything to get a blob from the provider.
///
/// It is a single item which can be easily serialized and deserialized.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{}", Ticket::serialize(self))]
pub struct BlobTicket {
    /// The provider to get a file from.
    addr: EndpointAddr,
    /// The format of the blob.
    format: BlobFormat,
    /// The hash to retrieve.
    hash: Hash,
}

/// Wire format for [`BlobTicket`].
///
/// A single variant enum to force postcard to add a discriminator.
#[derive(Serialize, Deserialize)]
enum TicketWireFormat {
    Variant0(Variant0BlobTicket),
}

#[derive(Serialize, Deserialize)]
struct Variant0BlobTicket {
    addr: EndpointAddr,
    format: BlobFormat,
    hash: Hash,
}

impl Ticket for BlobTicket {
    const KIND: &'static str = "blob";

    fn to_bytes(&self) -> Vec<u8> {
        let data = TicketWireFormat::Variant0(Variant0BlobTicket {
            addr: self.addr.clone(),
            format: self.format,
            hash: self.hash,
        });
        postcard::to_stdvec(&data).expect("postcard serialization failed")
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let TicketWireFormat::Variant0(Variant0BlobTicket { addr, format, hash }) =
            decode_exact(bytes)?;
        Ok(Self { addr, format, hash })
    }
}

impl FromStr for BlobTicket {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ticket::deserialize(s)
    }
}

impl BlobTicket {
    /// Creates a new ticket.
    pub fn new(addr: EndpointAddr, hash: Hash, format: BlobFormat) -> Self {
        Self { hash, format, addr }
    }

    /// The hash of the item this ticket can retrieve.
    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// The [`EndpointAddr`] of the provider for this ticket.
    pub fn addr(&self) -> &EndpointAddr {
        &self.addr
    }

    /// The [`BlobFormat`] for this ticket.
    pub fn format(&self) -> BlobFormat {
        self.format
    }

    /// The hash and format pair for this ticket.
    pub fn hash_and_format(&self) -> HashAndFormat {
        HashAndFormat {
            hash: self.hash,
            format: self.format,
        }
    }

    /// True if the ticket is for a collection and should retrieve all blobs in it.
    pub fn recursive(&self) -> bool {
        self.format.is_hash_seq()
    }

    /// Get the contents of the ticket, consuming it.
    pub fn into_parts(self) -> (EndpointAddr, Hash, BlobFormat) {
        let BlobTicket { addr, hash, format } = self;
        (addr, hash, format)
    }
}

impl Serialize for BlobTicket {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            let BlobTicket { addr, format, hash } = self;
            (addr, format, hash).serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for BlobTicket {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_str(&s).map_err(serde::de::Error::custom)
        } else {
            let (addr, format, hash) = Deserialize::deserialize(deserializer)?;
            Ok(Self::new(addr, hash, format))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use iroh::SecretKey;
    use rand::SeedableRng;

    use super::*;

    fn make_ticket() -> BlobTicket {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(0);
        let hash = Hash::new(b"hi there");
        let peer = SecretKey::generate(&mut rng).public();
        let addr = SocketAddr::from_str("127.0.0.1:1234").unwrap();
        BlobTicket::new(
            EndpointAddr::new(peer).with_direct_addrs([addr]),
            hash,
            BlobFormat::HashSeq,
        )
    }

    #[test]
    fn test_ticket_postcard() {
        let ticket = make_ticket();
        let bytes = postcard::to_stdvec(&ticket).unwrap();
        let ticket2: BlobTicket = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(ticket2, ticket);
    }

    #[test]
    fn test_ticket_json() {
        let ticket = make_ticket();
        let json = serde_json::to_string(&ticket).unwrap();
        let ticket2: BlobTicket = serde_json::from_str(&json).unwrap();
        assert_eq!(ticket2, ticket);
    }

    #[test]
    fn test_ticket_string() {
        let ticket = make_ticket();
        let text = ticket.to_string();
        assert!(text.starts_with("blob"));
        assert_eq!(text, text.to_ascii_lowercase());
        let parsed: BlobTicket = text.parse().unwrap();
        assert_eq!(parsed, ticket);
        assert!(parsed.recursive());
    }

    #[test]
    fn test_ticket_rejects_garbage() {
        let text = make_ticket().to_string();
        // truncated
        assert!(text[..text.len() - 8].parse::<BlobTicket>().is_err());
        // wrong kind
        assert!(text.replacen("blob", "doc", 1).parse::<BlobTicket>().is_err());
        // trailing bytes
        let mut bytes = make_ticket().to_bytes();
        bytes.push(0);
        assert!(BlobTicket::from_bytes(&bytes).is_err());
        // not base32
        assert!("blob!!!!".parse::<BlobTicket>().is_err());
    }
}
