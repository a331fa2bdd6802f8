//! Tickets for documents.
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{ParseError, Ticket, decode_exact};
use crate::{docs::Capability, key::EndpointAddr};

/// Contains both a key (either secret or public) to a document, and a list of peers to
/// sync with.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{}", Ticket::serialize(self))]
pub struct DocTicket {
    /// Either a public or private key.
    pub capability: Capability,
    /// A list of nodes to contact.
    pub nodes: Vec<EndpointAddr>,
}

#[derive(Serialize, Deserialize)]
enum TicketWireFormat {
    Variant0(DocTicket),
}

impl Ticket for DocTicket {
    const KIND: &'static str = "doc";

    fn to_bytes(&self) -> Vec<u8> {
        let data = TicketWireFormat::Variant0(self.clone());
        postcard::to_stdvec(&data).expect("postcard serialization failed")
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let TicketWireFormat::Variant0(res) = decode_exact(bytes)?;
        if res.nodes.is_empty() {
            return Err(ParseError::verification_failed("addressing info cannot be empty"));
        }
        Ok(res)
    }
}

impl DocTicket {
    /// Create a new doc ticket.
    pub fn new(capability: Capability, peers: Vec<EndpointAddr>) -> Self {
        Self {
            capability,
            nodes: peers,
        }
    }
}

impl FromStr for DocTicket {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ticket::deserialize(s)
    }
}

impl Serialize for DocTicket {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            (&self.capability, &self.nodes).serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for DocTicket {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_str(&s).map_err(serde::de::Error::custom)
        } else {
            let (capability, nodes) = Deserialize::deserialize(deserializer)?;
            Ok(Self { capability, nodes })
        }
    }
}

#[cfg(test)]
mod tests {
    use iroh::SecretKey;
    use rand::SeedableRng;

    use super::*;
    use crate::docs::NamespaceSecret;

    fn peer(rng: &mut rand_chacha::ChaCha8Rng) -> EndpointAddr {
        EndpointAddr::new(SecretKey::generate(rng).public())
    }

    #[test]
    fn doc_ticket_roundtrip() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(2);
        let secret = NamespaceSecret::new(&mut rng);
        let write = DocTicket::new(Capability::Write(secret.clone()), vec![peer(&mut rng)]);
        let read = DocTicket::new(Capability::Read(secret.id()), vec![peer(&mut rng)]);
        for ticket in [write, read] {
            let parsed: DocTicket = ticket.to_string().parse().unwrap();
            assert_eq!(parsed, ticket);
        }
    }

    #[test]
    fn doc_ticket_without_peers_is_rejected() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(3);
        let secret = NamespaceSecret::new(&mut rng);
        let ticket = DocTicket::new(Capability::Read(secret.id()), vec![]);
        assert!(ticket.to_string().parse::<DocTicket>().is_err());
    }
}
