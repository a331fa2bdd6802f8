//! Tickets for gossip topics.
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::{ParseError, Ticket, decode_exact};
use crate::{gossip::TopicId, key::EndpointAddr};

/// Contains a gossip topic and the peers to bootstrap the swarm from.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{}", Ticket::serialize(self))]
pub struct TopicTicket {
    topic: TopicId,
    bootstrap: Vec<EndpointAddr>,
}

#[derive(Serialize, Deserialize)]
enum TicketWireFormat {
    Variant0 {
        topic: TopicId,
        bootstrap: Vec<EndpointAddr>,
    },
}

impl Ticket for TopicTicket {
    const KIND: &'static str = "topic";

    fn to_bytes(&self) -> Vec<u8> {
        let data = TicketWireFormat::Variant0 {
            topic: self.topic,
            bootstrap: self.bootstrap.clone(),
        };
        postcard::to_stdvec(&data).expect("postcard serialization failed")
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let TicketWireFormat::Variant0 { topic, bootstrap } = decode_exact(bytes)?;
        Ok(Self { topic, bootstrap })
    }
}

impl FromStr for TopicTicket {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ticket::deserialize(s)
    }
}

impl TopicTicket {
    /// Creates a new ticket.
    pub fn new(topic: TopicId, bootstrap: impl IntoIterator<Item = EndpointAddr>) -> Self {
        Self {
            topic,
            bootstrap: bootstrap.into_iter().collect(),
        }
    }

    /// The gossip topic.
    pub fn topic(&self) -> TopicId {
        self.topic
    }

    /// The peers to join the topic through.
    pub fn bootstrap(&self) -> &[EndpointAddr] {
        &self.bootstrap
    }

    /// Get the contents of the ticket, consuming it.
    pub fn into_parts(self) -> (TopicId, Vec<EndpointAddr>) {
        (self.topic, self.bootstrap)
    }
}

impl Serialize for TopicTicket {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            (&self.topic, &self.bootstrap).serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for TopicTicket {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_str(&s).map_err(serde::de::Error::custom)
        } else {
            let (topic, bootstrap) = Deserialize::deserialize(deserializer)?;
            Ok(Self { topic, bootstrap })
        }
    }
}

#[cfg(test)]
mod tests {
    use iroh::SecretKey;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn topic_ticket_roundtrip() {
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(1);
        let peers = (0..3)
            .map(|_| EndpointAddr::new(SecretKey::generate(&mut rng).public()))
            .collect::<Vec<_>>();
        let ticket = TopicTicket::new(TopicId::from_bytes([0u8; 32]), peers.clone());
        let text = ticket.to_string();
        assert!(text.starts_with("topic"));
        let parsed: TopicTicket = text.parse().unwrap();
        assert_eq!(parsed, ticket);
        assert_eq!(parsed.bootstrap(), &peers[..]);
        assert!(text[..text.len() - 4].parse::<TopicTicket>().is_err());
    }
}
