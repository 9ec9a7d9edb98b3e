use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::types::{MessageId, NodeAddress, Target};

/// A replicated message. Immutable once created, except for the
/// receiver-side timestamp correction and hop-budget decrement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique with overwhelming probability.
    pub id: MessageId,
    pub sender_address: NodeAddress,
    pub sender_name: String,
    /// Opaque body bytes (UTF-8 text for chat).
    pub body: Vec<u8>,
    /// Advisory ordering timestamp (Unix ms), normalized on receipt.
    pub created_at: u64,
    pub target: Target,
    /// Remaining re-flood budget. Decremented at each relay.
    pub hop_budget: u8,
}

impl Message {
    /// Fresh id: hex millis prefix + UUID v4.
    pub fn new_id(now: u64) -> MessageId {
        format!("{now:x}-{}", uuid::Uuid::new_v4().simple())
    }

    pub fn is_broadcast(&self) -> bool {
        self.target.is_broadcast()
    }

    /// Body as text, lossily.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Whether `addr` sent this message or is its directed target.
    pub fn involves(&self, addr: &NodeAddress) -> bool {
        &self.sender_address == addr || self.target.node() == Some(addr)
    }

    /// Copy with the hop budget decremented, or `None` when exhausted.
    pub fn relayed(&self) -> Option<Message> {
        let hop_budget = self.hop_budget.checked_sub(1)?;
        Some(Message {
            hop_budget,
            ..self.clone()
        })
    }
}

/// One record on a channel. Serialized as a MessagePack map tagged by `t`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireRecord {
    /// Sent first on every open channel.
    Hello { name: String, address: NodeAddress },
    /// Sample of known peer addresses.
    PeerExchange { addresses: Vec<NodeAddress> },
    Message(Message),
    SyncRequest { after_timestamp: u64 },
    SyncResponse { messages: Vec<Message> },
    #[serde(rename = "LIVENESS_PING")]
    Ping,
    #[serde(rename = "LIVENESS_PONG")]
    Pong,
}

impl WireRecord {
    /// Serialize to MessagePack bytes (field names kept).
    pub fn to_bytes(&self) -> Result<Vec<u8>, MeshError> {
        rmp_serde::to_vec_named(self).map_err(Into::into)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MeshError> {
        rmp_serde::from_slice(bytes).map_err(Into::into)
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            WireRecord::Hello { .. } => "hello",
            WireRecord::PeerExchange { .. } => "pex",
            WireRecord::Message(_) => "message",
            WireRecord::SyncRequest { .. } => "sync-request",
            WireRecord::SyncResponse { .. } => "sync-response",
            WireRecord::Ping => "ping",
            WireRecord::Pong => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NodeAddress {
        s.parse().unwrap()
    }

    fn sample(target: Target) -> Message {
        Message {
            id: Message::new_id(1_700_000_000_000),
            sender_address: addr("n-alice"),
            sender_name: "alice".into(),
            body: b"hello".to_vec(),
            created_at: 1_700_000_000_000,
            target,
            hop_budget: 16,
        }
    }

    #[test]
    fn ids_are_unique_and_time_prefixed() {
        let a = Message::new_id(255);
        let b = Message::new_id(255);
        assert_ne!(a, b);
        assert!(a.starts_with("ff-"));
    }

    #[test]
    fn relayed_decrements_until_exhausted() {
        let mut msg = sample(Target::Broadcast);
        msg.hop_budget = 1;
        let once = msg.relayed().unwrap();
        assert_eq!(once.hop_budget, 0);
        assert_eq!(once.id, msg.id);
        assert!(once.relayed().is_none());
    }

    #[test]
    fn involves_sender_and_target() {
        let msg = sample(Target::Node(addr("n-bob")));
        assert!(msg.involves(&addr("n-alice")));
        assert!(msg.involves(&addr("n-bob")));
        assert!(!msg.involves(&addr("n-carol")));
        assert!(!sample(Target::Broadcast).involves(&addr("n-bob")));
    }

    #[test]
    fn message_record_roundtrip() {
        let record = WireRecord::Message(sample(Target::Node(addr("n-bob"))));
        let bytes = record.to_bytes().unwrap();
        assert_eq!(WireRecord::from_bytes(&bytes).unwrap(), record);
    }

    #[test]
    fn unit_records_roundtrip() {
        for record in [WireRecord::Ping, WireRecord::Pong] {
            let bytes = record.to_bytes().unwrap();
            assert_eq!(WireRecord::from_bytes(&bytes).unwrap(), record);
        }
    }

    #[test]
    fn sync_response_carries_messages_in_order() {
        let msgs: Vec<Message> = (0..3)
            .map(|i| {
                let mut m = sample(Target::Broadcast);
                m.created_at += i;
                m
            })
            .collect();
        let record = WireRecord::SyncResponse {
            messages: msgs.clone(),
        };
        match WireRecord::from_bytes(&record.to_bytes().unwrap()).unwrap() {
            WireRecord::SyncResponse { messages } => assert_eq!(messages, msgs),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn records_are_tagged_maps() {
        let bytes = WireRecord::Ping.to_bytes().unwrap();
        // fixmap with one entry
        assert_eq!(bytes[0], 0x81);
        let value: serde_json::Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(value["t"], "LIVENESS_PING");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(WireRecord::from_bytes(&[0xff, 0x00, 0x13]).is_err());
    }
}
