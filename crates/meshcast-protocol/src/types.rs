use serde::{Deserialize, Serialize};

pub use meshcast_transport::NodeAddress;

/// Opaque message identifier: time component + random UUID.
pub type MessageId = String;

/// Initial hop budget for locally composed messages.
pub const DEFAULT_HOP_BUDGET: u8 = 16;

/// Current wall-clock time in Unix milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Who a message is for.
///
/// Serialized as an optional address: absent means broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Option<NodeAddress>", into = "Option<NodeAddress>")]
pub enum Target {
    Broadcast,
    Node(NodeAddress),
}

impl Target {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Target::Broadcast)
    }

    /// The addressed node, if directed.
    pub fn node(&self) -> Option<&NodeAddress> {
        match self {
            Target::Broadcast => None,
            Target::Node(addr) => Some(addr),
        }
    }
}

impl From<Option<NodeAddress>> for Target {
    fn from(value: Option<NodeAddress>) -> Self {
        match value {
            Some(addr) => Target::Node(addr),
            None => Target::Broadcast,
        }
    }
}

impl From<Target> for Option<NodeAddress> {
    fn from(value: Target) -> Self {
        match value {
            Target::Broadcast => None,
            Target::Node(addr) => Some(addr),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Broadcast => f.write_str("broadcast"),
            Target::Node(addr) => write!(f, "{addr}"),
        }
    }
}

/// Which local endpoint a channel lives on.
///
/// Every node has a primary endpoint; the elected hub additionally owns
/// an endpoint registered under the current rendezvous address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Primary,
    Hub,
}

/// A channel as the mesh sees it: local endpoint + remote address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId {
    pub slot: Slot,
    pub remote: NodeAddress,
}

impl ChannelId {
    pub fn primary(remote: NodeAddress) -> Self {
        Self {
            slot: Slot::Primary,
            remote,
        }
    }

    pub fn hub(remote: NodeAddress) -> Self {
        Self {
            slot: Slot::Hub,
            remote,
        }
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.slot {
            Slot::Primary => write!(f, "{}", self.remote),
            Slot::Hub => write!(f, "hub:{}", self.remote),
        }
    }
}

/// A gossip-learned peer. Not a liveness guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownPeer {
    pub address: NodeAddress,
    /// Empty until a HELLO from this peer is seen.
    pub display_name: String,
    pub last_seen_at: u64,
}
