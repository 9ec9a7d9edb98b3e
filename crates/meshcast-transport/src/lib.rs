//! meshcast channel layer.
//!
//! Defines the contract the mesh runtime expects from whatever establishes
//! point-to-point channels (signaling, NAT traversal, encryption all live
//! behind it), plus an in-process [`MemoryNetwork`] implementation used by
//! the simulator and the test suites.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use meshcast_transport::{ChannelEvent, Endpoint, MemoryNetwork, Signaling, TransportConfig};
//!
//! # async fn example() -> Result<(), meshcast_transport::TransportError> {
//! let network = MemoryNetwork::new();
//! let (alice, _alice_events) = network.open("alice".parse()?, &TransportConfig::new()).await?;
//! let (_bob, mut bob_events) = network.open("bob".parse()?, &TransportConfig::new()).await?;
//!
//! alice.connect(&"bob".parse()?).await?;
//! alice.send(&"bob".parse()?, b"hello".to_vec()).await?;
//!
//! while let Some(event) = bob_events.recv().await {
//!     if let ChannelEvent::Data { remote, bytes } = event {
//!         println!("{remote}: {} bytes", bytes.len());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod endpoint;
mod error;
mod event;
mod memory;

pub use config::TransportConfig;
pub use endpoint::{Endpoint, EventStream, Signaling};
pub use error::{ErrorKind, TransportError};
pub use event::ChannelEvent;
pub use memory::{MemoryEndpoint, MemoryNetwork};

use std::fmt;
use std::str::FromStr;

/// Transport-level identity of a node.
///
/// Opaque to the mesh: either a stable self-chosen identifier, a well-known
/// seed, or a time-windowed rendezvous address. Displayed and parsed as-is.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress(String);

impl NodeAddress {
    /// Borrow the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this address starts with `prefix` (used to recognise
    /// rendezvous addresses).
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    /// Derive `<self>-<suffix>`. Whitespace in the suffix is dropped, so the
    /// result is always a valid address.
    pub fn child(&self, suffix: impl fmt::Display) -> NodeAddress {
        let suffix: String = suffix
            .to_string()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        NodeAddress(format!("{}-{}", self.0, suffix))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({})", self.0)
    }
}

impl FromStr for NodeAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.chars().any(char::is_whitespace) {
            return Err(TransportError::InvalidAddress(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl serde::Serialize for NodeAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for NodeAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let addr: NodeAddress = "n-abc123".parse().unwrap();
        assert_eq!(addr.to_string(), "n-abc123");
        assert_eq!(addr.as_str(), "n-abc123");
        assert!(addr.has_prefix("n-"));
    }

    #[test]
    fn child_appends_suffix() {
        let room: NodeAddress = "mc-room".parse().unwrap();
        assert_eq!(room.child(491_000u64).as_str(), "mc-room-491000");
        assert_eq!(room.child("a b").as_str(), "mc-room-ab");
    }

    #[test]
    fn reject_empty_and_whitespace() {
        assert!("".parse::<NodeAddress>().is_err());
        assert!("two words".parse::<NodeAddress>().is_err());
        assert!("tab\there".parse::<NodeAddress>().is_err());
    }

    #[test]
    fn serde_as_plain_string() {
        let addr: NodeAddress = "seed-1".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"seed-1\"");
        let back: NodeAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
        assert!(serde_json::from_str::<NodeAddress>("\"\"").is_err());
    }
}
