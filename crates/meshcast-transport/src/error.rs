use crate::NodeAddress;

/// Errors returned by the channel layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("address already in use: {address}")]
    AddressUnavailable { address: NodeAddress },

    #[error("peer unreachable: {address}")]
    PeerUnreachable { address: NodeAddress },

    #[error("no open channel to {address}")]
    ChannelClosed { address: NodeAddress },

    #[error("channel limit reached on {address}")]
    ChannelLimit { address: NodeAddress },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("endpoint is not registered with signaling")]
    NotRegistered,

    #[error("endpoint is shut down")]
    Shutdown,

    #[error("invalid address: {0:?}")]
    InvalidAddress(String),
}

/// Coarse failure classes surfaced on the event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A claimed address is already registered by someone else.
    AddressUnavailable,
    /// A connect attempt found no such address registered.
    PeerUnreachable,
    /// Any other open/send/receive failure on an individual channel.
    ChannelFailed,
}

impl TransportError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::AddressUnavailable { .. } => ErrorKind::AddressUnavailable,
            TransportError::PeerUnreachable { .. } => ErrorKind::PeerUnreachable,
            _ => ErrorKind::ChannelFailed,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::AddressUnavailable => write!(f, "address-unavailable"),
            ErrorKind::PeerUnreachable => write!(f, "peer-unreachable"),
            ErrorKind::ChannelFailed => write!(f, "channel-failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NodeAddress {
        s.parse().unwrap()
    }

    #[test]
    fn display_address_unavailable() {
        let err = TransportError::AddressUnavailable {
            address: addr("seed-1"),
        };
        assert_eq!(err.to_string(), "address already in use: seed-1");
        assert_eq!(err.kind(), ErrorKind::AddressUnavailable);
    }

    #[test]
    fn display_peer_unreachable() {
        let err = TransportError::PeerUnreachable {
            address: addr("mc-room-42"),
        };
        assert_eq!(err.to_string(), "peer unreachable: mc-room-42");
        assert_eq!(err.kind(), ErrorKind::PeerUnreachable);
    }

    #[test]
    fn everything_else_is_channel_failure() {
        assert_eq!(TransportError::Shutdown.kind(), ErrorKind::ChannelFailed);
        assert_eq!(
            TransportError::MessageTooLarge { size: 10, max: 5 }.kind(),
            ErrorKind::ChannelFailed
        );
    }

    #[test]
    fn kind_display_matches_wire_names() {
        assert_eq!(ErrorKind::AddressUnavailable.to_string(), "address-unavailable");
        assert_eq!(ErrorKind::PeerUnreachable.to_string(), "peer-unreachable");
    }
}
