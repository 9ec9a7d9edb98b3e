use crate::{ErrorKind, NodeAddress};

/// Lifecycle and data events for every channel of one endpoint.
///
/// `remote` is always the address this endpoint uses for the other side:
/// the address it dialed for outbound channels, the dialer's registered
/// address for inbound ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A channel is ready for records in both directions.
    Open { remote: NodeAddress },
    /// One record arrived, in send order.
    Data { remote: NodeAddress, bytes: Vec<u8> },
    /// The channel was closed by either side.
    Closed { remote: NodeAddress },
    /// A connect attempt or channel operation failed.
    Error {
        remote: NodeAddress,
        kind: ErrorKind,
        detail: String,
    },
    /// The endpoint lost its signaling registration. Open channels survive
    /// but nobody new can reach this address until it re-registers.
    SignalingLost,
}

impl ChannelEvent {
    /// The remote this event concerns, if any.
    pub fn remote(&self) -> Option<&NodeAddress> {
        match self {
            ChannelEvent::Open { remote }
            | ChannelEvent::Data { remote, .. }
            | ChannelEvent::Closed { remote }
            | ChannelEvent::Error { remote, .. } => Some(remote),
            ChannelEvent::SignalingLost => None,
        }
    }
}
