use tokio::sync::mpsc;

use crate::{ChannelEvent, NodeAddress, TransportConfig, TransportError};

/// Receiving half of an endpoint's event stream.
pub type EventStream = mpsc::UnboundedReceiver<ChannelEvent>;

/// Registers endpoints under an address.
///
/// In production this is the external signaling service; in tests and the
/// simulator it is [`MemoryNetwork`](crate::MemoryNetwork).
#[async_trait::async_trait]
pub trait Signaling: Send + Sync + 'static {
    type Endpoint: Endpoint;

    /// Claim `address` and open a local endpoint under it.
    ///
    /// Fails with [`TransportError::AddressUnavailable`] when someone else
    /// already holds the address.
    async fn open(
        &self,
        address: NodeAddress,
        config: &TransportConfig,
    ) -> Result<(Self::Endpoint, EventStream), TransportError>;
}

/// A local endpoint: dials, sends and closes channels keyed by remote address.
#[async_trait::async_trait]
pub trait Endpoint: Send + Sync + 'static {
    /// The address this endpoint is registered under.
    fn address(&self) -> &NodeAddress;

    /// Open a channel to `remote`. Idempotent when already open.
    ///
    /// Failures are returned and also surfaced as [`ChannelEvent::Error`]
    /// on this endpoint's stream.
    async fn connect(&self, remote: &NodeAddress) -> Result<(), TransportError>;

    /// Send one record over the open channel to `remote`.
    async fn send(&self, remote: &NodeAddress, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Close the channel to `remote`; both sides observe `Closed`.
    async fn close(&self, remote: &NodeAddress);

    /// Whether a channel to `remote` is currently open.
    async fn is_open(&self, remote: &NodeAddress) -> bool;

    /// Every remote with an open channel.
    async fn open_channels(&self) -> Vec<NodeAddress>;

    /// Re-register with signaling after [`ChannelEvent::SignalingLost`].
    async fn reregister(&self) -> Result<(), TransportError>;

    /// Release the address and close every channel.
    async fn shutdown(&self);
}
