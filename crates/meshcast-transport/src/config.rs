use std::time::Duration;

/// Configuration for an endpoint opened through a [`Signaling`](crate::Signaling).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use meshcast_transport::TransportConfig;
///
/// let config = TransportConfig::new()
///     .max_message_size(256 * 1024)
///     .max_channels(16);
/// ```
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum outgoing record size in bytes.
    pub(crate) max_message_size: usize,
    /// Maximum simultaneously open channels on one endpoint.
    pub(crate) max_channels: usize,
    /// Simulated delay before a connect attempt resolves.
    pub(crate) link_latency: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportConfig {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self {
            max_message_size: 1024 * 1024, // 1 MB
            max_channels: 64,
            link_latency: Duration::ZERO,
        }
    }

    /// Set maximum record size (default: 1 MB).
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set the open-channel cap (default: 64). Connects beyond it fail.
    pub fn max_channels(mut self, count: usize) -> Self {
        self.max_channels = count;
        self
    }

    /// Delay every connect attempt by `latency` (default: none).
    pub fn link_latency(mut self, latency: Duration) -> Self {
        self.link_latency = latency;
        self
    }
}
