//! In-process signaling network.
//!
//! One shared registry maps addresses to endpoints and tracks which
//! endpoints are linked. Records are delivered through unbounded channels,
//! so per-channel order is preserved and senders never block on a slow
//! consumer.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::{
    ChannelEvent, Endpoint, EventStream, NodeAddress, Signaling, TransportConfig,
    TransportError,
};

type EndpointId = u64;

struct Slot {
    address: NodeAddress,
    registered: bool,
    events: mpsc::UnboundedSender<ChannelEvent>,
    /// Remote address (as this endpoint knows it) → linked endpoint.
    channels: HashMap<NodeAddress, EndpointId>,
    max_channels: usize,
}

#[derive(Default)]
struct Registry {
    by_address: HashMap<NodeAddress, EndpointId>,
    endpoints: HashMap<EndpointId, Slot>,
    next_id: EndpointId,
}

impl Registry {
    fn emit(&self, id: EndpointId, event: ChannelEvent) {
        if let Some(slot) = self.endpoints.get(&id) {
            let _ = slot.events.send(event);
        }
    }

    /// Drop the channel `id` knows as `remote`, notifying both sides.
    fn unlink(&mut self, id: EndpointId, remote: &NodeAddress) -> bool {
        let Some(slot) = self.endpoints.get_mut(&id) else {
            return false;
        };
        let Some(peer_id) = slot.channels.remove(remote) else {
            return false;
        };
        let local = slot.address.clone();
        let _ = slot.events.send(ChannelEvent::Closed {
            remote: remote.clone(),
        });

        if let Some(peer) = self.endpoints.get_mut(&peer_id) {
            if peer.channels.get(&local) == Some(&id) {
                peer.channels.remove(&local);
                let _ = peer.events.send(ChannelEvent::Closed { remote: local });
            }
        }
        true
    }

    /// Release the address of `id` and close all of its channels.
    fn tear_down(&mut self, id: EndpointId) {
        let Some(slot) = self.endpoints.get(&id) else {
            return;
        };
        let address = slot.address.clone();
        let remotes: Vec<NodeAddress> = slot.channels.keys().cloned().collect();
        for remote in &remotes {
            self.unlink(id, remote);
        }
        if self.by_address.get(&address) == Some(&id) {
            self.by_address.remove(&address);
        }
        self.endpoints.remove(&id);
    }
}

/// Shared in-process signaling registry. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Addresses currently registered, sorted.
    pub async fn registered(&self) -> Vec<NodeAddress> {
        let reg = self.registry.lock().await;
        let mut addrs: Vec<NodeAddress> = reg.by_address.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Whether `address` is currently claimed by some endpoint.
    pub async fn is_registered(&self, address: &NodeAddress) -> bool {
        self.registry.lock().await.by_address.contains_key(address)
    }

    /// Drop the signaling registration of `address` without touching its
    /// open channels. The endpoint receives [`ChannelEvent::SignalingLost`].
    pub async fn expire_registration(&self, address: &NodeAddress) -> bool {
        let mut reg = self.registry.lock().await;
        let Some(id) = reg.by_address.remove(address) else {
            return false;
        };
        if let Some(slot) = reg.endpoints.get_mut(&id) {
            slot.registered = false;
        }
        reg.emit(id, ChannelEvent::SignalingLost);
        true
    }

    /// Break the channel that the endpoint at `address` knows as `remote`.
    pub async fn sever(&self, address: &NodeAddress, remote: &NodeAddress) -> bool {
        let mut reg = self.registry.lock().await;
        let Some(&id) = reg.by_address.get(address) else {
            return false;
        };
        reg.unlink(id, remote)
    }

    /// Simulate an abrupt crash of the endpoint at `address`: the address is
    /// released and every peer sees its channel close.
    pub async fn crash(&self, address: &NodeAddress) -> bool {
        let mut reg = self.registry.lock().await;
        let Some(&id) = reg.by_address.get(address) else {
            return false;
        };
        reg.tear_down(id);
        tracing::debug!(%address, "memory network: endpoint crashed");
        true
    }
}

#[async_trait::async_trait]
impl Signaling for MemoryNetwork {
    type Endpoint = MemoryEndpoint;

    async fn open(
        &self,
        address: NodeAddress,
        config: &TransportConfig,
    ) -> Result<(MemoryEndpoint, EventStream), TransportError> {
        let mut reg = self.registry.lock().await;
        if reg.by_address.contains_key(&address) {
            return Err(TransportError::AddressUnavailable { address });
        }

        let id = reg.next_id;
        reg.next_id += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        reg.by_address.insert(address.clone(), id);
        reg.endpoints.insert(
            id,
            Slot {
                address: address.clone(),
                registered: true,
                events: tx,
                channels: HashMap::new(),
                max_channels: config.max_channels,
            },
        );
        tracing::debug!(%address, "memory network: endpoint registered");

        let endpoint = MemoryEndpoint {
            id,
            address,
            registry: self.registry.clone(),
            max_message_size: config.max_message_size,
            link_latency: config.link_latency,
        };
        Ok((endpoint, rx))
    }
}

/// Endpoint handle on a [`MemoryNetwork`].
pub struct MemoryEndpoint {
    id: EndpointId,
    address: NodeAddress,
    registry: Arc<Mutex<Registry>>,
    max_message_size: usize,
    link_latency: Duration,
}

impl std::fmt::Debug for MemoryEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEndpoint")
            .field("address", &self.address)
            .finish()
    }
}

impl MemoryEndpoint {
    fn fail(
        reg: &Registry,
        id: EndpointId,
        err: TransportError,
        remote: &NodeAddress,
    ) -> TransportError {
        reg.emit(
            id,
            ChannelEvent::Error {
                remote: remote.clone(),
                kind: err.kind(),
                detail: err.to_string(),
            },
        );
        err
    }
}

#[async_trait::async_trait]
impl Endpoint for MemoryEndpoint {
    fn address(&self) -> &NodeAddress {
        &self.address
    }

    async fn connect(&self, remote: &NodeAddress) -> Result<(), TransportError> {
        if !self.link_latency.is_zero() {
            tokio::time::sleep(self.link_latency).await;
        }

        let mut reg = self.registry.lock().await;
        let (registered, already_open, own_limit) = match reg.endpoints.get(&self.id) {
            Some(me) => (
                me.registered,
                me.channels.contains_key(remote),
                me.channels.len() >= me.max_channels,
            ),
            None => return Err(TransportError::Shutdown),
        };

        if !registered {
            return Err(Self::fail(&reg, self.id, TransportError::NotRegistered, remote));
        }
        if *remote == self.address {
            let err = TransportError::InvalidAddress(remote.to_string());
            return Err(Self::fail(&reg, self.id, err, remote));
        }
        if already_open {
            return Ok(());
        }

        let Some(&peer_id) = reg.by_address.get(remote) else {
            let err = TransportError::PeerUnreachable {
                address: remote.clone(),
            };
            return Err(Self::fail(&reg, self.id, err, remote));
        };

        let peer_full = reg
            .endpoints
            .get(&peer_id)
            .map(|p| p.channels.len() >= p.max_channels)
            .unwrap_or(true);
        if own_limit || peer_full {
            let err = TransportError::ChannelLimit {
                address: remote.clone(),
            };
            return Err(Self::fail(&reg, self.id, err, remote));
        }

        // A stale link keyed by our address (previous holder) is replaced.
        let stale = reg
            .endpoints
            .get(&peer_id)
            .and_then(|p| p.channels.get(&self.address).copied())
            .filter(|&other| other != self.id);
        if stale.is_some() {
            reg.unlink(peer_id, &self.address);
        }

        if let Some(me) = reg.endpoints.get_mut(&self.id) {
            me.channels.insert(remote.clone(), peer_id);
        }
        if let Some(peer) = reg.endpoints.get_mut(&peer_id) {
            peer.channels.insert(self.address.clone(), self.id);
        }
        reg.emit(
            self.id,
            ChannelEvent::Open {
                remote: remote.clone(),
            },
        );
        reg.emit(
            peer_id,
            ChannelEvent::Open {
                remote: self.address.clone(),
            },
        );
        tracing::trace!(local = %self.address, %remote, "memory network: channel open");
        Ok(())
    }

    async fn send(&self, remote: &NodeAddress, bytes: Vec<u8>) -> Result<(), TransportError> {
        if bytes.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: bytes.len(),
                max: self.max_message_size,
            });
        }

        let mut reg = self.registry.lock().await;
        let peer_id = reg
            .endpoints
            .get(&self.id)
            .ok_or(TransportError::Shutdown)?
            .channels
            .get(remote)
            .copied()
            .ok_or_else(|| TransportError::ChannelClosed {
                address: remote.clone(),
            })?;

        let delivered = reg
            .endpoints
            .get(&peer_id)
            .map(|peer| {
                peer.events
                    .send(ChannelEvent::Data {
                        remote: self.address.clone(),
                        bytes,
                    })
                    .is_ok()
            })
            .unwrap_or(false);

        if !delivered {
            // Receiver dropped without shutdown.
            reg.unlink(self.id, remote);
            return Err(TransportError::ChannelClosed {
                address: remote.clone(),
            });
        }
        Ok(())
    }

    async fn close(&self, remote: &NodeAddress) {
        self.registry.lock().await.unlink(self.id, remote);
    }

    async fn is_open(&self, remote: &NodeAddress) -> bool {
        self.registry
            .lock()
            .await
            .endpoints
            .get(&self.id)
            .map(|me| me.channels.contains_key(remote))
            .unwrap_or(false)
    }

    async fn open_channels(&self) -> Vec<NodeAddress> {
        let reg = self.registry.lock().await;
        let mut remotes: Vec<NodeAddress> = reg
            .endpoints
            .get(&self.id)
            .map(|me| me.channels.keys().cloned().collect())
            .unwrap_or_default();
        remotes.sort();
        remotes
    }

    async fn reregister(&self) -> Result<(), TransportError> {
        let mut reg = self.registry.lock().await;
        let registered = reg
            .endpoints
            .get(&self.id)
            .ok_or(TransportError::Shutdown)?
            .registered;
        if registered {
            return Ok(());
        }
        if reg.by_address.contains_key(&self.address) {
            return Err(TransportError::AddressUnavailable {
                address: self.address.clone(),
            });
        }
        reg.by_address.insert(self.address.clone(), self.id);
        if let Some(me) = reg.endpoints.get_mut(&self.id) {
            me.registered = true;
        }
        tracing::debug!(address = %self.address, "memory network: re-registered");
        Ok(())
    }

    async fn shutdown(&self) {
        self.registry.lock().await.tear_down(self.id);
    }
}
