/// A set of runtimes sharing one in-process signaling network.
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshcast_protocol::{
    MemoryStore, MeshRuntime, MessageId, NodeAddress, ProtocolEvent, RuntimeConfig,
    RuntimeHandle,
};
use meshcast_transport::MemoryNetwork;
use tokio::sync::mpsc;

pub struct SimNode {
    pub handle: RuntimeHandle,
    pub events: mpsc::Receiver<ProtocolEvent>,
    pub store: Arc<MemoryStore>,
    /// Non-echo deliveries per message id.
    pub delivered: HashMap<MessageId, usize>,
    /// Set once this node announced itself as the rendezvous hub.
    pub became_hub: bool,
}

impl SimNode {
    pub fn address(&self) -> &NodeAddress {
        self.handle.local_address()
    }

    /// Consume every pending event without blocking.
    pub fn drain(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                ProtocolEvent::MessageReady {
                    message,
                    local_echo: false,
                } => *self.delivered.entry(message.id).or_default() += 1,
                ProtocolEvent::SelfIdentityResolved { is_hub: true, .. } => {
                    self.became_hub = true;
                }
                ProtocolEvent::Error { description } => {
                    tracing::warn!(node = %self.handle.local_address(), %description, "node error");
                }
                _ => {}
            }
        }
    }

    pub fn has(&self, id: &str) -> bool {
        self.delivered.contains_key(id)
    }

    pub fn duplicates(&self) -> usize {
        self.delivered.values().map(|n| n.saturating_sub(1)).sum()
    }

    pub async fn connected_to(&self, remote: &NodeAddress) -> bool {
        self.handle.open_channels().await.contains(remote)
    }
}

pub struct Cluster {
    pub net: MemoryNetwork,
    pub nodes: Vec<SimNode>,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            net: MemoryNetwork::new(),
            nodes: Vec::new(),
        }
    }

    /// Boot one node with a fresh in-memory store; returns its index.
    pub async fn spawn(&mut self, config: RuntimeConfig) -> anyhow::Result<usize> {
        self.spawn_with_store(config, Arc::new(MemoryStore::new())).await
    }

    pub async fn spawn_with_store(
        &mut self,
        config: RuntimeConfig,
        store: Arc<MemoryStore>,
    ) -> anyhow::Result<usize> {
        let channels = MeshRuntime::start(self.net.clone(), store.clone(), config).await?;
        tracing::info!(address = %channels.handle.local_address(), "sim node up");
        self.nodes.push(SimNode {
            handle: channels.handle,
            events: channels.events,
            store,
            delivered: HashMap::new(),
            became_hub: false,
        });
        Ok(self.nodes.len() - 1)
    }

    pub fn drain_all(&mut self) {
        for node in &mut self.nodes {
            node.drain();
        }
    }

    /// Drain events until `done` holds or `timeout` passes.
    pub async fn drain_until(
        &mut self,
        timeout: Duration,
        mut done: impl FnMut(&[SimNode]) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.drain_all();
            if done(&self.nodes) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Keep draining for `window`, to catch late duplicates.
    pub async fn drain_for(&mut self, window: Duration) {
        let _ = self.drain_until(window, |_| false).await;
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.handle.shutdown().await;
        }
    }
}

/// Poll `check` every 50 ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
