/// Node runtime: wires identity, mesh, replication and outbox into a
/// live event loop.
///
/// The runtime owns the transport endpoints and all protocol state. The
/// application talks to it only through [`RuntimeHandle`] and observes it
/// through [`ProtocolEvent`]s, never touching raw records.
mod effect;
mod executor;
mod r#loop;
mod state;

use std::sync::Arc;
use std::time::Duration;

use meshcast_transport::{ChannelEvent, Signaling, TransportConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot};

use crate::error::MeshError;
use crate::identity;
use crate::mesh::MeshConfig;
use crate::message::Message;
use crate::store::{HistoryQuery, MessageStore, OutboxEntry};
use crate::types::{KnownPeer, MessageId, NodeAddress, Target, DEFAULT_HOP_BUDGET};

use state::RuntimeState;

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for a node runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Name shown to peers. Persisted; defaults to the stored name or the address.
    pub display_name: Option<String>,
    /// Well-known seed addresses, tried in order as our own address and
    /// dialed at startup.
    pub seeds: Vec<NodeAddress>,
    /// Prefix of generated self addresses.
    pub node_prefix: String,
    /// Prefix of the time-windowed rendezvous address.
    pub room_prefix: String,
    /// Length of one rendezvous window.
    pub room_window: Duration,
    /// Contend for the rendezvous address when nobody holds it.
    pub hub_election: bool,
    pub hub_backoff_min: Duration,
    pub hub_backoff_max: Duration,
    pub mesh: MeshConfig,
    /// Initial hop budget of locally composed messages.
    pub hop_budget: u8,
    /// Message ids remembered for dedup.
    pub dedup_capacity: usize,
    /// Maximum messages in one `SYNC_RESPONSE`.
    pub sync_limit: usize,
    /// Outbox entries older than this are dropped unsent.
    pub outbox_ttl: Duration,
    /// Inbound messages stamped further than this ahead of the local
    /// clock are dropped.
    pub max_clock_skew: Duration,
    pub maintenance_interval: Duration,
    pub pex_interval: Duration,
    pub retry_interval: Duration,
    pub transport: TransportConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            display_name: None,
            seeds: Vec::new(),
            node_prefix: "n".to_string(),
            room_prefix: "mc-room".to_string(),
            room_window: Duration::from_secs(3600),
            hub_election: true,
            hub_backoff_min: Duration::from_millis(200),
            hub_backoff_max: Duration::from_millis(1500),
            mesh: MeshConfig::default(),
            hop_budget: DEFAULT_HOP_BUDGET,
            dedup_capacity: crate::dedup::DEFAULT_CAPACITY,
            sync_limit: 100,
            outbox_ttl: crate::outbox::DEFAULT_TTL,
            max_clock_skew: crate::replication::DEFAULT_MAX_SKEW,
            maintenance_interval: Duration::from_secs(4),
            pex_interval: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
            transport: TransportConfig::default(),
        }
    }
}

// ── Commands (app → runtime) ──────────────────────────────────────────

/// Commands the application sends to the runtime event loop.
pub enum RuntimeCommand {
    /// Compose, persist and send a message.
    SendMessage {
        body: Vec<u8>,
        target: Target,
        reply: oneshot::Sender<Result<MessageId, MeshError>>,
    },
    /// Page stored history.
    History {
        query: HistoryQuery,
        reply: oneshot::Sender<Result<Vec<Message>, MeshError>>,
    },
    KnownPeers {
        reply: oneshot::Sender<Vec<KnownPeer>>,
    },
    /// Addresses of currently open channels.
    OpenChannels {
        reply: oneshot::Sender<Vec<NodeAddress>>,
    },
    /// Dial an address now (subject to the cool-down).
    Connect { address: NodeAddress },
    /// Foreground/visibility hint: reconnect immediately.
    Wake,
    /// Graceful shutdown.
    Shutdown,
}

/// Internal inputs fed back into the loop by the executor and its tasks.
#[derive(Debug)]
pub(crate) enum NodeInput {
    /// An event from the endpoint registered as `local`.
    Channel { local: NodeAddress, event: ChannelEvent },
    HubClaimed { address: NodeAddress },
    HubRejected { address: NodeAddress },
    ContentionDue,
    Requeue(OutboxEntry),
    Reregistered(bool),
}

// ── Events (runtime → app) ───────────────────────────────────────────

/// Events for the UI/display collaborator.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// A message should be shown. `local_echo` is set for our own messages.
    MessageReady { message: Message, local_echo: bool },
    PeerListChanged {
        known_peers: Vec<KnownPeer>,
        active_channels: Vec<NodeAddress>,
    },
    SelfIdentityResolved {
        address: NodeAddress,
        display_name: String,
        is_hub: bool,
    },
    /// Non-fatal error (storage failure, undeliverable record).
    Error { description: String },
}

// ── RuntimeHandle (app-facing API) ───────────────────────────────────

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct RuntimeHandle {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
    local_address: NodeAddress,
}

impl RuntimeHandle {
    /// The primary address this node registered under.
    pub fn local_address(&self) -> &NodeAddress {
        &self.local_address
    }

    /// Send a message. Returns once it is persisted and queued; delivery
    /// is best effort. Storage errors are returned.
    pub async fn send_message(
        &self,
        body: impl Into<Vec<u8>>,
        target: Target,
    ) -> Result<MessageId, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCommand::SendMessage {
                body: body.into(),
                target,
                reply: tx,
            })
            .await
            .map_err(|_| MeshError::RuntimeShutDown)?;
        rx.await.map_err(|_| MeshError::RuntimeShutDown)?
    }

    /// Page stored history (ascending by timestamp).
    pub async fn history(&self, query: HistoryQuery) -> Result<Vec<Message>, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(RuntimeCommand::History { query, reply: tx })
            .await
            .map_err(|_| MeshError::RuntimeShutDown)?;
        rx.await.map_err(|_| MeshError::RuntimeShutDown)?
    }

    pub async fn known_peers(&self) -> Vec<KnownPeer> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(RuntimeCommand::KnownPeers { reply: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    pub async fn open_channels(&self) -> Vec<NodeAddress> {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(RuntimeCommand::OpenChannels { reply: tx })
            .await;
        rx.await.unwrap_or_default()
    }

    pub async fn connect(&self, address: NodeAddress) {
        let _ = self.cmd_tx.send(RuntimeCommand::Connect { address }).await;
    }

    pub async fn wake(&self) {
        let _ = self.cmd_tx.send(RuntimeCommand::Wake).await;
    }

    /// Graceful shutdown: releases every endpoint.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RuntimeCommand::Shutdown).await;
    }
}

// ── RuntimeChannels ──────────────────────────────────────────────────

/// Returned to the application when the runtime starts.
pub struct RuntimeChannels {
    pub handle: RuntimeHandle,
    pub events: mpsc::Receiver<ProtocolEvent>,
}

// ── MeshRuntime ──────────────────────────────────────────────────────

/// Entry point: bootstrap a node and spawn its event loop.
pub struct MeshRuntime;

impl MeshRuntime {
    /// Resolve identity, claim a seed or self address, restore persisted
    /// state and spawn the event loop as a tokio task.
    ///
    /// Only bootstrap failures are returned; everything after that is
    /// recovered inside the loop.
    pub async fn start<S: Signaling>(
        signaling: S,
        store: Arc<dyn MessageStore>,
        config: RuntimeConfig,
    ) -> Result<RuntimeChannels, MeshError> {
        let node_prefix: NodeAddress = config
            .node_prefix
            .parse()
            .map_err(|e| MeshError::Config(format!("node_prefix: {e}")))?;
        let room_prefix: NodeAddress = config
            .room_prefix
            .parse()
            .map_err(|e| MeshError::Config(format!("room_prefix: {e}")))?;
        if config.mesh.min_degree > config.mesh.max_degree {
            return Err(MeshError::Config(format!(
                "min_degree {} exceeds max_degree {}",
                config.mesh.min_degree, config.mesh.max_degree
            )));
        }

        let boot = identity::attempt_seed_claim(
            &signaling,
            &config.seeds,
            store.as_ref(),
            &node_prefix,
            &config.transport,
        )
        .await?;
        let display_name =
            identity::resolve_display_name(store.as_ref(), config.display_name.as_deref(), &boot.address)
                .await?;

        let peers = store.load_peers().await?;
        let outbox = store.list_outbox().await?;
        let recent = store
            .query_by_time(&HistoryQuery::latest(config.dedup_capacity))
            .await?;

        let mut state = RuntimeState::new(
            boot.address.clone(),
            display_name,
            boot.seed,
            room_prefix,
            config.clone(),
            StdRng::from_os_rng(),
        );
        state.restore(peers, outbox, &recent);

        let (cmd_tx, cmd_rx) = mpsc::channel::<RuntimeCommand>(64);
        let (event_tx, event_rx) = mpsc::channel::<ProtocolEvent>(1024);
        let (input_tx, input_rx) = mpsc::unbounded_channel::<NodeInput>();

        let executor = executor::Executor::new(
            signaling,
            config.transport.clone(),
            boot.endpoint,
            boot.events,
            store.clone(),
            input_tx,
            event_tx,
        );

        tokio::spawn(r#loop::runtime_loop(
            state, executor, store, config, cmd_rx, input_rx,
        ));

        Ok(RuntimeChannels {
            handle: RuntimeHandle {
                cmd_tx,
                local_address: boot.address,
            },
            events: event_rx,
        })
    }
}
