//! Durable store: append-only message log with a time index, the outbox,
//! known peers and small settings.
//!
//! Two implementations: [`MemoryStore`] for tests and the simulator,
//! [`SqliteStore`] for real nodes. Storage failures are surfaced to the
//! caller and never retried here.
mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde::{Deserialize, Serialize};

use crate::error::MeshError;
use crate::message::Message;
use crate::types::{KnownPeer, NodeAddress};

/// Settings key for the persisted self address.
pub const SELF_ADDRESS_KEY: &str = "self_address";
/// Settings key for the display name.
pub const DISPLAY_NAME_KEY: &str = "display_name";

// ── Query types ──────────────────────────────────────────────────────

/// A message waiting in the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub message: Message,
    pub enqueued_at: u64,
}

/// Which side of the cursor to page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Newest messages strictly older than the cursor.
    Before,
    /// Oldest messages strictly newer than the cursor.
    After,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryFilter {
    All,
    /// Broadcast messages only.
    Broadcast,
    /// Directed messages between `local` and `peer`, either way.
    Conversation {
        local: NodeAddress,
        peer: NodeAddress,
    },
    /// Broadcasts plus anything sent by or to this address.
    VisibleTo(NodeAddress),
}

impl HistoryFilter {
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            HistoryFilter::All => true,
            HistoryFilter::Broadcast => message.is_broadcast(),
            HistoryFilter::Conversation { local, peer } => {
                let target = message.target.node();
                (&message.sender_address == local && target == Some(peer))
                    || (&message.sender_address == peer && target == Some(local))
            }
            HistoryFilter::VisibleTo(addr) => message.is_broadcast() || message.involves(addr),
        }
    }
}

/// A time-ordered page request. Results are always ascending by
/// `created_at` (ties by id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub limit: usize,
    pub direction: Direction,
    /// Exclusive bound; `None` pages from the newest (`Before`) or the
    /// oldest (`After`) end.
    pub cursor: Option<u64>,
    pub filter: HistoryFilter,
}

impl HistoryQuery {
    /// The newest `limit` messages.
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            direction: Direction::Before,
            cursor: None,
            filter: HistoryFilter::All,
        }
    }

    /// Up to `limit` messages newer than `after`.
    pub fn after(after: u64, limit: usize) -> Self {
        Self {
            limit,
            direction: Direction::After,
            cursor: Some(after),
            filter: HistoryFilter::All,
        }
    }

    /// Up to `limit` messages older than `before`.
    pub fn before(before: u64, limit: usize) -> Self {
        Self {
            limit,
            direction: Direction::Before,
            cursor: Some(before),
            filter: HistoryFilter::All,
        }
    }

    pub fn with_filter(mut self, filter: HistoryFilter) -> Self {
        self.filter = filter;
        self
    }
}

// ── MessageStore trait ───────────────────────────────────────────────

/// Durable store contract. All operations are asynchronous.
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Append a message. Idempotent on id; returns `false` if already stored.
    async fn append(&self, message: &Message) -> Result<bool, MeshError>;

    async fn query_by_time(&self, query: &HistoryQuery) -> Result<Vec<Message>, MeshError>;

    async fn enqueue_outbox(&self, entry: &OutboxEntry) -> Result<(), MeshError>;

    /// Outbox entries in enqueue order.
    async fn list_outbox(&self) -> Result<Vec<OutboxEntry>, MeshError>;

    async fn remove_outbox(&self, id: &str) -> Result<(), MeshError>;

    /// Insert or refresh a known peer.
    async fn save_peer(&self, peer: &KnownPeer) -> Result<(), MeshError>;

    async fn forget_peer(&self, address: &NodeAddress) -> Result<(), MeshError>;

    async fn load_peers(&self) -> Result<Vec<KnownPeer>, MeshError>;

    async fn load_setting(&self, key: &str) -> Result<Option<String>, MeshError>;

    async fn save_setting(&self, key: &str, value: &str) -> Result<(), MeshError>;
}
