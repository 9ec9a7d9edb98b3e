//! meshcast protocol layer.
//!
//! Implements mesh maintenance, flood replication with hop budgets,
//! delta-sync, store-and-forward outbox and rendezvous hub election
//! on top of `meshcast-transport`.
//!
//! Wire format: MessagePack maps (`rmp-serde`).
//! Persistence: SQLite (`rusqlite`) or in-memory.

pub mod dedup;
pub mod error;
pub mod identity;
pub mod mesh;
pub mod message;
pub mod outbox;
pub mod replication;
pub mod runtime;
pub mod store;
pub mod types;

pub use dedup::SeenSet;
pub use error::MeshError;
pub use identity::{HubElection, HubRole, RendezvousSchedule};
pub use mesh::{ChannelRecord, ChannelState, Mesh, MeshAction, MeshConfig};
pub use message::{Message, WireRecord};
pub use outbox::{Outbox, OutboxStep};
pub use replication::{Disposition, Replication};
pub use runtime::{
    MeshRuntime, ProtocolEvent, RuntimeChannels, RuntimeCommand, RuntimeConfig, RuntimeHandle,
};
pub use store::{
    Direction, HistoryFilter, HistoryQuery, MemoryStore, MessageStore, OutboxEntry, SqliteStore,
};
pub use types::{now_ms, ChannelId, KnownPeer, MessageId, NodeAddress, Slot, Target};
