//! SQLite-backed store.
//!
//! One connection behind a mutex; every call runs on the blocking pool so
//! the event loop never waits on disk I/O directly.
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};

use super::{Direction, HistoryFilter, HistoryQuery, MessageStore, OutboxEntry};
use crate::error::MeshError;
use crate::message::Message;
use crate::types::{KnownPeer, NodeAddress, Target};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id             TEXT PRIMARY KEY,
    sender_address TEXT NOT NULL,
    sender_name    TEXT NOT NULL,
    body           BLOB NOT NULL,
    created_at     INTEGER NOT NULL,
    target         TEXT,
    hop_budget     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_by_time ON messages (created_at, id);

CREATE TABLE IF NOT EXISTS outbox (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    enqueued_at INTEGER NOT NULL,
    entry       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS known_peers (
    address      TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    last_seen_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const MESSAGE_COLUMNS: &str =
    "id, sender_address, sender_name, body, created_at, target, hop_budget";

/// Persistent [`MessageStore`] on a single SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MeshError> {
        Self::init(Connection::open(path)?)
    }

    /// Fresh private database, gone on drop.
    pub fn open_in_memory() -> Result<Self, MeshError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, MeshError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, MeshError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, MeshError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| MeshError::Storage("connection mutex poisoned".into()))?;
            f(&mut guard)
        })
        .await?
    }
}

// ── Row mapping ──────────────────────────────────────────────────────

struct MessageRow {
    id: String,
    sender_address: String,
    sender_name: String,
    body: Vec<u8>,
    created_at: i64,
    target: Option<String>,
    hop_budget: i64,
}

impl MessageRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            sender_address: row.get(1)?,
            sender_name: row.get(2)?,
            body: row.get(3)?,
            created_at: row.get(4)?,
            target: row.get(5)?,
            hop_budget: row.get(6)?,
        })
    }

    fn into_message(self) -> Result<Message, MeshError> {
        let target = match self.target {
            Some(raw) => Target::Node(parse_address(&raw)?),
            None => Target::Broadcast,
        };
        Ok(Message {
            id: self.id,
            sender_address: parse_address(&self.sender_address)?,
            sender_name: self.sender_name,
            body: self.body,
            created_at: u64::try_from(self.created_at)
                .map_err(|_| MeshError::Storage(format!("corrupt row: created_at {}", self.created_at)))?,
            target,
            hop_budget: self.hop_budget.clamp(0, u8::MAX as i64) as u8,
        })
    }
}

fn parse_address(raw: &str) -> Result<NodeAddress, MeshError> {
    raw.parse()
        .map_err(|e| MeshError::Storage(format!("corrupt row: {e}")))
}

/// WHERE clause and bind values for a filter.
fn filter_clause(filter: &HistoryFilter, values: &mut Vec<Value>) -> &'static str {
    match filter {
        HistoryFilter::All => "1 = 1",
        HistoryFilter::Broadcast => "target IS NULL",
        HistoryFilter::Conversation { local, peer } => {
            values.push(Value::Text(local.to_string()));
            values.push(Value::Text(peer.to_string()));
            "((sender_address = ?1 AND target = ?2) OR (sender_address = ?2 AND target = ?1))"
        }
        HistoryFilter::VisibleTo(addr) => {
            values.push(Value::Text(addr.to_string()));
            "(target IS NULL OR target = ?1 OR sender_address = ?1)"
        }
    }
}

fn build_query(query: &HistoryQuery) -> (String, Vec<Value>) {
    let mut values = Vec::new();
    let filter = filter_clause(&query.filter, &mut values);

    let (cursor_op, order) = match query.direction {
        Direction::After => (">", "ASC"),
        Direction::Before => ("<", "DESC"),
    };
    let cursor = match query.cursor {
        Some(c) => {
            values.push(Value::Integer(c.min(i64::MAX as u64) as i64));
            format!("AND created_at {cursor_op} ?{}", values.len())
        }
        None => String::new(),
    };
    values.push(Value::Integer(query.limit.min(i64::MAX as usize) as i64));

    let sql = format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE {filter} {cursor} \
         ORDER BY created_at {order}, id {order} LIMIT ?{}",
        values.len()
    );
    (sql, values)
}

// ── MessageStore impl ────────────────────────────────────────────────

#[async_trait::async_trait]
impl MessageStore for SqliteStore {
    async fn append(&self, message: &Message) -> Result<bool, MeshError> {
        let created_at = i64::try_from(message.created_at).map_err(|_| {
            MeshError::Storage(format!("created_at {} out of range", message.created_at))
        })?;
        let m = message.clone();
        self.with_conn(move |conn| {
            let target: Option<String> = m.target.node().map(|a| a.to_string());
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO messages (id, sender_address, sender_name, body, created_at, target, hop_budget)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    m.id,
                    m.sender_address.as_str(),
                    m.sender_name,
                    m.body,
                    created_at,
                    target,
                    m.hop_budget as i64,
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn query_by_time(&self, query: &HistoryQuery) -> Result<Vec<Message>, MeshError> {
        let (sql, values) = build_query(query);
        let descending = query.direction == Direction::Before;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(values), MessageRow::read)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut messages = rows
                .into_iter()
                .map(MessageRow::into_message)
                .collect::<Result<Vec<_>, _>>()?;
            if descending {
                messages.reverse();
            }
            Ok(messages)
        })
        .await
    }

    async fn enqueue_outbox(&self, entry: &OutboxEntry) -> Result<(), MeshError> {
        let id = entry.message.id.clone();
        let enqueued_at = entry.enqueued_at as i64;
        let json = serde_json::to_string(entry)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO outbox (id, enqueued_at, entry) VALUES (?1, ?2, ?3)",
                params![id, enqueued_at, json],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_outbox(&self) -> Result<Vec<OutboxEntry>, MeshError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT entry FROM outbox ORDER BY seq ASC")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.iter()
                .map(|json| serde_json::from_str(json).map_err(MeshError::from))
                .collect()
        })
        .await
    }

    async fn remove_outbox(&self, id: &str) -> Result<(), MeshError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn save_peer(&self, peer: &KnownPeer) -> Result<(), MeshError> {
        let peer = peer.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO known_peers (address, display_name, last_seen_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(address) DO UPDATE SET
                    display_name = excluded.display_name,
                    last_seen_at = excluded.last_seen_at",
                params![
                    peer.address.as_str(),
                    peer.display_name,
                    peer.last_seen_at as i64
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn forget_peer(&self, address: &NodeAddress) -> Result<(), MeshError> {
        let address = address.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM known_peers WHERE address = ?1", params![address])?;
            Ok(())
        })
        .await
    }

    async fn load_peers(&self) -> Result<Vec<KnownPeer>, MeshError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT address, display_name, last_seen_at FROM known_peers ORDER BY address",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(|(address, display_name, last_seen_at)| {
                    Ok(KnownPeer {
                        address: parse_address(&address)?,
                        display_name,
                        last_seen_at: last_seen_at.max(0) as u64,
                    })
                })
                .collect()
        })
        .await
    }

    async fn load_setting(&self, key: &str) -> Result<Option<String>, MeshError> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            let value = conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn save_setting(&self, key: &str, value: &str) -> Result<(), MeshError> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }
}
