//! In-memory store for tests and the simulator.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use super::{Direction, HistoryQuery, MessageStore, OutboxEntry};
use crate::error::MeshError;
use crate::message::Message;
use crate::types::{KnownPeer, NodeAddress};

#[derive(Default)]
struct Inner {
    /// Time index: (created_at, id) → message.
    messages: BTreeMap<(u64, String), Message>,
    ids: HashSet<String>,
    /// Enqueue order is preserved by the sequence key.
    outbox: BTreeMap<u64, OutboxEntry>,
    outbox_seq: u64,
    peers: HashMap<NodeAddress, KnownPeer>,
    settings: HashMap<String, String>,
}

/// Volatile [`MessageStore`]. Cheap to share behind an `Arc`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with a storage error (fault injection).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of stored messages.
    pub async fn message_count(&self) -> usize {
        self.inner.lock().await.messages.len()
    }

    fn check_writable(&self) -> Result<(), MeshError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MeshError::Storage("write rejected".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MessageStore for MemoryStore {
    async fn append(&self, message: &Message) -> Result<bool, MeshError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        if !inner.ids.insert(message.id.clone()) {
            return Ok(false);
        }
        inner
            .messages
            .insert((message.created_at, message.id.clone()), message.clone());
        Ok(true)
    }

    async fn query_by_time(&self, query: &HistoryQuery) -> Result<Vec<Message>, MeshError> {
        let inner = self.inner.lock().await;
        let matching = inner
            .messages
            .values()
            .filter(|m| query.filter.matches(m));

        let page = match query.direction {
            Direction::After => {
                let after = query.cursor;
                matching
                    .filter(|m| after.map_or(true, |c| m.created_at > c))
                    .take(query.limit)
                    .cloned()
                    .collect()
            }
            Direction::Before => {
                let before = query.cursor;
                let mut newest: Vec<Message> = matching
                    .rev()
                    .filter(|m| before.map_or(true, |c| m.created_at < c))
                    .take(query.limit)
                    .cloned()
                    .collect();
                newest.reverse();
                newest
            }
        };
        Ok(page)
    }

    async fn enqueue_outbox(&self, entry: &OutboxEntry) -> Result<(), MeshError> {
        self.check_writable()?;
        let mut inner = self.inner.lock().await;
        if inner
            .outbox
            .values()
            .any(|e| e.message.id == entry.message.id)
        {
            return Ok(());
        }
        let seq = inner.outbox_seq;
        inner.outbox_seq += 1;
        inner.outbox.insert(seq, entry.clone());
        Ok(())
    }

    async fn list_outbox(&self) -> Result<Vec<OutboxEntry>, MeshError> {
        Ok(self.inner.lock().await.outbox.values().cloned().collect())
    }

    async fn remove_outbox(&self, id: &str) -> Result<(), MeshError> {
        self.check_writable()?;
        self.inner
            .lock()
            .await
            .outbox
            .retain(|_, e| e.message.id != id);
        Ok(())
    }

    async fn save_peer(&self, peer: &KnownPeer) -> Result<(), MeshError> {
        self.check_writable()?;
        self.inner
            .lock()
            .await
            .peers
            .insert(peer.address.clone(), peer.clone());
        Ok(())
    }

    async fn forget_peer(&self, address: &NodeAddress) -> Result<(), MeshError> {
        self.check_writable()?;
        self.inner.lock().await.peers.remove(address);
        Ok(())
    }

    async fn load_peers(&self) -> Result<Vec<KnownPeer>, MeshError> {
        let inner = self.inner.lock().await;
        let mut peers: Vec<KnownPeer> = inner.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        Ok(peers)
    }

    async fn load_setting(&self, key: &str) -> Result<Option<String>, MeshError> {
        Ok(self.inner.lock().await.settings.get(key).cloned())
    }

    async fn save_setting(&self, key: &str, value: &str) -> Result<(), MeshError> {
        self.check_writable()?;
        self.inner
            .lock()
            .await
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::HistoryFilter;
    use crate::types::Target;

    fn addr(s: &str) -> NodeAddress {
        s.parse().unwrap()
    }

    fn msg(id: &str, ts: u64, target: Target) -> Message {
        Message {
            id: id.into(),
            sender_address: addr("n-a"),
            sender_name: "a".into(),
            body: id.as_bytes().to_vec(),
            created_at: ts,
            target,
            hop_budget: 16,
        }
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        for (i, ts) in [10u64, 20, 30, 40, 50].iter().enumerate() {
            store
                .append(&msg(&format!("m{i}"), *ts, Target::Broadcast))
                .await
                .unwrap();
        }
        store
    }

    fn stamps(msgs: &[Message]) -> Vec<u64> {
        msgs.iter().map(|m| m.created_at).collect()
    }

    #[tokio::test]
    async fn append_is_idempotent() {
        let store = MemoryStore::new();
        let m = msg("x", 1, Target::Broadcast);
        assert!(store.append(&m).await.unwrap());
        assert!(!store.append(&m).await.unwrap());
        assert_eq!(store.message_count().await, 1);
    }

    #[tokio::test]
    async fn after_cursor_is_exclusive_and_ascending() {
        let store = seeded().await;
        let page = store.query_by_time(&HistoryQuery::after(20, 10)).await.unwrap();
        assert_eq!(stamps(&page), vec![30, 40, 50]);
        let capped = store.query_by_time(&HistoryQuery::after(0, 2)).await.unwrap();
        assert_eq!(stamps(&capped), vec![10, 20]);
    }

    #[tokio::test]
    async fn before_returns_newest_ascending() {
        let store = seeded().await;
        let page = store.query_by_time(&HistoryQuery::before(50, 2)).await.unwrap();
        assert_eq!(stamps(&page), vec![30, 40]);
        let latest = store.query_by_time(&HistoryQuery::latest(3)).await.unwrap();
        assert_eq!(stamps(&latest), vec![30, 40, 50]);
    }

    #[tokio::test]
    async fn filter_applies_before_limit() {
        let store = seeded().await;
        store
            .append(&msg("d1", 60, Target::Node(addr("n-b"))))
            .await
            .unwrap();
        let q = HistoryQuery::latest(1).with_filter(HistoryFilter::Broadcast);
        let page = store.query_by_time(&q).await.unwrap();
        assert_eq!(stamps(&page), vec![50]);
    }

    #[tokio::test]
    async fn outbox_keeps_enqueue_order() {
        let store = MemoryStore::new();
        for (id, at) in [("b", 5u64), ("a", 9)] {
            store
                .enqueue_outbox(&OutboxEntry {
                    message: msg(id, at, Target::Broadcast),
                    enqueued_at: at,
                })
                .await
                .unwrap();
        }
        let ids: Vec<String> = store
            .list_outbox()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.message.id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
        store.remove_outbox("b").await.unwrap();
        assert_eq!(store.list_outbox().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn peers_and_settings() {
        let store = MemoryStore::new();
        let peer = KnownPeer {
            address: addr("n-z"),
            display_name: "zed".into(),
            last_seen_at: 3,
        };
        store.save_peer(&peer).await.unwrap();
        assert_eq!(store.load_peers().await.unwrap(), vec![peer.clone()]);
        store.forget_peer(&peer.address).await.unwrap();
        assert!(store.load_peers().await.unwrap().is_empty());

        assert_eq!(store.load_setting("k").await.unwrap(), None);
        store.save_setting("k", "v").await.unwrap();
        assert_eq!(store.load_setting("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn injected_write_failure_surfaces() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let err = store
            .append(&msg("x", 1, Target::Broadcast))
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Storage(_)));
        store.set_fail_writes(false);
        assert!(store.append(&msg("x", 1, Target::Broadcast)).await.unwrap());
    }
}
