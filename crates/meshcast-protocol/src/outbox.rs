/// Outbox / retry manager.
///
/// In-memory mirror of the persisted outbox. Each retry pass decides, per
/// entry, whether to flood it, send it over a direct or rendezvous channel,
/// dial its target, or drop it as expired. An attempted entry leaves the
/// in-memory queue; a failed directed send is put back with [`Outbox::requeue`].
///
/// Delivery is best effort: a broadcast is cleared after one flood over at
/// least one open channel, acknowledged or not.
use std::time::Duration;

use crate::mesh::Mesh;
use crate::message::Message;
use crate::store::OutboxEntry;
use crate::types::{ChannelId, MessageId, NodeAddress};

/// Default lifetime of an outbox entry.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// One decision of a retry pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxStep {
    /// Older than the TTL: drop unsent.
    Expired(MessageId),
    /// Broadcast: send to every listed channel, then remove.
    Flood {
        message: Message,
        channels: Vec<ChannelId>,
    },
    /// Directed: send over `channel`; remove on success, requeue on failure.
    Send {
        channel: ChannelId,
        entry: OutboxEntry,
    },
    /// Directed, no route yet: dial the target and keep waiting.
    Dial(NodeAddress),
}

pub struct Outbox {
    entries: Vec<OutboxEntry>,
    ttl: Duration,
}

impl Outbox {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Vec::new(),
            ttl,
        }
    }

    /// Load persisted entries (enqueue order).
    pub fn restore(&mut self, entries: Vec<OutboxEntry>) {
        for entry in entries {
            self.enqueue(entry);
        }
    }

    pub fn enqueue(&mut self, entry: OutboxEntry) {
        if !self.contains(&entry.message.id) {
            self.entries.push(entry);
        }
    }

    /// Put back an entry whose send failed.
    pub fn requeue(&mut self, entry: OutboxEntry) {
        self.enqueue(entry);
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.message.id != id);
        self.entries.len() != before
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.message.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn is_expired(&self, entry: &OutboxEntry, now: u64) -> bool {
        now >= entry.enqueued_at.saturating_add(self.ttl.as_millis() as u64)
    }

    /// One retry pass. `rendezvous` is the current rendezvous address,
    /// used as a relay for directed entries with no direct channel.
    pub fn retry(&mut self, now: u64, mesh: &mut Mesh, rendezvous: &NodeAddress) -> Vec<OutboxStep> {
        let mut steps = Vec::new();
        let open = mesh.open_channels();
        let pending = std::mem::take(&mut self.entries);

        for entry in pending {
            if self.is_expired(&entry, now) {
                tracing::debug!(id = %entry.message.id, "outbox entry expired");
                steps.push(OutboxStep::Expired(entry.message.id));
                continue;
            }

            let Some(target) = entry.message.target.node().cloned() else {
                if open.is_empty() {
                    self.entries.push(entry);
                } else {
                    steps.push(OutboxStep::Flood {
                        message: entry.message,
                        channels: open.clone(),
                    });
                }
                continue;
            };

            let route = mesh
                .open_channel_to(&target)
                .or_else(|| mesh.open_channel_to(rendezvous));
            match route {
                Some(channel) => steps.push(OutboxStep::Send { channel, entry }),
                None => {
                    if mesh.ensure_connected(&target, now) {
                        steps.push(OutboxStep::Dial(target));
                    }
                    self.entries.push(entry);
                }
            }
        }
        steps
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RendezvousSchedule;
    use crate::mesh::MeshConfig;
    use crate::types::Target;

    fn addr(s: &str) -> NodeAddress {
        s.parse().unwrap()
    }

    fn mesh() -> Mesh {
        Mesh::new(
            MeshConfig::default(),
            addr("n-self"),
            vec![],
            RendezvousSchedule::new(addr("mc-room"), Duration::from_secs(3600)),
        )
    }

    fn entry(id: &str, target: Target, enqueued_at: u64) -> OutboxEntry {
        OutboxEntry {
            message: Message {
                id: id.into(),
                sender_address: addr("n-self"),
                sender_name: "me".into(),
                body: b"x".to_vec(),
                created_at: enqueued_at,
                target,
                hop_budget: 16,
            },
            enqueued_at,
        }
    }

    fn room() -> NodeAddress {
        addr("mc-room-0")
    }

    #[test]
    fn broadcast_waits_for_an_open_channel() {
        let mut m = mesh();
        let mut o = Outbox::default();
        o.enqueue(entry("b1", Target::Broadcast, 0));
        assert!(o.retry(1, &mut m, &room()).is_empty());
        assert_eq!(o.len(), 1);

        m.on_channel_open(&ChannelId::primary(addr("n-a")), 2);
        let steps = o.retry(3, &mut m, &room());
        assert!(matches!(&steps[..], [OutboxStep::Flood { channels, .. }] if channels.len() == 1));
        assert!(o.is_empty());
    }

    #[test]
    fn directed_prefers_direct_then_rendezvous() {
        let mut m = mesh();
        let mut o = Outbox::default();
        m.on_channel_open(&ChannelId::primary(room()), 0);
        o.enqueue(entry("d1", Target::Node(addr("n-d")), 0));
        let steps = o.retry(1, &mut m, &room());
        assert!(
            matches!(&steps[..], [OutboxStep::Send { channel, .. }] if channel.remote == room())
        );

        m.on_channel_open(&ChannelId::primary(addr("n-d")), 2);
        o.enqueue(entry("d2", Target::Node(addr("n-d")), 2));
        let steps = o.retry(3, &mut m, &room());
        assert!(
            matches!(&steps[..], [OutboxStep::Send { channel, .. }] if channel.remote == addr("n-d"))
        );
    }

    #[test]
    fn unroutable_directed_dials_once_and_stays() {
        let mut m = mesh();
        let mut o = Outbox::default();
        o.enqueue(entry("d1", Target::Node(addr("n-d")), 0));
        assert_eq!(o.retry(1, &mut m, &room()), vec![OutboxStep::Dial(addr("n-d"))]);
        // Dial in flight: nothing new.
        assert!(o.retry(2, &mut m, &room()).is_empty());
        assert!(o.contains("d1"));
    }

    #[test]
    fn expired_entries_are_dropped() {
        let mut m = mesh();
        let mut o = Outbox::default();
        o.enqueue(entry("b1", Target::Broadcast, 0));
        let steps = o.retry(60_000, &mut m, &room());
        assert_eq!(steps, vec![OutboxStep::Expired("b1".into())]);
        assert!(o.is_empty());
    }

    #[test]
    fn requeue_and_duplicates() {
        let mut o = Outbox::default();
        let e = entry("d1", Target::Node(addr("n-d")), 0);
        o.enqueue(e.clone());
        o.enqueue(e.clone());
        assert_eq!(o.len(), 1);
        assert!(o.remove("d1"));
        o.requeue(e);
        assert!(o.contains("d1"));
    }
}
