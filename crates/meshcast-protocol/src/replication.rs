/// Replication engine: dedup, timestamp normalization, flood and delta-sync.
///
/// Pure logic. The caller persists what [`Disposition::Accepted`] says to
/// deliver and sends the forwarded copy to the listed channels.
use std::time::Duration;

use crate::dedup::SeenSet;
use crate::mesh::Mesh;
use crate::message::Message;
use crate::store::{HistoryFilter, HistoryQuery};
use crate::types::{ChannelId, NodeAddress, Target};

/// Outcome of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Already seen: no store, no re-flood.
    Duplicate,
    /// Stamped too far in the future to order against local history.
    /// Not marked seen, not stored, not forwarded.
    Rejected,
    Accepted {
        /// The message with its normalized timestamp.
        message: Message,
        /// Persist and hand to the application.
        deliver: bool,
        /// Relayed copy (hop budget decremented) and where to send it.
        forward: Option<(Message, Vec<ChannelId>)>,
    },
}

/// How far ahead of the local clock an inbound `created_at` may be.
pub const DEFAULT_MAX_SKEW: Duration = Duration::from_secs(300);

pub struct Replication {
    seen: SeenSet,
    /// Highest `created_at` observed locally.
    high_water: u64,
    max_skew_ms: u64,
    hop_budget: u8,
    sync_limit: usize,
}

impl Replication {
    pub fn new(dedup_capacity: usize, hop_budget: u8, sync_limit: usize) -> Self {
        Self {
            seen: SeenSet::new(dedup_capacity),
            high_water: 0,
            max_skew_ms: DEFAULT_MAX_SKEW.as_millis() as u64,
            hop_budget,
            sync_limit,
        }
    }

    pub fn with_max_skew(mut self, skew: Duration) -> Self {
        self.max_skew_ms = u64::try_from(skew.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Rebuild the dedup set and high-water mark from stored messages
    /// (oldest first).
    pub fn restore(&mut self, recent: &[Message]) {
        for message in recent {
            self.seen.insert(&message.id);
            self.high_water = self.high_water.max(message.created_at);
        }
    }

    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    pub fn has_seen(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Build a local message with a fresh id and a normalized timestamp.
    /// It is marked seen so echoes from the mesh are discarded.
    pub fn compose(
        &mut self,
        sender_address: NodeAddress,
        sender_name: String,
        body: Vec<u8>,
        target: Target,
        now: u64,
    ) -> Message {
        let created_at = now.max(self.high_water.saturating_add(1));
        self.high_water = created_at;
        let message = Message {
            id: Message::new_id(now),
            sender_address,
            sender_name,
            body,
            created_at,
            target,
            hop_budget: self.hop_budget,
        };
        self.seen.insert(&message.id);
        message
    }

    /// Mark seen and correct `created_at` to sit above everything observed.
    fn admit(&mut self, mut message: Message, now: u64) -> Result<Message, Disposition> {
        if message.created_at > now.saturating_add(self.max_skew_ms) {
            return Err(Disposition::Rejected);
        }
        if !self.seen.insert(&message.id) {
            return Err(Disposition::Duplicate);
        }
        if message.created_at <= self.high_water {
            message.created_at = self.high_water.saturating_add(1);
        }
        self.high_water = message.created_at;
        Ok(message)
    }

    /// A pushed `MESSAGE` record arrived on `source` at local time `now`.
    pub fn on_inbound(
        &mut self,
        message: Message,
        source: &ChannelId,
        mesh: &Mesh,
        now: u64,
    ) -> Disposition {
        let id = message.id.clone();
        let message = match self.admit(message, now) {
            Ok(message) => message,
            Err(Disposition::Rejected) => {
                tracing::warn!(channel = %source, %id, "message stamped in the future dropped");
                return Disposition::Rejected;
            }
            Err(other) => {
                tracing::debug!(channel = %source, "duplicate message dropped");
                return other;
            }
        };

        let deliver = match message.target.node() {
            None => true,
            Some(target) => mesh.is_own(target),
        };

        let forward = match message.target.node() {
            None => message.relayed().and_then(|copy| {
                let channels: Vec<ChannelId> = mesh
                    .open_channels()
                    .into_iter()
                    .filter(|id| id != source)
                    .collect();
                (!channels.is_empty()).then_some((copy, channels))
            }),
            Some(target) if !deliver => message.relayed().and_then(|copy| {
                mesh.open_channel_to(target)
                    .filter(|id| id != source)
                    .map(|id| (copy, vec![id]))
            }),
            Some(_) => None,
        };

        Disposition::Accepted {
            message,
            deliver,
            forward,
        }
    }

    /// Messages from a `SYNC_RESPONSE`. Each goes through dedup and
    /// normalization but is never re-flooded. Returns those to persist.
    pub fn on_sync_response(
        &mut self,
        messages: Vec<Message>,
        mesh: &Mesh,
        now: u64,
    ) -> Vec<Message> {
        messages
            .into_iter()
            .filter_map(|m| self.admit(m, now).ok())
            .filter(|m| match m.target.node() {
                None => true,
                Some(target) => mesh.is_own(target) || mesh.is_own(&m.sender_address),
            })
            .collect()
    }

    /// Store query answering a `SYNC_REQUEST` from `requester`.
    pub fn sync_query(&self, after: u64, requester: NodeAddress) -> HistoryQuery {
        HistoryQuery::after(after, self.sync_limit).with_filter(HistoryFilter::VisibleTo(requester))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::identity::RendezvousSchedule;
    use crate::mesh::MeshConfig;

    fn addr(s: &str) -> NodeAddress {
        s.parse().unwrap()
    }

    fn mesh() -> Mesh {
        let mut m = Mesh::new(
            MeshConfig::default(),
            addr("n-self"),
            vec![],
            RendezvousSchedule::new(addr("mc-room"), Duration::from_secs(3600)),
        );
        for r in ["n-a", "n-b", "n-c"] {
            m.on_channel_open(&ChannelId::primary(addr(r)), 0);
        }
        m
    }

    fn msg(id: &str, target: Target, created_at: u64, hop_budget: u8) -> Message {
        Message {
            id: id.into(),
            sender_address: addr("n-origin"),
            sender_name: "origin".into(),
            body: b"hi".to_vec(),
            created_at,
            target,
            hop_budget,
        }
    }

    const NOW: u64 = 1_700_000_000_000;

    fn engine() -> Replication {
        Replication::new(100, 16, 100)
    }

    #[test]
    fn broadcast_floods_everywhere_but_source() {
        let m = mesh();
        let mut r = engine();
        let src = ChannelId::primary(addr("n-a"));
        let Disposition::Accepted { deliver, forward, .. } =
            r.on_inbound(msg("m1", Target::Broadcast, 10, 5), &src, &m, NOW)
        else {
            panic!("expected accepted");
        };
        assert!(deliver);
        let (copy, channels) = forward.unwrap();
        assert_eq!(copy.hop_budget, 4);
        assert_eq!(channels.len(), 2);
        assert!(!channels.contains(&src));
    }

    #[test]
    fn duplicate_is_dropped() {
        let m = mesh();
        let mut r = engine();
        let src = ChannelId::primary(addr("n-a"));
        assert!(matches!(
            r.on_inbound(msg("m1", Target::Broadcast, 10, 5), &src, &m, NOW),
            Disposition::Accepted { .. }
        ));
        let other = ChannelId::primary(addr("n-b"));
        assert_eq!(
            r.on_inbound(msg("m1", Target::Broadcast, 10, 5), &other, &m, NOW),
            Disposition::Duplicate
        );
    }

    #[test]
    fn exhausted_budget_is_delivered_not_forwarded() {
        let m = mesh();
        let mut r = engine();
        let src = ChannelId::primary(addr("n-a"));
        let Disposition::Accepted { deliver, forward, .. } =
            r.on_inbound(msg("m1", Target::Broadcast, 10, 0), &src, &m, NOW)
        else {
            panic!("expected accepted");
        };
        assert!(deliver);
        assert!(forward.is_none());
    }

    #[test]
    fn timestamps_are_normalized_upward() {
        let m = mesh();
        let mut r = engine();
        let src = ChannelId::primary(addr("n-a"));
        r.on_inbound(msg("m1", Target::Broadcast, 500, 1), &src, &m, NOW);
        let Disposition::Accepted { message, .. } =
            r.on_inbound(msg("m2", Target::Broadcast, 100, 1), &src, &m, NOW)
        else {
            panic!("expected accepted");
        };
        assert_eq!(message.created_at, 501);
        assert_eq!(r.high_water(), 501);

        let local = r.compose(addr("n-self"), "me".into(), vec![], Target::Broadcast, 10);
        assert_eq!(local.created_at, 502);
        assert!(r.has_seen(&local.id));
    }

    #[test]
    fn directed_for_us_is_delivered_only() {
        let m = mesh();
        let mut r = engine();
        let src = ChannelId::primary(addr("n-a"));
        let Disposition::Accepted { deliver, forward, .. } =
            r.on_inbound(msg("m1", Target::Node(addr("n-self")), 1, 5), &src, &m, NOW)
        else {
            panic!("expected accepted");
        };
        assert!(deliver);
        assert!(forward.is_none());
    }

    #[test]
    fn directed_for_other_relays_to_exact_target() {
        let m = mesh();
        let mut r = engine();
        let src = ChannelId::primary(addr("n-a"));
        let Disposition::Accepted { deliver, forward, .. } =
            r.on_inbound(msg("m1", Target::Node(addr("n-c")), 1, 5), &src, &m, NOW)
        else {
            panic!("expected accepted");
        };
        assert!(!deliver);
        let (_, channels) = forward.unwrap();
        assert_eq!(channels, vec![ChannelId::primary(addr("n-c"))]);

        // No channel to the target: dropped.
        let Disposition::Accepted { forward, .. } =
            r.on_inbound(msg("m2", Target::Node(addr("n-zz")), 1, 5), &src, &m, NOW)
        else {
            panic!("expected accepted");
        };
        assert!(forward.is_none());
    }

    #[test]
    fn hub_delivers_messages_for_rendezvous() {
        let mut m = mesh();
        m.set_hub(Some(addr("mc-room-7")));
        let mut r = engine();
        let src = ChannelId::hub(addr("n-a"));
        let Disposition::Accepted { deliver, .. } =
            r.on_inbound(msg("m1", Target::Node(addr("mc-room-7")), 1, 5), &src, &m, NOW)
        else {
            panic!("expected accepted");
        };
        assert!(deliver);
    }

    #[test]
    fn sync_response_filters_and_dedups() {
        let m = mesh();
        let mut r = engine();
        r.restore(&[msg("old", Target::Broadcast, 50, 1)]);
        let kept = r.on_sync_response(
            vec![
                msg("old", Target::Broadcast, 50, 1),
                msg("b", Target::Broadcast, 60, 1),
                msg("mine", Target::Node(addr("n-self")), 70, 1),
                msg("theirs", Target::Node(addr("n-x")), 80, 1),
            ],
            &m,
            NOW,
        );
        let ids: Vec<&str> = kept.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "mine"]);
    }

    #[test]
    fn sync_query_is_scoped_to_requester() {
        let r = engine();
        let q = r.sync_query(42, addr("n-a"));
        assert_eq!(q.cursor, Some(42));
        assert_eq!(q.limit, 100);
        assert_eq!(q.filter, HistoryFilter::VisibleTo(addr("n-a")));
    }

    #[test]
    fn far_future_timestamp_is_rejected() {
        let m = mesh();
        let mut r = engine();
        let src = ChannelId::primary(addr("n-a"));
        assert_eq!(
            r.on_inbound(msg("huge", Target::Broadcast, u64::MAX, 5), &src, &m, NOW),
            Disposition::Rejected
        );
        assert_eq!(r.high_water(), 0);
        assert!(!r.has_seen("huge"));

        let Disposition::Accepted { message, .. } =
            r.on_inbound(msg("normal", Target::Broadcast, NOW, 5), &src, &m, NOW)
        else {
            panic!("expected accepted");
        };
        assert_eq!(message.created_at, NOW);

        let skewed = NOW + DEFAULT_MAX_SKEW.as_millis() as u64;
        assert!(matches!(
            r.on_inbound(msg("edge", Target::Broadcast, skewed, 5), &src, &m, NOW),
            Disposition::Accepted { .. }
        ));
        assert!(r
            .on_sync_response(vec![msg("late", Target::Broadcast, u64::MAX, 1)], &m, NOW)
            .is_empty());
    }

    #[test]
    fn normalization_saturates_at_the_top() {
        let m = mesh();
        let mut r = engine().with_max_skew(Duration::MAX);
        let src = ChannelId::primary(addr("n-a"));
        r.on_inbound(msg("top", Target::Broadcast, u64::MAX, 5), &src, &m, NOW);
        let Disposition::Accepted { message, .. } =
            r.on_inbound(msg("next", Target::Broadcast, 1, 5), &src, &m, NOW)
        else {
            panic!("expected accepted");
        };
        assert_eq!(message.created_at, u64::MAX);
        assert_eq!(r.high_water(), u64::MAX);
        let local = r.compose(addr("n-self"), "me".into(), vec![], Target::Broadcast, NOW);
        assert_eq!(local.created_at, u64::MAX);
    }
}
