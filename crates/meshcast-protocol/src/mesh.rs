/// Mesh manager: the channel set, known peers and connect cool-downs.
///
/// Pure state machine: callers feed channel lifecycle events and timer
/// ticks, the mesh answers with [`MeshAction`]s to perform. Other modules
/// refer to channels only by [`ChannelId`], never by record.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;

use crate::identity::RendezvousSchedule;
use crate::types::{ChannelId, KnownPeer, NodeAddress, Slot};

// ── Configuration ─────────────────────────────────────────────────────

/// Degree bounds and timing for mesh maintenance.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Below this many channels, maintenance dials more peers.
    pub min_degree: usize,
    /// Above this many channels, maintenance closes one excess channel.
    pub max_degree: usize,
    /// Minimum time between connect attempts to the same address.
    pub connect_cooldown: Duration,
    /// How long a channel may stay `Connecting` before it is pruned.
    pub connecting_grace: Duration,
    /// Maximum addresses in one PEX record.
    pub pex_sample: usize,
    /// Open channels silent for longer than this are closed.
    pub liveness_timeout: Duration,
    /// Known peers not refreshed for this long are evicted.
    pub known_peer_ttl: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            min_degree: 4,
            max_degree: 8,
            connect_cooldown: Duration::from_secs(10),
            connecting_grace: Duration::from_secs(10),
            pex_sample: 30,
            liveness_timeout: Duration::from_secs(20),
            known_peer_ttl: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

fn ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

// ── Channel records ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    /// We asked the transport to close it; waiting for `Closed`.
    Closed,
}

#[derive(Debug, Clone)]
pub struct ChannelRecord {
    pub state: ChannelState,
    pub created_at: u64,
    /// Remote display name once HELLO arrives, the address until then.
    pub label: String,
    /// Address the remote announced in its HELLO.
    pub announced: Option<NodeAddress>,
    pub last_heard: u64,
}

impl ChannelRecord {
    fn new(state: ChannelState, remote: &NodeAddress, now: u64) -> Self {
        Self {
            state,
            created_at: now,
            label: remote.to_string(),
            announced: None,
            last_heard: now,
        }
    }

    fn is_live(&self) -> bool {
        matches!(self.state, ChannelState::Connecting | ChannelState::Open)
    }
}

/// What the caller should do after a mesh decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshAction {
    /// Dial this address from the primary endpoint.
    Connect(NodeAddress),
    /// Close this channel.
    Close(ChannelId),
    /// Known peer went stale; drop it from persistence.
    Forget(NodeAddress),
}

// ── Mesh ──────────────────────────────────────────────────────────────

pub struct Mesh {
    config: MeshConfig,
    local: NodeAddress,
    hub: Option<NodeAddress>,
    seeds: Vec<NodeAddress>,
    schedule: RendezvousSchedule,
    channels: BTreeMap<ChannelId, ChannelRecord>,
    known: HashMap<NodeAddress, KnownPeer>,
    /// Last connect attempt per address (Unix ms).
    attempts: HashMap<NodeAddress, u64>,
}

impl Mesh {
    pub fn new(
        config: MeshConfig,
        local: NodeAddress,
        seeds: Vec<NodeAddress>,
        schedule: RendezvousSchedule,
    ) -> Self {
        Self {
            config,
            local,
            hub: None,
            seeds,
            schedule,
            channels: BTreeMap::new(),
            known: HashMap::new(),
            attempts: HashMap::new(),
        }
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn local(&self) -> &NodeAddress {
        &self.local
    }

    pub fn seeds(&self) -> &[NodeAddress] {
        &self.seeds
    }

    /// Load persisted peers, skipping our own and rendezvous addresses.
    pub fn restore_peers(&mut self, peers: Vec<KnownPeer>) {
        for peer in peers {
            if self.is_gossipable(&peer.address) {
                self.known.insert(peer.address.clone(), peer);
            }
        }
    }

    /// Record the rendezvous address we own (or `None` after stepping down).
    /// Hub-slot records are dropped when stepping down.
    pub fn set_hub(&mut self, hub: Option<NodeAddress>) {
        if hub.is_none() {
            self.channels.retain(|id, _| id.slot != Slot::Hub);
        }
        self.hub = hub;
    }

    pub fn is_own(&self, addr: &NodeAddress) -> bool {
        addr == &self.local || self.hub.as_ref() == Some(addr)
    }

    pub fn is_rendezvous(&self, addr: &NodeAddress) -> bool {
        self.schedule.is_rendezvous(addr)
    }

    fn is_gossipable(&self, addr: &NodeAddress) -> bool {
        !self.is_own(addr) && !self.is_rendezvous(addr)
    }

    /// A live (connecting or open) channel already reaches `addr`.
    pub fn has_channel_to(&self, addr: &NodeAddress) -> bool {
        self.channels
            .iter()
            .any(|(id, rec)| rec.is_live() && reaches(id, rec, addr))
    }

    /// An open channel that reaches `addr`, preferring the primary slot.
    pub fn open_channel_to(&self, addr: &NodeAddress) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|(id, rec)| rec.state == ChannelState::Open && reaches(id, rec, addr))
            .map(|(id, _)| id.clone())
    }

    pub fn record(&self, id: &ChannelId) -> Option<&ChannelRecord> {
        self.channels.get(id)
    }

    // ── Connect decisions ─────────────────────────────────────────────

    /// Idempotent connect request. Returns `true` when the caller should
    /// dial: no live channel reaches `address` and the cool-down elapsed.
    pub fn ensure_connected(&mut self, address: &NodeAddress, now: u64) -> bool {
        if self.is_own(address) || self.has_channel_to(address) {
            return false;
        }
        if let Some(&at) = self.attempts.get(address) {
            if now < at + ms(self.config.connect_cooldown) {
                return false;
            }
        }
        self.begin_attempt(address, now);
        true
    }

    /// Like [`ensure_connected`](Self::ensure_connected) but ignores the
    /// cool-down (used right after a lost hub claim).
    pub fn dial_now(&mut self, address: &NodeAddress, now: u64) -> bool {
        if self.is_own(address) || self.has_channel_to(address) {
            return false;
        }
        self.begin_attempt(address, now);
        true
    }

    fn begin_attempt(&mut self, address: &NodeAddress, now: u64) {
        self.attempts.insert(address.clone(), now);
        self.channels.insert(
            ChannelId::primary(address.clone()),
            ChannelRecord::new(ChannelState::Connecting, address, now),
        );
    }

    // ── Lifecycle events ──────────────────────────────────────────────

    /// Register an open channel. Returns `false` if it was already open.
    pub fn on_channel_open(&mut self, id: &ChannelId, now: u64) -> bool {
        match self.channels.get_mut(id) {
            Some(rec) if rec.state == ChannelState::Open => false,
            Some(rec) => {
                rec.state = ChannelState::Open;
                rec.last_heard = now;
                true
            }
            None => {
                self.channels.insert(
                    id.clone(),
                    ChannelRecord::new(ChannelState::Open, &id.remote, now),
                );
                true
            }
        }
    }

    /// Deregister a channel. No automatic retry.
    pub fn on_channel_closed(&mut self, id: &ChannelId) -> Option<ChannelRecord> {
        self.channels.remove(id)
    }

    /// A dial to `remote` failed before opening.
    pub fn on_connect_failed(&mut self, remote: &NodeAddress) {
        let id = ChannelId::primary(remote.clone());
        if matches!(self.channels.get(&id), Some(rec) if rec.state == ChannelState::Connecting) {
            self.channels.remove(&id);
        }
    }

    /// Any record arrived on `id`.
    pub fn on_heard(&mut self, id: &ChannelId, now: u64) {
        if let Some(rec) = self.channels.get_mut(id) {
            rec.last_heard = now;
        }
    }

    /// HELLO on `id`. Returns the peer to persist, if it is gossipable.
    pub fn on_hello(
        &mut self,
        id: &ChannelId,
        name: &str,
        address: &NodeAddress,
        now: u64,
    ) -> Option<KnownPeer> {
        if let Some(rec) = self.channels.get_mut(id) {
            rec.label = name.to_string();
            rec.announced = Some(address.clone());
        }
        if !self.is_gossipable(address) {
            return None;
        }
        let peer = KnownPeer {
            address: address.clone(),
            display_name: name.to_string(),
            last_seen_at: now,
        };
        self.known.insert(address.clone(), peer.clone());
        Some(peer)
    }

    /// PEX payload received. Returns newly learned peers (to persist) and
    /// the addresses to dial while below `max_degree`.
    pub fn on_peer_exchange(
        &mut self,
        addresses: &[NodeAddress],
        now: u64,
    ) -> (Vec<KnownPeer>, Vec<NodeAddress>) {
        let mut learned = Vec::new();
        let mut dial = Vec::new();

        for addr in addresses {
            if !self.is_gossipable(addr) {
                continue;
            }
            match self.known.get_mut(addr) {
                Some(peer) => peer.last_seen_at = now,
                None => {
                    let peer = KnownPeer {
                        address: addr.clone(),
                        display_name: String::new(),
                        last_seen_at: now,
                    };
                    self.known.insert(addr.clone(), peer.clone());
                    learned.push(peer);
                }
            }
            if self.live_count() < self.config.max_degree && self.ensure_connected(addr, now) {
                dial.push(addr.clone());
            }
        }
        (learned, dial)
    }

    // ── Views ─────────────────────────────────────────────────────────

    pub fn open_channels(&self) -> Vec<ChannelId> {
        self.channels
            .iter()
            .filter(|(_, rec)| rec.state == ChannelState::Open)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.channels
            .values()
            .filter(|rec| rec.state == ChannelState::Open)
            .count()
    }

    fn live_count(&self) -> usize {
        self.channels.values().filter(|rec| rec.is_live()).count()
    }

    /// Remote addresses of open channels (announced address when known).
    pub fn active_addresses(&self) -> Vec<NodeAddress> {
        let mut out: Vec<NodeAddress> = self
            .channels
            .iter()
            .filter(|(_, rec)| rec.state == ChannelState::Open)
            .map(|(id, rec)| rec.announced.clone().unwrap_or_else(|| id.remote.clone()))
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn known_peers(&self) -> Vec<KnownPeer> {
        let mut peers: Vec<KnownPeer> = self.known.values().cloned().collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    /// Random sample of gossipable addresses for a PEX record.
    pub fn pex_sample<R: Rng>(&self, rng: &mut R) -> Vec<NodeAddress> {
        let mut pool: HashSet<NodeAddress> = self.known.keys().cloned().collect();
        for (id, rec) in &self.channels {
            if rec.state == ChannelState::Open {
                pool.insert(id.remote.clone());
                if let Some(a) = &rec.announced {
                    pool.insert(a.clone());
                }
            }
        }
        let mut pool: Vec<NodeAddress> = pool
            .into_iter()
            .filter(|a| self.is_gossipable(a))
            .collect();
        pool.sort();
        pool.choose_multiple(rng, self.config.pex_sample)
            .cloned()
            .collect()
    }

    // ── Maintenance ───────────────────────────────────────────────────

    /// Periodic upkeep: prune stuck and silent channels, evict stale peers,
    /// dial up to `min_degree`, close one channel above `max_degree`.
    ///
    /// `protected` is set while this node is a seed or the hub; such nodes
    /// accept unbounded fan-out.
    pub fn maintenance_tick<R: Rng>(
        &mut self,
        now: u64,
        protected: bool,
        rng: &mut R,
    ) -> Vec<MeshAction> {
        let mut actions = Vec::new();
        let grace = ms(self.config.connecting_grace);
        let liveness = ms(self.config.liveness_timeout);

        // 1. Prune stuck attempts and silent channels.
        self.channels.retain(|_, rec| match rec.state {
            ChannelState::Connecting | ChannelState::Closed => now < rec.created_at + grace
                || (rec.state == ChannelState::Closed && now < rec.last_heard + grace),
            ChannelState::Open => true,
        });
        for (id, rec) in self.channels.iter_mut() {
            if rec.state == ChannelState::Open && now >= rec.last_heard + liveness {
                tracing::debug!(channel = %id, "closing silent channel");
                rec.state = ChannelState::Closed;
                rec.last_heard = now;
                actions.push(MeshAction::Close(id.clone()));
            }
        }

        // 2. Evict stale peers and expired cool-downs.
        let ttl = ms(self.config.known_peer_ttl);
        let stale: Vec<NodeAddress> = self
            .known
            .values()
            .filter(|p| now >= p.last_seen_at + ttl)
            .map(|p| p.address.clone())
            .collect();
        for addr in stale {
            self.known.remove(&addr);
            actions.push(MeshAction::Forget(addr));
        }
        let cooldown = ms(self.config.connect_cooldown);
        self.attempts.retain(|_, at| now < *at + cooldown);

        // 3. Grow toward min_degree.
        let mut live = self.live_count();
        if live < self.config.min_degree {
            let mut candidates: Vec<NodeAddress> = self
                .seeds
                .iter()
                .chain(self.known.keys())
                .filter(|a| !self.is_own(a) && !self.has_channel_to(a))
                .cloned()
                .collect();
            candidates.sort();
            candidates.dedup();
            candidates.shuffle(rng);
            for addr in candidates {
                if live >= self.config.min_degree {
                    break;
                }
                if self.ensure_connected(&addr, now) {
                    live += 1;
                    actions.push(MeshAction::Connect(addr));
                }
            }
        }

        // 4. Trim one excess channel.
        if !protected && self.open_count() > self.config.max_degree {
            let trimmable: Vec<ChannelId> = self
                .channels
                .iter()
                .filter(|(id, rec)| {
                    rec.state == ChannelState::Open
                        && id.slot == Slot::Primary
                        && !self.is_rendezvous(&id.remote)
                })
                .map(|(id, _)| id.clone())
                .collect();
            if let Some(victim) = trimmable.choose(rng).cloned() {
                if let Some(rec) = self.channels.get_mut(&victim) {
                    rec.state = ChannelState::Closed;
                    rec.last_heard = now;
                }
                tracing::debug!(channel = %victim, "trimming excess channel");
                actions.push(MeshAction::Close(victim));
            }
        }

        actions
    }
}

fn reaches(id: &ChannelId, rec: &ChannelRecord, addr: &NodeAddress) -> bool {
    &id.remote == addr || rec.announced.as_ref() == Some(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn addr(s: &str) -> NodeAddress {
        s.parse().unwrap()
    }

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(42)
    }

    fn mesh_with(config: MeshConfig, seeds: &[&str]) -> Mesh {
        Mesh::new(
            config,
            addr("n-self"),
            seeds.iter().map(|s| addr(s)).collect(),
            RendezvousSchedule::new(addr("mc-room"), Duration::from_secs(3600)),
        )
    }

    fn mesh() -> Mesh {
        mesh_with(MeshConfig::default(), &[])
    }

    fn open(m: &mut Mesh, remote: &str, now: u64) -> ChannelId {
        let id = ChannelId::primary(addr(remote));
        m.on_channel_open(&id, now);
        id
    }

    #[test]
    fn ensure_connected_respects_cooldown() {
        let mut m = mesh();
        assert!(m.ensure_connected(&addr("n-a"), 0));
        // Still connecting.
        assert!(!m.ensure_connected(&addr("n-a"), 1));
        m.on_connect_failed(&addr("n-a"));
        // Failed, but inside the cool-down window.
        assert!(!m.ensure_connected(&addr("n-a"), 5_000));
        assert!(m.ensure_connected(&addr("n-a"), 10_000));
    }

    #[test]
    fn ensure_connected_skips_self_and_open() {
        let mut m = mesh();
        assert!(!m.ensure_connected(&addr("n-self"), 0));
        open(&mut m, "n-b", 0);
        assert!(!m.ensure_connected(&addr("n-b"), 60_000));
    }

    #[test]
    fn hello_announced_address_counts_as_reached() {
        let mut m = mesh();
        let id = open(&mut m, "seed-1", 0);
        let peer = m.on_hello(&id, "ana", &addr("n-ana"), 1).unwrap();
        assert_eq!(peer.display_name, "ana");
        assert!(m.has_channel_to(&addr("n-ana")));
        assert_eq!(m.open_channel_to(&addr("n-ana")), Some(id.clone()));
        assert_eq!(m.record(&id).unwrap().label, "ana");
        assert_eq!(m.active_addresses(), vec![addr("n-ana")]);
    }

    #[test]
    fn rendezvous_and_self_never_become_known_peers() {
        let mut m = mesh();
        let id = open(&mut m, "mc-room-5", 0);
        assert!(m.on_hello(&id, "hub", &addr("mc-room-5"), 0).is_none());
        let (learned, _) = m.on_peer_exchange(&[addr("n-self"), addr("mc-room-5"), addr("n-x")], 0);
        assert_eq!(learned.len(), 1);
        assert_eq!(learned[0].address, addr("n-x"));
        assert!(m.pex_sample(&mut rng()).iter().all(|a| a == &addr("n-x")));
    }

    #[test]
    fn pex_dials_only_below_max_degree() {
        let config = MeshConfig {
            max_degree: 1,
            ..MeshConfig::default()
        };
        let mut m = mesh_with(config, &[]);
        open(&mut m, "n-a", 0);
        let (learned, dial) = m.on_peer_exchange(&[addr("n-b")], 0);
        assert_eq!(learned.len(), 1);
        assert!(dial.is_empty());
    }

    #[test]
    fn pex_sample_is_capped() {
        let config = MeshConfig {
            pex_sample: 3,
            ..MeshConfig::default()
        };
        let mut m = mesh_with(config, &[]);
        let addrs: Vec<NodeAddress> = (0..10).map(|i| addr(&format!("n-{i}"))).collect();
        m.restore_peers(
            addrs
                .iter()
                .map(|a| KnownPeer {
                    address: a.clone(),
                    display_name: String::new(),
                    last_seen_at: 0,
                })
                .collect(),
        );
        assert_eq!(m.pex_sample(&mut rng()).len(), 3);
    }

    #[test]
    fn maintenance_dials_up_to_min_degree() {
        let mut m = mesh_with(MeshConfig::default(), &["seed-1", "seed-2"]);
        m.on_peer_exchange(&[addr("n-a"), addr("n-b"), addr("n-c")], 0);
        // PEX already dialed the three; seeds fill the fourth slot.
        let actions = m.maintenance_tick(1, false, &mut rng());
        let dials = actions
            .iter()
            .filter(|a| matches!(a, MeshAction::Connect(_)))
            .count();
        assert_eq!(dials, 1);
        assert_eq!(m.live_count(), 4);
    }

    #[test]
    fn stuck_connecting_is_pruned_after_grace() {
        let mut m = mesh();
        m.ensure_connected(&addr("n-a"), 0);
        m.maintenance_tick(9_999, false, &mut rng());
        assert!(m.has_channel_to(&addr("n-a")));
        m.maintenance_tick(10_000, false, &mut rng());
        assert!(!m.has_channel_to(&addr("n-a")));
        // Cool-down has elapsed too.
        assert!(m.ensure_connected(&addr("n-a"), 10_001));
    }

    #[test]
    fn silent_channel_is_closed() {
        let mut m = mesh();
        let id = open(&mut m, "n-a", 0);
        m.on_heard(&id, 5_000);
        assert!(m.maintenance_tick(24_999, false, &mut rng()).is_empty());
        let actions = m.maintenance_tick(25_000, false, &mut rng());
        assert!(actions.contains(&MeshAction::Close(id.clone())));
        assert_eq!(m.open_count(), 0);
        m.on_channel_closed(&id);
        assert!(m.record(&id).is_none());
    }

    #[test]
    fn excess_channel_trimmed_unless_protected() {
        let config = MeshConfig {
            min_degree: 1,
            max_degree: 2,
            ..MeshConfig::default()
        };
        let mut m = mesh_with(config.clone(), &[]);
        for r in ["n-a", "n-b", "n-c"] {
            open(&mut m, r, 0);
        }
        let closes = |acts: &[MeshAction]| {
            acts.iter()
                .filter(|a| matches!(a, MeshAction::Close(_)))
                .count()
        };
        assert_eq!(closes(&m.maintenance_tick(1, true, &mut rng())), 0);
        assert_eq!(closes(&m.maintenance_tick(1, false, &mut rng())), 1);
        assert_eq!(m.open_count(), 2);
    }

    #[test]
    fn rendezvous_channel_is_never_trimmed() {
        let config = MeshConfig {
            min_degree: 0,
            max_degree: 0,
            ..MeshConfig::default()
        };
        let mut m = mesh_with(config, &[]);
        open(&mut m, "mc-room-1", 0);
        assert!(m.maintenance_tick(1, false, &mut rng()).is_empty());
    }

    #[test]
    fn stale_peers_are_forgotten() {
        let mut m = mesh();
        m.restore_peers(vec![KnownPeer {
            address: addr("n-old"),
            display_name: "old".into(),
            last_seen_at: 0,
        }]);
        let week = ms(MeshConfig::default().known_peer_ttl);
        let actions = m.maintenance_tick(week, true, &mut rng());
        assert!(actions.contains(&MeshAction::Forget(addr("n-old"))));
        assert!(m.known_peers().is_empty());
    }

    #[test]
    fn stepping_down_drops_hub_records() {
        let mut m = mesh();
        m.set_hub(Some(addr("mc-room-1")));
        assert!(m.is_own(&addr("mc-room-1")));
        m.on_channel_open(&ChannelId::hub(addr("n-c")), 0);
        m.set_hub(None);
        assert_eq!(m.open_count(), 0);
    }
}
