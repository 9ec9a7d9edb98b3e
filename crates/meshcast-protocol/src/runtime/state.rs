/// Complete node state: pure logic, no async, no network.
///
/// Every `handle_*` / `tick_*` method returns `Vec<RuntimeEffect>`; none
/// of them touches a channel, the store or a clock. Time comes in as `now`
/// (Unix ms) so tests drive it directly.
use meshcast_transport::{ChannelEvent, ErrorKind};
use rand::rngs::StdRng;

use crate::identity::{HubElection, HubRole, RendezvousSchedule};
use crate::mesh::{Mesh, MeshAction};
use crate::message::{Message, WireRecord};
use crate::outbox::{Outbox, OutboxStep};
use crate::replication::{Disposition, Replication};
use crate::store::OutboxEntry;
use crate::types::{ChannelId, KnownPeer, NodeAddress, Slot, Target};

use super::effect::RuntimeEffect;
use super::{ProtocolEvent, RuntimeConfig};

pub(crate) struct RuntimeState {
    pub(crate) local: NodeAddress,
    pub(crate) display_name: String,
    /// Registered under one of the well-known seed addresses.
    pub(crate) is_seed: bool,
    /// Cleared on `SignalingLost`, set again once re-registration succeeds.
    pub(crate) registered: bool,
    pub(crate) schedule: RendezvousSchedule,
    /// `None` when hub election is disabled.
    pub(crate) election: Option<HubElection>,
    pub(crate) mesh: Mesh,
    pub(crate) replication: Replication,
    pub(crate) outbox: Outbox,
    rng: StdRng,
}

impl RuntimeState {
    pub fn new(
        local: NodeAddress,
        display_name: String,
        is_seed: bool,
        room_prefix: NodeAddress,
        config: RuntimeConfig,
        rng: StdRng,
    ) -> Self {
        let schedule = RendezvousSchedule::new(room_prefix, config.room_window);
        let election = config.hub_election.then(|| {
            HubElection::new(
                schedule.clone(),
                config.hub_backoff_min,
                config.hub_backoff_max,
            )
        });
        let seeds = config
            .seeds
            .iter()
            .filter(|s| **s != local)
            .cloned()
            .collect();
        Self {
            mesh: Mesh::new(config.mesh.clone(), local.clone(), seeds, schedule.clone()),
            replication: Replication::new(config.dedup_capacity, config.hop_budget, config.sync_limit)
                .with_max_skew(config.max_clock_skew),
            outbox: Outbox::new(config.outbox_ttl),
            local,
            display_name,
            is_seed,
            registered: true,
            schedule,
            election,
            rng,
        }
    }

    /// Rebuild caches from persisted state.
    pub fn restore(&mut self, peers: Vec<KnownPeer>, outbox: Vec<OutboxEntry>, recent: &[Message]) {
        self.mesh.restore_peers(peers);
        self.outbox.restore(outbox);
        self.replication.restore(recent);
    }

    pub fn is_hub(&self) -> bool {
        self.election.as_ref().is_some_and(HubElection::is_hub)
    }

    fn slot_of(&self, local: &NodeAddress) -> Option<Slot> {
        if local == &self.local {
            return Some(Slot::Primary);
        }
        let hub = self.election.as_ref().and_then(HubElection::hub_address);
        (hub == Some(local)).then_some(Slot::Hub)
    }

    fn identity_event(&self) -> RuntimeEffect {
        RuntimeEffect::Emit(ProtocolEvent::SelfIdentityResolved {
            address: self.local.clone(),
            display_name: self.display_name.clone(),
            is_hub: self.is_hub(),
        })
    }

    fn peer_list_event(&self) -> RuntimeEffect {
        RuntimeEffect::Emit(ProtocolEvent::PeerListChanged {
            known_peers: self.mesh.known_peers(),
            active_channels: self.mesh.active_addresses(),
        })
    }

    fn connect_if_needed(&mut self, address: &NodeAddress, now: u64, effects: &mut Vec<RuntimeEffect>) {
        if self.mesh.ensure_connected(address, now) {
            effects.push(RuntimeEffect::Connect {
                address: address.clone(),
            });
        }
    }

    // ── Startup ───────────────────────────────────────────────────────

    /// Announce identity and dial seeds, known peers and the rendezvous.
    pub fn startup(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let mut effects = vec![self.identity_event()];
        let mut targets: Vec<NodeAddress> = self.mesh.seeds().to_vec();
        targets.extend(self.mesh.known_peers().into_iter().map(|p| p.address));
        if self.election.is_some() {
            targets.push(self.schedule.address_at(now));
        }
        for address in targets {
            self.connect_if_needed(&address, now, &mut effects);
        }
        effects
    }

    // ── Channel events ────────────────────────────────────────────────

    /// An event from the endpoint registered as `local`.
    pub fn handle_channel_event(
        &mut self,
        local: &NodeAddress,
        event: ChannelEvent,
        now: u64,
    ) -> Vec<RuntimeEffect> {
        let Some(slot) = self.slot_of(local) else {
            tracing::debug!(%local, "event from a released endpoint ignored");
            return vec![];
        };
        match event {
            ChannelEvent::Open { remote } => self.handle_open(ChannelId { slot, remote }, now),
            ChannelEvent::Data { remote, bytes } => {
                let id = ChannelId { slot, remote };
                self.mesh.on_heard(&id, now);
                match WireRecord::from_bytes(&bytes) {
                    Ok(record) => {
                        tracing::debug!(channel = %id, kind = record.kind(), "record received");
                        self.handle_record(id, record, now)
                    }
                    Err(e) => {
                        tracing::debug!(channel = %id, "undecodable record: {e}");
                        vec![]
                    }
                }
            }
            ChannelEvent::Closed { remote } => {
                let id = ChannelId { slot, remote };
                match self.mesh.on_channel_closed(&id) {
                    Some(_) => {
                        tracing::info!(channel = %id, "channel closed");
                        vec![self.peer_list_event()]
                    }
                    None => vec![],
                }
            }
            ChannelEvent::Error {
                remote,
                kind,
                detail,
            } => self.handle_channel_error(slot, remote, kind, &detail, now),
            ChannelEvent::SignalingLost => self.handle_signaling_lost(slot),
        }
    }

    fn handle_open(&mut self, id: ChannelId, now: u64) -> Vec<RuntimeEffect> {
        if !self.mesh.on_channel_open(&id, now) {
            return vec![];
        }
        tracing::info!(channel = %id, "channel open");
        let sample = self.mesh.pex_sample(&mut self.rng);
        let mut effects = vec![
            RuntimeEffect::Send {
                channel: id.clone(),
                record: WireRecord::Hello {
                    name: self.display_name.clone(),
                    address: self.local.clone(),
                },
            },
            RuntimeEffect::Send {
                channel: id.clone(),
                record: WireRecord::PeerExchange { addresses: sample },
            },
            RuntimeEffect::Send {
                channel: id,
                record: WireRecord::SyncRequest {
                    after_timestamp: self.replication.high_water(),
                },
            },
        ];
        effects.extend(self.tick_retry(now));
        effects.push(self.peer_list_event());
        effects
    }

    fn handle_channel_error(
        &mut self,
        slot: Slot,
        remote: NodeAddress,
        kind: ErrorKind,
        detail: &str,
        now: u64,
    ) -> Vec<RuntimeEffect> {
        tracing::debug!(%remote, %kind, detail, "channel error");
        if slot != Slot::Primary {
            return vec![];
        }
        self.mesh.on_connect_failed(&remote);

        if kind != ErrorKind::PeerUnreachable {
            return vec![];
        }
        let Some(election) = self.election.as_mut() else {
            return vec![];
        };
        if remote != election.rendezvous(now) {
            return vec![];
        }
        match election.on_unreachable(&mut self.rng) {
            Some(after) => {
                tracing::info!(rendezvous = %remote, ?after, "rendezvous unreachable, contending");
                vec![RuntimeEffect::ScheduleContention { after }]
            }
            None => vec![],
        }
    }

    fn handle_signaling_lost(&mut self, slot: Slot) -> Vec<RuntimeEffect> {
        match slot {
            Slot::Primary => {
                tracing::warn!(address = %self.local, "signaling registration lost");
                self.registered = false;
                vec![]
            }
            Slot::Hub => {
                let Some(stale) = self.election.as_mut().and_then(HubElection::step_down) else {
                    return vec![];
                };
                tracing::warn!(rendezvous = %stale, "hub registration lost, stepping down");
                self.mesh.set_hub(None);
                vec![RuntimeEffect::ReleaseHub, self.identity_event()]
            }
        }
    }

    // ── Records ───────────────────────────────────────────────────────

    fn handle_record(&mut self, id: ChannelId, record: WireRecord, now: u64) -> Vec<RuntimeEffect> {
        match record {
            WireRecord::Hello { name, address } => {
                let mut effects = Vec::new();
                if let Some(peer) = self.mesh.on_hello(&id, &name, &address, now) {
                    effects.push(RuntimeEffect::SavePeer(peer));
                }
                effects.push(self.peer_list_event());
                effects
            }
            WireRecord::PeerExchange { addresses } => {
                let (learned, dial) = self.mesh.on_peer_exchange(&addresses, now);
                let changed = !learned.is_empty();
                let mut effects: Vec<RuntimeEffect> =
                    learned.into_iter().map(RuntimeEffect::SavePeer).collect();
                effects.extend(
                    dial.into_iter()
                        .map(|address| RuntimeEffect::Connect { address }),
                );
                if changed {
                    effects.push(self.peer_list_event());
                }
                effects
            }
            WireRecord::Message(message) => self.handle_inbound(id, message, now),
            WireRecord::SyncRequest { after_timestamp } => {
                let requester = self
                    .mesh
                    .record(&id)
                    .and_then(|r| r.announced.clone())
                    .unwrap_or_else(|| id.remote.clone());
                vec![RuntimeEffect::AnswerSync {
                    query: self.replication.sync_query(after_timestamp, requester),
                    channel: id,
                }]
            }
            WireRecord::SyncResponse { messages } => {
                tracing::debug!(channel = %id, count = messages.len(), "sync response");
                self.replication
                    .on_sync_response(messages, &self.mesh, now)
                    .into_iter()
                    .map(RuntimeEffect::Deliver)
                    .collect()
            }
            WireRecord::Ping => vec![RuntimeEffect::Send {
                channel: id,
                record: WireRecord::Pong,
            }],
            WireRecord::Pong => vec![],
        }
    }

    fn handle_inbound(&mut self, source: ChannelId, message: Message, now: u64) -> Vec<RuntimeEffect> {
        match self.replication.on_inbound(message, &source, &self.mesh, now) {
            Disposition::Duplicate | Disposition::Rejected => vec![],
            Disposition::Accepted {
                message,
                deliver,
                forward,
            } => {
                let mut effects = Vec::new();
                if deliver {
                    effects.push(RuntimeEffect::Deliver(message));
                }
                if let Some((copy, channels)) = forward {
                    for channel in channels {
                        effects.push(RuntimeEffect::Send {
                            channel,
                            record: WireRecord::Message(copy.clone()),
                        });
                    }
                }
                effects
            }
        }
    }

    // ── Local sends ───────────────────────────────────────────────────

    /// Build the outbox entry for a new local message. The caller persists
    /// it, then calls [`handle_local_stored`](Self::handle_local_stored).
    pub fn compose(&mut self, body: Vec<u8>, target: Target, now: u64) -> OutboxEntry {
        let message = self.replication.compose(
            self.local.clone(),
            self.display_name.clone(),
            body,
            target,
            now,
        );
        OutboxEntry {
            message,
            enqueued_at: now,
        }
    }

    /// Local echo, then an immediate send attempt through the outbox.
    pub fn handle_local_stored(&mut self, entry: OutboxEntry, now: u64) -> Vec<RuntimeEffect> {
        let mut effects = vec![RuntimeEffect::Emit(ProtocolEvent::MessageReady {
            message: entry.message.clone(),
            local_echo: true,
        })];
        self.outbox.enqueue(entry);
        effects.extend(self.tick_retry(now));
        effects
    }

    pub fn handle_requeue(&mut self, entry: OutboxEntry) {
        self.outbox.requeue(entry);
    }

    pub fn handle_connect(&mut self, address: NodeAddress, now: u64) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        self.connect_if_needed(&address, now, &mut effects);
        effects
    }

    /// Foreground hint: run maintenance (and re-registration) right away.
    pub fn handle_wake(&mut self, now: u64) -> Vec<RuntimeEffect> {
        self.tick_maintenance(now)
    }

    pub fn handle_reregistered(&mut self, ok: bool) {
        if ok {
            tracing::info!(address = %self.local, "re-registered with signaling");
        }
        self.registered = ok;
    }

    // ── Hub election ──────────────────────────────────────────────────

    pub fn handle_contention_due(&mut self, now: u64) -> Vec<RuntimeEffect> {
        match self.election.as_mut().and_then(|e| e.contention_due(now)) {
            Some(address) => {
                tracing::info!(%address, "claiming rendezvous");
                vec![RuntimeEffect::ClaimHub { address }]
            }
            None => vec![],
        }
    }

    pub fn handle_hub_claimed(&mut self, address: NodeAddress) -> Vec<RuntimeEffect> {
        let accepted = self
            .election
            .as_mut()
            .is_some_and(|e| e.on_claimed(&address));
        if !accepted {
            tracing::debug!(%address, "late hub claim released");
            return vec![RuntimeEffect::ReleaseHub];
        }
        tracing::info!(%address, "elected hub");
        self.mesh.set_hub(Some(address));
        vec![self.identity_event()]
    }

    pub fn handle_hub_rejected(&mut self, address: NodeAddress, now: u64) -> Vec<RuntimeEffect> {
        if let Some(election) = self.election.as_mut() {
            election.on_claim_rejected(&address);
        }
        tracing::info!(%address, "rendezvous already held, joining as client");
        if self.mesh.dial_now(&address, now) {
            vec![RuntimeEffect::Connect { address }]
        } else {
            vec![]
        }
    }

    // ── Timers ────────────────────────────────────────────────────────

    /// Re-register, roll the rendezvous window, keep the mesh within its
    /// degree bounds and ping every open channel.
    pub fn tick_maintenance(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let mut effects = Vec::new();
        if !self.registered {
            effects.push(RuntimeEffect::Reregister);
        }

        if let Some(stale) = self.election.as_mut().and_then(|e| e.check_rollover(now)) {
            tracing::info!(rendezvous = %stale, "window rolled over, stepping down");
            self.mesh.set_hub(None);
            effects.push(RuntimeEffect::ReleaseHub);
            effects.push(self.identity_event());
        }

        let rendezvous = self
            .election
            .as_ref()
            .filter(|e| *e.role() == HubRole::Client)
            .map(|e| e.rendezvous(now));
        if let Some(rendezvous) = rendezvous {
            self.connect_if_needed(&rendezvous, now, &mut effects);
        }

        let protected = self.is_seed || self.is_hub();
        let mut changed = false;
        for action in self.mesh.maintenance_tick(now, protected, &mut self.rng) {
            effects.push(match action {
                MeshAction::Connect(address) => RuntimeEffect::Connect { address },
                MeshAction::Close(channel) => {
                    changed = true;
                    RuntimeEffect::Close { channel }
                }
                MeshAction::Forget(address) => {
                    changed = true;
                    RuntimeEffect::ForgetPeer(address)
                }
            });
        }

        for channel in self.mesh.open_channels() {
            effects.push(RuntimeEffect::Send {
                channel,
                record: WireRecord::Ping,
            });
        }
        if changed {
            effects.push(self.peer_list_event());
        }
        effects
    }

    /// Gossip a fresh PEX sample to every open channel.
    pub fn tick_pex(&mut self) -> Vec<RuntimeEffect> {
        let sample = self.mesh.pex_sample(&mut self.rng);
        if sample.is_empty() {
            return vec![];
        }
        self.mesh
            .open_channels()
            .into_iter()
            .map(|channel| RuntimeEffect::Send {
                channel,
                record: WireRecord::PeerExchange {
                    addresses: sample.clone(),
                },
            })
            .collect()
    }

    /// One outbox pass.
    pub fn tick_retry(&mut self, now: u64) -> Vec<RuntimeEffect> {
        let rendezvous = self.schedule.address_at(now);
        let mut effects = Vec::new();
        for step in self.outbox.retry(now, &mut self.mesh, &rendezvous) {
            match step {
                OutboxStep::Expired(id) => effects.push(RuntimeEffect::RemoveOutbox { id }),
                OutboxStep::Flood { message, channels } => {
                    let id = message.id.clone();
                    for channel in channels {
                        effects.push(RuntimeEffect::Send {
                            channel,
                            record: WireRecord::Message(message.clone()),
                        });
                    }
                    effects.push(RuntimeEffect::RemoveOutbox { id });
                }
                OutboxStep::Send { channel, entry } => {
                    effects.push(RuntimeEffect::SendWithFallback {
                        channel,
                        record: WireRecord::Message(entry.message.clone()),
                        on_success: vec![RuntimeEffect::RemoveOutbox {
                            id: entry.message.id.clone(),
                        }],
                        on_failure: vec![RuntimeEffect::Requeue(entry)],
                    });
                }
                OutboxStep::Dial(address) => effects.push(RuntimeEffect::Connect { address }),
            }
        }
        effects
    }
}
