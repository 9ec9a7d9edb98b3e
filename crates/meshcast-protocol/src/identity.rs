/// Identity and bootstrap.
///
/// Resolves the node's stable address, claims a well-known seed address
/// when one is free, and runs the time-windowed rendezvous hub election.
///
/// The election is trial-and-error address claiming with a randomized
/// backoff. There is no fencing: two nodes can transiently both believe
/// they are the hub, and the mesh tolerates it.
use std::time::Duration;

use meshcast_transport::{EventStream, Signaling, TransportConfig, TransportError};
use rand::distr::Alphanumeric;
use rand::Rng;

use crate::error::MeshError;
use crate::store::{MessageStore, DISPLAY_NAME_KEY, SELF_ADDRESS_KEY};
use crate::types::NodeAddress;

/// Random characters in a generated address.
const ADDRESS_ENTROPY: usize = 12;

/// Fresh ephemeral claims tried when the persisted address is taken.
const MAX_CLAIM_ATTEMPTS: usize = 3;

// ── Addresses ────────────────────────────────────────────────────────

/// `<prefix>-` followed by 12 random lowercase alphanumerics.
pub fn generate_address<R: Rng>(prefix: &NodeAddress, rng: &mut R) -> NodeAddress {
    let suffix: String = (0..ADDRESS_ENTROPY)
        .map(|_| char::from(rng.sample(Alphanumeric)).to_ascii_lowercase())
        .collect();
    prefix.child(suffix)
}

/// The persisted stable address, or a new one generated and persisted.
pub async fn resolve_self_address(
    store: &dyn MessageStore,
    prefix: &NodeAddress,
) -> Result<NodeAddress, MeshError> {
    if let Some(raw) = store.load_setting(SELF_ADDRESS_KEY).await? {
        match raw.parse() {
            Ok(addr) => return Ok(addr),
            Err(e) => tracing::warn!("ignoring persisted self address: {e}"),
        }
    }
    let address = generate_address(prefix, &mut rand::rng());
    store
        .save_setting(SELF_ADDRESS_KEY, address.as_str())
        .await?;
    tracing::info!(%address, "generated self address");
    Ok(address)
}

/// Configured name (persisted), else the persisted one, else the address.
pub async fn resolve_display_name(
    store: &dyn MessageStore,
    configured: Option<&str>,
    address: &NodeAddress,
) -> Result<String, MeshError> {
    if let Some(name) = configured {
        store.save_setting(DISPLAY_NAME_KEY, name).await?;
        return Ok(name.to_string());
    }
    Ok(store
        .load_setting(DISPLAY_NAME_KEY)
        .await?
        .unwrap_or_else(|| address.to_string()))
}

// ── Seed claim ───────────────────────────────────────────────────────

/// Outcome of bootstrap: the primary endpoint and how it was obtained.
pub struct Bootstrap<E> {
    pub endpoint: E,
    pub events: EventStream,
    pub address: NodeAddress,
    /// Whether `address` is one of the well-known seeds.
    pub seed: bool,
}

/// Try each seed in order as our own address; fall back to the persisted
/// self address, then to fresh ephemeral addresses.
///
/// Address contention is never fatal; only other transport errors are.
pub async fn attempt_seed_claim<S: Signaling>(
    signaling: &S,
    seeds: &[NodeAddress],
    store: &dyn MessageStore,
    prefix: &NodeAddress,
    config: &TransportConfig,
) -> Result<Bootstrap<S::Endpoint>, MeshError> {
    for seed in seeds {
        match signaling.open(seed.clone(), config).await {
            Ok((endpoint, events)) => {
                tracing::info!(address = %seed, "claimed seed address");
                return Ok(Bootstrap {
                    endpoint,
                    events,
                    address: seed.clone(),
                    seed: true,
                });
            }
            Err(TransportError::AddressUnavailable { .. }) => {
                tracing::debug!(address = %seed, "seed taken");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let mut address = resolve_self_address(store, prefix).await?;
    for _ in 0..MAX_CLAIM_ATTEMPTS {
        match signaling.open(address.clone(), config).await {
            Ok((endpoint, events)) => {
                tracing::info!(%address, "registered as ordinary peer");
                return Ok(Bootstrap {
                    endpoint,
                    events,
                    address,
                    seed: false,
                });
            }
            Err(TransportError::AddressUnavailable { .. }) => {
                tracing::warn!(%address, "self address taken, using an ephemeral one");
                address = generate_address(prefix, &mut rand::rng());
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(MeshError::NoClaimableAddress {
        attempts: MAX_CLAIM_ATTEMPTS,
    })
}

// ── Rendezvous schedule ──────────────────────────────────────────────

/// Derives the current rendezvous address from wall-clock windows so all
/// nodes agree on it without coordination.
#[derive(Debug, Clone)]
pub struct RendezvousSchedule {
    prefix: NodeAddress,
    window_ms: u64,
}

impl RendezvousSchedule {
    pub fn new(prefix: NodeAddress, window: Duration) -> Self {
        Self {
            prefix,
            window_ms: (window.as_millis() as u64).max(1),
        }
    }

    pub fn window_index(&self, now_ms: u64) -> u64 {
        now_ms / self.window_ms
    }

    /// `<prefix>-<window_index>`.
    pub fn address_at(&self, now_ms: u64) -> NodeAddress {
        self.prefix.child(self.window_index(now_ms))
    }

    /// Whether `addr` is a rendezvous address for any window.
    pub fn is_rendezvous(&self, addr: &NodeAddress) -> bool {
        addr.as_str()
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('-'))
            .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
    }
}

// ── Hub election ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubRole {
    /// Connects to the rendezvous like everyone else.
    Client,
    /// Rendezvous was unreachable; waiting out the backoff.
    Contending,
    /// Claim in flight.
    Claiming { address: NodeAddress, window: u64 },
    /// Owns the rendezvous endpoint for `window`.
    Hub { address: NodeAddress, window: u64 },
}

/// Best-effort rendezvous election state machine. Pure: the caller performs
/// the claims, releases and timers it asks for.
#[derive(Debug, Clone)]
pub struct HubElection {
    schedule: RendezvousSchedule,
    role: HubRole,
    backoff_min: Duration,
    backoff_max: Duration,
}

impl HubElection {
    pub fn new(schedule: RendezvousSchedule, backoff_min: Duration, backoff_max: Duration) -> Self {
        Self {
            schedule,
            role: HubRole::Client,
            backoff_min,
            backoff_max: backoff_max.max(backoff_min),
        }
    }

    pub fn schedule(&self) -> &RendezvousSchedule {
        &self.schedule
    }

    pub fn role(&self) -> &HubRole {
        &self.role
    }

    pub fn is_hub(&self) -> bool {
        matches!(self.role, HubRole::Hub { .. })
    }

    /// The rendezvous address we currently own, if any.
    pub fn hub_address(&self) -> Option<&NodeAddress> {
        match &self.role {
            HubRole::Hub { address, .. } => Some(address),
            _ => None,
        }
    }

    pub fn rendezvous(&self, now_ms: u64) -> NodeAddress {
        self.schedule.address_at(now_ms)
    }

    /// A connect to the rendezvous found nobody there. From `Client`,
    /// schedules contention and returns the backoff to wait.
    pub fn on_unreachable<R: Rng>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.role != HubRole::Client {
            return None;
        }
        self.role = HubRole::Contending;
        let min = self.backoff_min.as_millis() as u64;
        let max = self.backoff_max.as_millis() as u64;
        Some(Duration::from_millis(rng.random_range(min..=max)))
    }

    /// Backoff elapsed: returns the address to claim now.
    pub fn contention_due(&mut self, now_ms: u64) -> Option<NodeAddress> {
        if self.role != HubRole::Contending {
            return None;
        }
        let address = self.schedule.address_at(now_ms);
        self.role = HubRole::Claiming {
            address: address.clone(),
            window: self.schedule.window_index(now_ms),
        };
        Some(address)
    }

    /// The claim for `address` succeeded. Returns `false` if we were not
    /// expecting it; the caller should release the endpoint.
    pub fn on_claimed(&mut self, address: &NodeAddress) -> bool {
        match &self.role {
            HubRole::Claiming {
                address: claimed,
                window,
            } if claimed == address => {
                self.role = HubRole::Hub {
                    address: address.clone(),
                    window: *window,
                };
                true
            }
            _ => false,
        }
    }

    /// The claim was rejected (someone else won). Back to client; the
    /// caller connects to the rendezvous instead.
    pub fn on_claim_rejected(&mut self, address: &NodeAddress) {
        if matches!(&self.role, HubRole::Claiming { address: a, .. } if a == address) {
            self.role = HubRole::Client;
        }
    }

    /// If we are hub and the window rolled over, step down and return the
    /// stale address to release.
    pub fn check_rollover(&mut self, now_ms: u64) -> Option<NodeAddress> {
        let current = self.schedule.window_index(now_ms);
        match &self.role {
            HubRole::Hub { address, window } if *window != current => {
                let stale = address.clone();
                self.role = HubRole::Client;
                Some(stale)
            }
            HubRole::Claiming { window, .. } if *window != current => {
                // A late success will be refused by `on_claimed`.
                self.role = HubRole::Client;
                None
            }
            _ => None,
        }
    }

    /// Give up the hub role early (the rendezvous registration was lost).
    pub fn step_down(&mut self) -> Option<NodeAddress> {
        match std::mem::replace(&mut self.role, HubRole::Client) {
            HubRole::Hub { address, .. } => Some(address),
            other => {
                self.role = other;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use meshcast_transport::{Endpoint, MemoryNetwork};
    use rand::SeedableRng;

    fn addr(s: &str) -> NodeAddress {
        s.parse().unwrap()
    }

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(7)
    }

    fn election() -> HubElection {
        HubElection::new(
            RendezvousSchedule::new(addr("mc-room"), Duration::from_secs(3600)),
            Duration::from_millis(200),
            Duration::from_millis(1500),
        )
    }

    #[test]
    fn generated_address_shape() {
        let a = generate_address(&addr("n"), &mut rng());
        let s = a.as_str();
        assert!(s.starts_with("n-"));
        assert_eq!(s.len(), 2 + ADDRESS_ENTROPY);
        assert!(s[2..].chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[tokio::test]
    async fn self_address_is_persisted() {
        let store = MemoryStore::new();
        let first = resolve_self_address(&store, &addr("n")).await.unwrap();
        let second = resolve_self_address(&store, &addr("n")).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn display_name_resolution() {
        let store = MemoryStore::new();
        let me = addr("n-me");
        assert_eq!(resolve_display_name(&store, None, &me).await.unwrap(), "n-me");
        assert_eq!(
            resolve_display_name(&store, Some("ana"), &me).await.unwrap(),
            "ana"
        );
        assert_eq!(resolve_display_name(&store, None, &me).await.unwrap(), "ana");
    }

    #[tokio::test]
    async fn first_free_seed_is_claimed() {
        let net = MemoryNetwork::new();
        let store = MemoryStore::new();
        let seeds = vec![addr("seed-1"), addr("seed-2")];
        let config = TransportConfig::new();

        let a = attempt_seed_claim(&net, &seeds, &store, &addr("n"), &config)
            .await
            .unwrap();
        assert!(a.seed);
        assert_eq!(a.address, addr("seed-1"));

        let b = attempt_seed_claim(&net, &seeds, &MemoryStore::new(), &addr("n"), &config)
            .await
            .unwrap();
        assert_eq!(b.address, addr("seed-2"));

        let c = attempt_seed_claim(&net, &seeds, &store, &addr("n"), &config)
            .await
            .unwrap();
        assert!(!c.seed);
        assert!(c.address.has_prefix("n-"));
        assert_eq!(c.endpoint.address(), &c.address);
    }

    #[tokio::test]
    async fn taken_self_address_falls_back_to_ephemeral() {
        let net = MemoryNetwork::new();
        let store = MemoryStore::new();
        store.save_setting(SELF_ADDRESS_KEY, "n-stale").await.unwrap();
        let (_holder, _rx) = net
            .open(addr("n-stale"), &TransportConfig::new())
            .await
            .unwrap();

        let boot = attempt_seed_claim(&net, &[], &store, &addr("n"), &TransportConfig::new())
            .await
            .unwrap();
        assert_ne!(boot.address, addr("n-stale"));
        // The stable address stays persisted for next time.
        assert_eq!(
            store.load_setting(SELF_ADDRESS_KEY).await.unwrap().as_deref(),
            Some("n-stale")
        );
    }

    #[test]
    fn rendezvous_windows() {
        let schedule = RendezvousSchedule::new(addr("mc-room"), Duration::from_secs(3600));
        assert_eq!(schedule.address_at(0).as_str(), "mc-room-0");
        assert_eq!(schedule.address_at(3_599_999).as_str(), "mc-room-0");
        assert_eq!(schedule.address_at(3_600_000).as_str(), "mc-room-1");
        assert!(schedule.is_rendezvous(&addr("mc-room-12")));
        assert!(!schedule.is_rendezvous(&addr("mc-room-")));
        assert!(!schedule.is_rendezvous(&addr("mc-roomy-1")));
        assert!(!schedule.is_rendezvous(&addr("n-abc")));
    }

    #[test]
    fn unreachable_then_claim_becomes_hub() {
        let mut e = election();
        let backoff = e.on_unreachable(&mut rng()).unwrap();
        assert!(backoff >= Duration::from_millis(200));
        assert!(backoff <= Duration::from_millis(1500));
        // Second failure while contending does not reschedule.
        assert!(e.on_unreachable(&mut rng()).is_none());

        let target = e.contention_due(5).unwrap();
        assert_eq!(target, addr("mc-room-0"));
        assert!(e.on_claimed(&target));
        assert!(e.is_hub());
        assert_eq!(e.hub_address(), Some(&target));
    }

    #[test]
    fn rejected_claim_reverts_to_client() {
        let mut e = election();
        e.on_unreachable(&mut rng());
        let target = e.contention_due(5).unwrap();
        e.on_claim_rejected(&target);
        assert_eq!(e.role(), &HubRole::Client);
        assert!(!e.on_claimed(&target));
    }

    #[test]
    fn hub_steps_down_on_rollover() {
        let mut e = election();
        e.on_unreachable(&mut rng());
        let target = e.contention_due(5).unwrap();
        e.on_claimed(&target);
        assert_eq!(e.check_rollover(1_000), None);
        assert_eq!(e.check_rollover(3_600_000), Some(target));
        assert_eq!(e.role(), &HubRole::Client);
    }

    #[test]
    fn step_down_only_affects_hub() {
        let mut e = election();
        assert_eq!(e.step_down(), None);
        e.on_unreachable(&mut rng());
        assert_eq!(e.step_down(), None);
        assert_eq!(e.role(), &HubRole::Contending);
        let target = e.contention_due(5).unwrap();
        e.on_claimed(&target);
        assert_eq!(e.step_down(), Some(target));
        assert!(!e.is_hub());
    }

    #[test]
    fn contention_due_only_when_contending() {
        let mut e = election();
        assert!(e.contention_due(0).is_none());
    }
}
