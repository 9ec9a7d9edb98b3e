//! Simulator settings: defaults, then an optional TOML file, then
//! `MESHCAST_*` environment overrides.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use meshcast_protocol::{MeshConfig, NodeAddress, RuntimeConfig};
use serde::Deserialize;

/// Timings are short so a whole scenario converges in a few seconds.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// Well-known seed addresses, claimed by the first nodes to boot.
    pub seeds: Vec<String>,
    pub min_degree: usize,
    pub max_degree: usize,
    pub hop_budget: u8,
    pub maintenance_ms: u64,
    pub pex_ms: u64,
    pub retry_ms: u64,
    pub cooldown_ms: u64,
    pub grace_ms: u64,
    /// Upper bound for any single "wait until" step.
    pub settle_timeout_ms: u64,
    /// Flood passes when at least this share of expected deliveries arrive.
    pub min_delivery_ratio: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seeds: vec!["seed-1".into(), "seed-2".into()],
            min_degree: 4,
            max_degree: 8,
            hop_budget: 16,
            maintenance_ms: 100,
            pex_ms: 200,
            retry_ms: 100,
            cooldown_ms: 150,
            grace_ms: 500,
            settle_timeout_ms: 10_000,
            min_delivery_ratio: 1.0,
        }
    }
}

impl SimConfig {
    /// Defaults, overlaid with `path` when given, then the environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => SimConfig::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `MESHCAST_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, raw: &str) -> anyhow::Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid {key}={raw:?}: {e}"))
        }

        if let Some(raw) = lookup("MESHCAST_SEEDS") {
            self.seeds = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        macro_rules! numeric {
            ($($key:literal => $field:ident),* $(,)?) => {
                $(
                    if let Some(raw) = lookup($key) {
                        self.$field = parse($key, &raw)?;
                    }
                )*
            };
        }
        numeric! {
            "MESHCAST_MIN_DEGREE" => min_degree,
            "MESHCAST_MAX_DEGREE" => max_degree,
            "MESHCAST_HOP_BUDGET" => hop_budget,
            "MESHCAST_MAINTENANCE_MS" => maintenance_ms,
            "MESHCAST_PEX_MS" => pex_ms,
            "MESHCAST_RETRY_MS" => retry_ms,
            "MESHCAST_COOLDOWN_MS" => cooldown_ms,
            "MESHCAST_GRACE_MS" => grace_ms,
            "MESHCAST_SETTLE_TIMEOUT_MS" => settle_timeout_ms,
            "MESHCAST_MIN_DELIVERY_RATIO" => min_delivery_ratio,
        }
        Ok(())
    }

    pub fn seed_addresses(&self) -> anyhow::Result<Vec<NodeAddress>> {
        self.seeds
            .iter()
            .map(|s| s.parse().map_err(|e| anyhow::anyhow!("seed {s:?}: {e}")))
            .collect()
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    /// Runtime settings for one simulated node.
    pub fn runtime(&self, hub_election: bool) -> anyhow::Result<RuntimeConfig> {
        Ok(RuntimeConfig {
            seeds: self.seed_addresses()?,
            hub_election,
            hub_backoff_min: Duration::from_millis(10),
            hub_backoff_max: Duration::from_millis(40),
            mesh: MeshConfig {
                min_degree: self.min_degree,
                max_degree: self.max_degree,
                connect_cooldown: Duration::from_millis(self.cooldown_ms),
                connecting_grace: Duration::from_millis(self.grace_ms),
                ..MeshConfig::default()
            },
            hop_budget: self.hop_budget,
            maintenance_interval: Duration::from_millis(self.maintenance_ms),
            pex_interval: Duration::from_millis(self.pex_ms),
            retry_interval: Duration::from_millis(self.retry_ms),
            ..RuntimeConfig::default()
        })
    }
}
