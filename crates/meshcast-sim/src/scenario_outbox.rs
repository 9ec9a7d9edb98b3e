/// Outbox scenario: an isolated sender queues a directed message for an
/// address nobody holds yet; once the target comes up it is delivered
/// exactly once and the sender's outbox drains.
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshcast_protocol::store::SELF_ADDRESS_KEY;
use meshcast_protocol::{MemoryStore, MessageStore, RuntimeConfig, Target};

use crate::cluster::{wait_until, Cluster};
use crate::config::SimConfig;
use crate::report::{timed_step_async, ScenarioResult, StepResult};

const TARGET: &str = "n-target";

pub async fn run(config: &SimConfig) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("outbox");
    let start = Instant::now();
    let settle = config.settle_timeout();
    let isolated = || -> anyhow::Result<RuntimeConfig> {
        Ok(RuntimeConfig {
            seeds: Vec::new(),
            ..config.runtime(false)?
        })
    };
    let mut cluster = Cluster::new();
    let sender = cluster.spawn(isolated()?).await?;

    // ── Queue while the target is absent ──────────────────────────────
    let step_start = Instant::now();
    let id = cluster.nodes[sender]
        .handle
        .send_message("held for later", Target::Node(TARGET.parse()?))
        .await?;
    tokio::time::sleep(Duration::from_millis(config.retry_ms * 3)).await;
    let queued = cluster.nodes[sender].store.list_outbox().await?.len();
    result.add(StepResult {
        step: "message held in outbox".into(),
        ok: queued == 1,
        elapsed_ms: step_start.elapsed().as_secs_f64() * 1000.0,
        detail: Some(format!("{queued} entr(y/ies) pending")),
    });

    // ── Target appears ────────────────────────────────────────────────
    let store = Arc::new(MemoryStore::new());
    store.save_setting(SELF_ADDRESS_KEY, TARGET).await?;
    let target = cluster.spawn_with_store(isolated()?, store).await?;

    let step_start = Instant::now();
    let delivered = cluster.drain_until(settle, |nodes| nodes[target].has(&id)).await;
    cluster.drain_for(Duration::from_millis(300)).await;
    let copies = cluster.nodes[target].delivered.get(&id).copied().unwrap_or(0);
    result.metric("copies_at_target", copies);
    result.add(StepResult {
        step: "target receives it once".into(),
        ok: delivered && copies == 1,
        elapsed_ms: step_start.elapsed().as_secs_f64() * 1000.0,
        detail: Some(format!("{copies} cop(y/ies) at {TARGET}")),
    });

    // ── Outbox drains ─────────────────────────────────────────────────
    let outbox = cluster.nodes[sender].store.clone();
    let step = timed_step_async("sender outbox drains", || async {
        let drained = wait_until(settle, || {
            let outbox = outbox.clone();
            async move { outbox.list_outbox().await.map(|o| o.is_empty()).unwrap_or(false) }
        })
        .await;
        if drained {
            Ok(String::new())
        } else {
            Err("entry still pending".into())
        }
    })
    .await;
    result.add(step);

    cluster.shutdown().await;
    result.finalize(start);
    Ok(result)
}
