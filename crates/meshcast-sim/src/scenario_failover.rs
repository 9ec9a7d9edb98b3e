/// Failover scenario: the first node wins the rendezvous election, two
/// clients attach through it, the hub crashes, and a survivor re-claims the
/// rendezvous so the remaining nodes can keep talking.
use std::time::{Duration, Instant};

use meshcast_protocol::{NodeAddress, RuntimeConfig, Target};

use crate::cluster::{wait_until, Cluster};
use crate::config::SimConfig;
use crate::report::{timed_step_async, ScenarioResult};

pub async fn run(config: &SimConfig) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("failover");
    let start = Instant::now();
    let settle = config.settle_timeout();
    let elect = || -> anyhow::Result<RuntimeConfig> {
        Ok(RuntimeConfig {
            seeds: Vec::new(),
            ..config.runtime(true)?
        })
    };
    let mut cluster = Cluster::new();
    let room_prefix = format!("{}-", elect()?.room_prefix);

    // ── First node becomes hub ────────────────────────────────────────
    let hub = cluster.spawn(elect()?).await?;
    let step_start = Instant::now();
    let elected = cluster.drain_until(settle, |nodes| nodes[hub].became_hub).await;
    let rendezvous = find_rendezvous(&cluster, &room_prefix).await;
    result.add(crate::report::StepResult {
        step: "first node claims rendezvous".into(),
        ok: elected && rendezvous.is_some(),
        elapsed_ms: step_start.elapsed().as_secs_f64() * 1000.0,
        detail: rendezvous.as_ref().map(|r| format!("hub at {r}")),
    });
    let Some(rendezvous) = rendezvous else {
        cluster.shutdown().await;
        result.finalize(start);
        return Ok(result);
    };

    // ── Clients attach ────────────────────────────────────────────────
    let y = cluster.spawn(elect()?).await?;
    let z = cluster.spawn(elect()?).await?;
    let hub_address = cluster.nodes[hub].address().clone();
    let (hy, hz) = (cluster.nodes[y].handle.clone(), cluster.nodes[z].handle.clone());
    let step = timed_step_async("clients reach hub", || async {
        let reached = |h: meshcast_protocol::RuntimeHandle| {
            let target = hub_address.clone();
            wait_until(settle, move || {
                let h = h.clone();
                let target = target.clone();
                async move { h.open_channels().await.contains(&target) }
            })
        };
        if reached(hy.clone()).await && reached(hz.clone()).await {
            Ok(String::new())
        } else {
            Err("a client never opened a channel to the hub".into())
        }
    })
    .await;
    result.add(step);

    // ── Hub crashes ───────────────────────────────────────────────────
    cluster.net.crash(&rendezvous).await;
    cluster.net.crash(&hub_address).await;
    cluster.nodes[hub].handle.shutdown().await;

    let net = cluster.net.clone();
    let step = timed_step_async("survivor re-claims rendezvous", || async {
        let rv = rendezvous.clone();
        let ok = wait_until(settle, move || {
            let net = net.clone();
            let rv = rv.clone();
            async move { net.is_registered(&rv).await }
        })
        .await;
        if ok {
            Ok(String::new())
        } else {
            Err(format!("{rendezvous} stayed unclaimed"))
        }
    })
    .await;
    result.add(step);

    // ── Survivors keep talking ────────────────────────────────────────
    let step_start = Instant::now();
    cluster.drain_all();
    let outcome = match hy.send_message("after failover", Target::Broadcast).await {
        Ok(id) => {
            let got = cluster.drain_until(settle, |nodes| nodes[z].has(&id)).await;
            got.then(String::new)
                .ok_or_else(|| "message never reached the other survivor".to_string())
        }
        Err(e) => Err(format!("send failed: {e}")),
    };
    cluster.drain_for(Duration::from_millis(200)).await;
    let duplicates = cluster.nodes[z].duplicates();
    result.metric("duplicates", duplicates);
    result.add(crate::report::StepResult {
        step: "survivors exchange a broadcast".into(),
        ok: outcome.is_ok() && duplicates == 0,
        elapsed_ms: step_start.elapsed().as_secs_f64() * 1000.0,
        detail: outcome.err(),
    });

    cluster.shutdown().await;
    result.finalize(start);
    Ok(result)
}

async fn find_rendezvous(cluster: &Cluster, prefix: &str) -> Option<NodeAddress> {
    cluster
        .net
        .registered()
        .await
        .into_iter()
        .find(|a| a.has_prefix(prefix))
}
