/// Flood scenario: N nodes boot against the seeds, every node broadcasts M
/// messages, and every other node must receive each one exactly once.
use std::time::{Duration, Instant};

use meshcast_protocol::{MessageId, Target};

use crate::cluster::Cluster;
use crate::config::SimConfig;
use crate::report::{timed_step_async, ScenarioResult, StepResult};

pub async fn run(config: &SimConfig, nodes: usize, messages: usize) -> anyhow::Result<ScenarioResult> {
    let mut result = ScenarioResult::new("flood");
    let start = Instant::now();
    let settle = config.settle_timeout();
    let mut cluster = Cluster::new();

    // ── Boot ──────────────────────────────────────────────────────────
    let boot_start = Instant::now();
    for _ in 0..nodes {
        cluster.spawn(config.runtime(false)?).await?;
    }
    let seeds = config.seed_addresses()?;
    let claimed = cluster
        .nodes
        .iter()
        .filter(|n| seeds.contains(n.address()))
        .count();
    result.add(StepResult {
        step: format!("boot {nodes} nodes"),
        ok: cluster.nodes.len() == nodes,
        elapsed_ms: boot_start.elapsed().as_secs_f64() * 1000.0,
        detail: Some(format!("{claimed} seed address(es) claimed")),
    });

    // ── Mesh ──────────────────────────────────────────────────────────
    let handles: Vec<_> = cluster.nodes.iter().map(|n| n.handle.clone()).collect();
    let step = timed_step_async("mesh converges", || async {
        let ok = crate::cluster::wait_until(settle, || {
            let handles = handles.clone();
            async move {
                for handle in &handles {
                    if handle.open_channels().await.is_empty() {
                        return false;
                    }
                }
                true
            }
        })
        .await;
        let mut degrees = Vec::with_capacity(handles.len());
        for handle in &handles {
            degrees.push(handle.open_channels().await.len());
        }
        let detail = format!(
            "degree min {} max {}",
            degrees.iter().min().copied().unwrap_or(0),
            degrees.iter().max().copied().unwrap_or(0)
        );
        if ok {
            Ok(detail)
        } else {
            Err(format!("isolated node(s) remain, {detail}"))
        }
    })
    .await;
    result.add(step);

    // ── Broadcast ─────────────────────────────────────────────────────
    let step_start = Instant::now();
    let mut sent: Vec<(usize, MessageId)> = Vec::with_capacity(nodes * messages);
    let mut send_errors = 0usize;
    for seq in 0..messages {
        for (idx, handle) in handles.iter().enumerate() {
            match handle
                .send_message(format!("msg {seq} from node {idx}"), Target::Broadcast)
                .await
            {
                Ok(id) => sent.push((idx, id)),
                Err(e) => {
                    tracing::warn!(node = idx, error = %e, "send failed");
                    send_errors += 1;
                }
            }
        }
    }
    result.add(StepResult {
        step: format!("broadcast {messages} message(s) per node"),
        ok: send_errors == 0,
        elapsed_ms: step_start.elapsed().as_secs_f64() * 1000.0,
        detail: Some(format!("{} sent, {send_errors} failed", sent.len())),
    });

    // ── Deliveries ────────────────────────────────────────────────────
    let step_start = Instant::now();
    let all_delivered = |nodes: &[crate::cluster::SimNode]| {
        sent.iter().all(|(origin, id)| {
            nodes
                .iter()
                .enumerate()
                .all(|(idx, node)| idx == *origin || node.has(id))
        })
    };
    let complete = cluster.drain_until(settle, all_delivered).await;
    cluster.drain_for(Duration::from_millis(300)).await;

    let expected = sent.len() * nodes.saturating_sub(1);
    let delivered: usize = sent
        .iter()
        .map(|(origin, id)| {
            cluster
                .nodes
                .iter()
                .enumerate()
                .filter(|(idx, node)| idx != origin && node.has(id))
                .count()
        })
        .sum();
    let duplicates: usize = cluster.nodes.iter().map(|n| n.duplicates()).sum();
    let ratio = if expected == 0 {
        1.0
    } else {
        delivered as f64 / expected as f64
    };
    result.metric("nodes", nodes);
    result.metric("expected_deliveries", expected);
    result.metric("delivered", delivered);
    result.metric("delivery_ratio", ratio);
    result.metric("duplicates", duplicates);

    let ok = ratio >= config.min_delivery_ratio && duplicates == 0;
    result.add(StepResult {
        step: "every broadcast delivered once".into(),
        ok,
        elapsed_ms: step_start.elapsed().as_secs_f64() * 1000.0,
        detail: Some(format!(
            "{delivered}/{expected} delivered ({:.1}%), {duplicates} duplicate(s){}",
            ratio * 100.0,
            if complete { "" } else { ", timed out" }
        )),
    });

    cluster.shutdown().await;
    result.finalize(start);
    Ok(result)
}
