/// Runs every scenario in sequence and emits an aggregated summary.
use std::time::Instant;

use serde::Serialize;

use crate::config::SimConfig;
use crate::report::ScenarioResult;
use crate::{scenario_failover, scenario_flood, scenario_outbox};

#[derive(Serialize)]
struct RunnerSummary {
    event: &'static str,
    scenarios: Vec<ScenarioLine>,
    total_passed: usize,
    total_failed: usize,
    total_elapsed_s: f64,
    overall_status: &'static str,
}

#[derive(Serialize)]
struct ScenarioLine {
    scenario: String,
    status: &'static str,
    passed: usize,
    failed: usize,
    elapsed_ms: f64,
}

/// Returns `true` when every scenario passed.
pub async fn run(config: &SimConfig, nodes: usize, messages: usize) -> bool {
    let runner_start = Instant::now();

    let scenarios: Vec<(&str, anyhow::Result<ScenarioResult>)> = vec![
        ("flood", scenario_flood::run(config, nodes, messages).await),
        ("failover", scenario_failover::run(config).await),
        ("outbox", scenario_outbox::run(config).await),
    ];

    let mut lines = Vec::new();
    let mut total_passed = 0usize;
    let mut total_failed = 0usize;

    for (name, result) in &scenarios {
        match result {
            Ok(r) => {
                r.print_summary();
                r.emit_json();
                total_passed += r.passed;
                total_failed += r.failed;
                lines.push(ScenarioLine {
                    scenario: name.to_string(),
                    status: if r.success() { "PASS" } else { "FAIL" },
                    passed: r.passed,
                    failed: r.failed,
                    elapsed_ms: r.total_ms,
                });
            }
            Err(e) => {
                eprintln!("\n[FAIL] Scenario {name}: {e:#}");
                total_failed += 1;
                lines.push(ScenarioLine {
                    scenario: name.to_string(),
                    status: "ERROR",
                    passed: 0,
                    failed: 1,
                    elapsed_ms: 0.0,
                });
            }
        }
    }

    let all_ok = lines.iter().all(|l| l.status == "PASS");
    let summary = RunnerSummary {
        event: "summary",
        scenarios: lines,
        total_passed,
        total_failed,
        total_elapsed_s: runner_start.elapsed().as_secs_f64(),
        overall_status: if all_ok { "PASS" } else { "FAIL" },
    };
    if let Ok(json) = serde_json::to_string(&summary) {
        println!("{json}");
    }
    eprintln!(
        "\nTotal: {total_passed} passed, {total_failed} failed | {:.1}s | [{}]",
        summary.total_elapsed_s, summary.overall_status
    );
    all_ok
}
