/// Step and scenario results, printed to stderr and emitted as JSON on stdout.
use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;

/// Result of one scenario step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: String,
    pub ok: bool,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of a full scenario run.
#[derive(Debug, Serialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub started_at: String,
    pub steps: Vec<StepResult>,
    /// Scenario-specific numbers (delivery ratio, duplicates, ...).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, serde_json::Value>,
    pub total_ms: f64,
    pub passed: usize,
    pub failed: usize,
}

impl ScenarioResult {
    pub fn new(scenario: &str) -> Self {
        Self {
            scenario: scenario.into(),
            started_at: chrono::Local::now().to_rfc3339(),
            steps: Vec::new(),
            metrics: BTreeMap::new(),
            total_ms: 0.0,
            passed: 0,
            failed: 0,
        }
    }

    pub fn add(&mut self, step: StepResult) {
        if step.ok {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.steps.push(step);
    }

    pub fn metric(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metrics.insert(key.into(), value.into());
    }

    pub fn finalize(&mut self, start: Instant) {
        self.total_ms = start.elapsed().as_secs_f64() * 1000.0;
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }

    pub fn print_summary(&self) {
        let icon = if self.success() { "PASS" } else { "FAIL" };
        eprintln!("\n[{icon}] Scenario: {} ({:.1}ms)", self.scenario, self.total_ms);
        eprintln!("  {} passed, {} failed", self.passed, self.failed);
        for step in &self.steps {
            let mark = if step.ok { " ok" } else { "FAIL" };
            eprint!("  [{mark}] {} ({:.1}ms)", step.step, step.elapsed_ms);
            if let Some(detail) = &step.detail {
                eprint!(": {detail}");
            }
            eprintln!();
        }
        for (key, value) in &self.metrics {
            eprintln!("  {key} = {value}");
        }
    }

    pub fn emit_json(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{json}");
        }
    }
}

/// Run a timed async step. `Ok` carries an optional detail, `Err` the reason.
pub async fn timed_step_async<F, Fut>(name: &str, f: F) -> StepResult
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<String, String>>,
{
    let start = Instant::now();
    let outcome = f().await;
    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
    match outcome {
        Ok(detail) => StepResult {
            step: name.into(),
            ok: true,
            elapsed_ms,
            detail: (!detail.is_empty()).then_some(detail),
        },
        Err(detail) => StepResult {
            step: name.into(),
            ok: false,
            elapsed_ms,
            detail: Some(detail),
        },
    }
}
