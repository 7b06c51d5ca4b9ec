//! Run report: per-scenario metrics, threshold verdicts and abuse findings

use crate::aggregate::{Counters, MetricsSnapshot};
use crate::arrival::ScenarioMode;
use crate::config::ScenarioConfig;
use crate::session::Flow;
use crate::threshold::ThresholdResult;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write;
use std::time::Duration;
use uuid::Uuid;

/// Exit code when thresholds fail (same as k6)
pub const EXIT_THRESHOLDS_FAILED: u8 = 99;
/// Exit code when the run could not be set up
pub const EXIT_SETUP_FAILED: u8 = 1;

/// Lifecycle of a whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Draining,
    Completed,
    /// Setup failed; no traffic was generated
    Failed,
}

impl RunState {
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Draining) | (Draining, Completed)
        )
    }
}

/// How a scenario ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    Completed,
    /// Stopped early by a run abort
    Interrupted,
    /// Invalid configuration or a crashed runner
    Failed,
}

/// Signal about the target's defences, derived from an abuse scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "defence", rename_all = "snake_case")]
pub enum Finding {
    /// The target pushed back on a message flood
    RateLimiting { detected: bool },
    /// The target refused part of a connection burst
    ConnectionLimiting { detected: bool },
    /// The target refused malformed input
    InputValidation { detected: bool, rejections: u64 },
}

impl Finding {
    /// Verdict for an abuse flow that produced evidence
    pub fn derive(flow: Flow, counters: &Counters) -> Option<Finding> {
        match flow {
            Flow::MessageSpam if counters.connect_succeeded > 0 => Some(Finding::RateLimiting {
                detected: counters.errors > 0 || counters.closed_by_peer > 0,
            }),
            Flow::MultiConnect if counters.attempted + counters.dropped > 0 => {
                Some(Finding::ConnectionLimiting {
                    detected: counters.connect_failed > 0,
                })
            }
            Flow::MalformedInjection if counters.connect_succeeded > 0 => {
                let rejections = counters.errors + counters.malformed_rejected;
                Some(Finding::InputValidation {
                    detected: rejections > 0 || counters.closed_by_peer > 0,
                    rejections,
                })
            }
            _ => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Finding::RateLimiting { detected: true } => "rate limiting detected".to_string(),
            Finding::RateLimiting { detected: false } => "VULNERABLE: no rate limiting".to_string(),
            Finding::ConnectionLimiting { detected: true } => "connection limiting detected".to_string(),
            Finding::ConnectionLimiting { detected: false } => {
                "VULNERABLE: no connection limit".to_string()
            }
            Finding::InputValidation {
                detected: true,
                rejections,
            } => format!("input validation detected ({} rejections)", rejections),
            Finding::InputValidation { detected: false, .. } => {
                "VULNERABLE: malformed input accepted".to_string()
            }
        }
    }
}

/// Final state of one scenario
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub flow: Flow,
    pub mode: ScenarioMode,
    pub status: ScenarioStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Most sessions in flight at once
    pub peak_concurrency: usize,
    pub metrics: MetricsSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finding: Option<Finding>,
}

impl ScenarioReport {
    pub fn new(
        config: &ScenarioConfig,
        status: ScenarioStatus,
        peak_concurrency: usize,
        metrics: MetricsSnapshot,
    ) -> Self {
        Self {
            name: config.name.clone(),
            flow: config.flow,
            mode: config.mode,
            status,
            error: None,
            peak_concurrency,
            finding: Finding::derive(config.flow, &metrics.counters),
            metrics,
        }
    }

    /// Report for a scenario that never ran
    pub fn failed(config: &ScenarioConfig, error: impl ToString, metrics: MetricsSnapshot) -> Self {
        Self {
            error: Some(error.to_string()),
            finding: None,
            ..Self::new(config, ScenarioStatus::Failed, 0, metrics)
        }
    }
}

/// Everything a run produced
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub state: RunState,
    /// The run was cut short by an operator interrupt or a failing threshold
    pub aborted: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub setup_errors: Vec<String>,
    pub scenarios: Vec<ScenarioReport>,
    pub totals: MetricsSnapshot,
    pub thresholds: Vec<ThresholdResult>,
    pub overall_passed: bool,
}

fn serialize_secs<S: serde::Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

impl RunReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Process exit status: 0 passed, 99 thresholds failed, 1 setup failed
    pub fn exit_status(&self) -> u8 {
        if self.state == RunState::Failed {
            EXIT_SETUP_FAILED
        } else if !self.overall_passed {
            EXIT_THRESHOLDS_FAILED
        } else {
            0
        }
    }

    /// Human readable summary for the console
    pub fn render_summary(&self) -> String {
        const RULE: &str = "═══════════════════════════════════════════════════════════════";
        let mut out = String::new();

        let _ = writeln!(out, "{}", RULE);
        let _ = writeln!(
            out,
            " RUN {} ({:.1}s, {:?})",
            self.run_id,
            self.elapsed.as_secs_f64(),
            self.state
        );
        let _ = writeln!(out, "{}", RULE);

        for error in &self.setup_errors {
            let _ = writeln!(out, "   setup error: {}", error);
        }

        for scenario in &self.scenarios {
            let counters = &scenario.metrics.counters;
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                " ─── {} ({}, {:?}) ───",
                scenario.name,
                scenario.flow.name(),
                scenario.status
            );
            if let Some(error) = &scenario.error {
                let _ = writeln!(out, "   error: {}", error);
                continue;
            }
            let _ = writeln!(
                out,
                "   connects: {}/{} ok | dropped: {} | peak: {}",
                counters.connect_succeeded, counters.attempted, counters.dropped, scenario.peak_concurrency
            );
            let _ = writeln!(
                out,
                "   messages: {} sent, {} received | errors: {} | peer closes: {}",
                counters.sent, counters.received, counters.errors, counters.closed_by_peer
            );
            let latency = &scenario.metrics.connect_latency;
            if let (Some(p50), Some(p95), Some(p99)) = (
                latency.percentile_ms(50.0),
                latency.percentile_ms(95.0),
                latency.percentile_ms(99.0),
            ) {
                let _ = writeln!(
                    out,
                    "   connect latency: p50 {:.1}ms | p95 {:.1}ms | p99 {:.1}ms",
                    p50, p95, p99
                );
            }
            if let Some(finding) = &scenario.finding {
                let _ = writeln!(out, "   finding: {}", finding.describe());
            }
        }

        if !self.thresholds.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, " ─── Thresholds ───");
            for result in &self.thresholds {
                let observed = result
                    .observed
                    .map(|v| format!("{:.3}", v))
                    .unwrap_or_else(|| "n/a".to_string());
                let _ = writeln!(
                    out,
                    "   {} {}: {} (observed {})",
                    if result.passed { "PASS" } else { "FAIL" },
                    result.name,
                    result.expression,
                    observed
                );
            }
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "{}", RULE);
        let _ = writeln!(
            out,
            " OVERALL: {}{}",
            if self.overall_passed { "PASS" } else { "FAIL" },
            if self.aborted { " (aborted)" } else { "" }
        );
        let _ = writeln!(out, "{}", RULE);
        out
    }
}
