//! Run orchestration
//!
//! Starts every scenario against one shared run clock, watches progress and
//! live thresholds while they run, then merges their results into a
//! [`RunReport`]. One scenario failing, at setup or mid-run, never stops its
//! siblings.

use crate::aggregate::MetricsAggregator;
use crate::config::{RunPlan, ScenarioConfig, TimingConfig};
use crate::error::{ConfigError, HarnessError};
use crate::report::{RunReport, RunState, ScenarioReport};
use crate::scenario::{RunContext, ScenarioRunner};
use crate::session::SessionContext;
use crate::threshold::{SnapshotSet, ThresholdEvaluator, ThresholdResult};
use chrono::Utc;
use futures_util::future::join_all;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

/// A scenario that passed setup and is running
struct Launched {
    /// Position in the plan
    index: usize,
    config: ScenarioConfig,
    metrics: Arc<MetricsAggregator>,
    handle: JoinHandle<ScenarioReport>,
}

pub struct Orchestrator {
    plan: RunPlan,
    session: Arc<SessionContext>,
    timing: TimingConfig,
    cancel: CancellationToken,
    state: watch::Sender<RunState>,
}

impl Orchestrator {
    pub fn new(plan: RunPlan, session: SessionContext, timing: TimingConfig) -> Self {
        let (state, _) = watch::channel(RunState::Pending);
        Self {
            plan,
            session: Arc::new(session),
            timing,
            cancel: CancellationToken::new(),
            state,
        }
    }

    /// Cancelling this token aborts the whole run
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Observe run state transitions
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    fn transition(&self, next: RunState) {
        let current = *self.state.borrow();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!("Ignoring run state change {:?} -> {:?}", current, next);
            return;
        }
        info!("Run state: {:?} -> {:?}", current, next);
        self.state.send_replace(next);
    }

    /// Execute the plan. A report is always produced.
    pub async fn run(self) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let run_start = Instant::now();
        let global = Arc::new(MetricsAggregator::merged());
        let mut setup_errors = Vec::new();

        info!("Run {} starting with {} scenarios", run_id, self.plan.scenarios.len());

        let evaluator = match self.setup_thresholds() {
            Ok(evaluator) => evaluator,
            Err(e) => {
                let e = HarnessError::from(e);
                error!("{}", e);
                setup_errors.push(e.to_string());
                ThresholdEvaluator::default()
            }
        };

        let ctx = Arc::new(RunContext {
            session: Arc::clone(&self.session),
            timing: self.timing.clone(),
            run_start,
            global: Arc::clone(&global),
        });

        // Invalid scenarios fail alone; the rest still run
        let mut failed = Vec::new();
        let mut runners = Vec::new();
        let mut seen = HashSet::new();
        for (index, config) in self.plan.scenarios.iter().enumerate() {
            let result = if seen.insert(config.name.clone()) {
                ScenarioRunner::new(config.clone(), Arc::clone(&ctx), &self.cancel)
            } else {
                Err(ConfigError::DuplicateScenario(config.name.clone()))
            };
            match result {
                Ok(runner) => runners.push((index, runner)),
                Err(e) => {
                    error!("Scenario '{}' rejected: {}", config.name, e);
                    let metrics = MetricsAggregator::new(config.name.clone()).snapshot();
                    failed.push((index, ScenarioReport::failed(config, &e, metrics)));
                }
            }
        }

        if runners.is_empty() && setup_errors.is_empty() {
            setup_errors.push(HarnessError::EmptyPlan.to_string());
        }
        if !setup_errors.is_empty() {
            self.transition(RunState::Failed);
            return RunReport {
                run_id,
                started_at,
                elapsed: run_start.elapsed(),
                state: RunState::Failed,
                aborted: false,
                setup_errors,
                scenarios: failed.into_iter().map(|(_, report)| report).collect(),
                totals: global.snapshot(),
                thresholds: Vec::new(),
                overall_passed: false,
            };
        }

        let run_end = run_start
            + runners
                .iter()
                .map(|(_, r)| r.config().ends_at())
                .max()
                .unwrap_or_default();

        info!("Watching {} thresholds", evaluator.specs().len());
        self.transition(RunState::Running);
        let launched: Vec<Launched> = runners
            .into_iter()
            .map(|(index, runner)| {
                let span = info_span!("scenario", name = %runner.name());
                let config = runner.config().clone();
                let metrics = runner.metrics();
                let handle = tokio::spawn(runner.run().instrument(span));
                Launched {
                    index,
                    config,
                    metrics,
                    handle,
                }
            })
            .collect();

        let scenario_metrics: IndexMap<String, Arc<MetricsAggregator>> = launched
            .iter()
            .map(|l| (l.config.name.clone(), Arc::clone(&l.metrics)))
            .collect();
        let snapshot = |elapsed: Duration| SnapshotSet {
            global: global.snapshot(),
            scenarios: scenario_metrics
                .iter()
                .map(|(name, metrics)| (name.clone(), metrics.snapshot()))
                .collect(),
            elapsed,
        };

        let (configs, handles): (Vec<_>, Vec<_>) = launched
            .into_iter()
            .map(|l| ((l.index, l.config, l.metrics), l.handle))
            .unzip();
        let all_done = join_all(handles);
        tokio::pin!(all_done);

        let mut progress = interval_at(
            run_start + self.timing.progress_interval,
            self.timing.progress_interval,
        );
        progress.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut draining = false;

        let joined = loop {
            tokio::select! {
                joined = &mut all_done => break joined,
                _ = sleep_until(run_end), if !draining => {
                    draining = true;
                    self.transition(RunState::Draining);
                }
                _ = self.cancel.cancelled(), if !draining => {
                    warn!("Run {} aborted; draining scenarios", run_id);
                    draining = true;
                    self.transition(RunState::Draining);
                }
                _ = progress.tick() => {
                    let elapsed = run_start.elapsed();
                    log_progress(&global, elapsed);
                    if !evaluator.is_empty() {
                        let results = evaluator.evaluate(&snapshot(elapsed));
                        self.check_live_thresholds(&evaluator, &results, elapsed);
                    }
                }
            }
        };

        let mut scenarios = failed;
        for ((index, config, metrics), result) in configs.into_iter().zip(joined) {
            let report = match result {
                Ok(report) => report,
                Err(e) => {
                    error!("Scenario '{}' crashed: {}", config.name, e);
                    ScenarioReport::failed(
                        &config,
                        format!("scenario task failed: {}", e),
                        metrics.snapshot(),
                    )
                }
            };
            scenarios.push((index, report));
        }
        // Keep plan order in the report
        scenarios.sort_by_key(|(index, _)| *index);
        let scenarios: Vec<ScenarioReport> = scenarios.into_iter().map(|(_, report)| report).collect();

        self.transition(RunState::Draining);
        self.transition(RunState::Completed);

        let elapsed = run_start.elapsed();
        let thresholds = evaluator.evaluate(&snapshot(elapsed));
        let aborted = self.cancel.is_cancelled();
        let overall_passed = thresholds.iter().all(|t| t.passed);
        info!(
            "Run {} completed in {:.1}s: {}",
            run_id,
            elapsed.as_secs_f64(),
            if overall_passed { "passed" } else { "failed" }
        );

        RunReport {
            run_id,
            started_at,
            elapsed,
            state: RunState::Completed,
            aborted,
            setup_errors,
            scenarios,
            totals: global.snapshot(),
            thresholds,
            overall_passed,
        }
    }

    fn setup_thresholds(&self) -> Result<ThresholdEvaluator, ConfigError> {
        let evaluator = ThresholdEvaluator::from_decls(&self.plan.thresholds)?;
        let names: Vec<&str> = self.plan.scenarios.iter().map(|s| s.name.as_str()).collect();
        evaluator.check_scopes(&names)?;
        Ok(evaluator)
    }

    fn check_live_thresholds(
        &self,
        evaluator: &ThresholdEvaluator,
        results: &[ThresholdResult],
        elapsed: Duration,
    ) {
        for result in results.iter().filter(|r| !r.passed) {
            warn!(
                "Threshold {} '{}' failing (observed {:?})",
                result.name, result.expression, result.observed
            );
        }
        if let Some(spec) = evaluator.abort_trigger(results, elapsed)
            && !self.cancel.is_cancelled()
        {
            warn!(
                "Threshold {} '{}' failed with abort_on_fail; aborting run",
                spec.name, spec.expression
            );
            self.cancel.cancel();
        }
    }
}

fn log_progress(global: &MetricsAggregator, elapsed: Duration) {
    let counters = global.counters();
    info!(
        "Progress {:.0}s: {} sessions, {}/{} connects ok, {} dropped, {} sent, {} received, {} errors",
        elapsed.as_secs_f64(),
        counters.sessions,
        counters.connect_succeeded,
        counters.attempted,
        counters.dropped,
        counters.sent,
        counters.received,
        counters.errors
    );
}
