//! Scenario runner
//!
//! Binds one [`ScenarioConfig`] to its arrival controller and drives
//! sessions for the scenario's duration:
//! - a semaphore sized to the pool ceiling gates every session start
//! - open-loop arrivals that find the pool full are dropped and counted
//! - closed-loop starts wait for a free slot (next tick or next completion)
//! - at the end, in-flight sessions get a graceful window, then are told to
//!   close, then are terminated

use crate::aggregate::{MetricsAggregator, MetricsFanout};
use crate::arrival::ArrivalController;
use crate::config::{ScenarioConfig, TimingConfig};
use crate::error::ConfigError;
use crate::report::{ScenarioReport, ScenarioStatus};
use crate::session::{FlowSpec, Session, SessionContext, SessionOutcome};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Run-wide context shared by every scenario
pub struct RunContext {
    pub session: Arc<SessionContext>,
    pub timing: TimingConfig,
    /// Shared clock origin for start offsets
    pub run_start: Instant,
    /// Aggregator merging every scenario
    pub global: Arc<MetricsAggregator>,
}

#[derive(Debug)]
struct Slot {
    cancel: CancellationToken,
    retiring: bool,
}

/// Sessions in flight, in start order
#[derive(Debug, Default)]
struct SlotTable {
    slots: IndexMap<u64, Slot>,
    peak: usize,
}

type SharedSlots = Arc<Mutex<SlotTable>>;

fn lock(slots: &SharedSlots) -> std::sync::MutexGuard<'_, SlotTable> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Frees the slot and the pool permit when the session task ends, however it ends
struct SlotGuard {
    id: u64,
    slots: SharedSlots,
    _permit: OwnedSemaphorePermit,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        lock(&self.slots).slots.shift_remove(&self.id);
    }
}

pub struct ScenarioRunner {
    config: ScenarioConfig,
    controller: ArrivalController,
    flow: FlowSpec,
    ctx: Arc<RunContext>,
    metrics: Arc<MetricsAggregator>,
    fanout: MetricsFanout,
    permits: Arc<Semaphore>,
    slots: SharedSlots,
    cancel: CancellationToken,
    next_id: u64,
}

impl ScenarioRunner {
    /// Validate the scenario and prepare its runner.
    ///
    /// `run_cancel` is the run-level token; cancelling it stops this scenario.
    pub fn new(
        config: ScenarioConfig,
        ctx: Arc<RunContext>,
        run_cancel: &CancellationToken,
    ) -> Result<Self, ConfigError> {
        let controller = ArrivalController::from_config(&config)?;
        let flow = config.flow.spec(&config.overrides);
        let metrics = Arc::new(MetricsAggregator::new(config.name.clone()));
        let fanout = MetricsFanout::new(vec![Arc::clone(&metrics), Arc::clone(&ctx.global)]);
        let permits = Arc::new(Semaphore::new(config.effective_pool_limit()));

        Ok(Self {
            config,
            controller,
            flow,
            ctx,
            metrics,
            fanout,
            permits,
            slots: SharedSlots::default(),
            cancel: run_cancel.child_token(),
            next_id: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ScenarioConfig {
        &self.config
    }

    /// This scenario's own aggregator
    pub fn metrics(&self) -> Arc<MetricsAggregator> {
        Arc::clone(&self.metrics)
    }

    /// Run until the scenario's end and drain its sessions
    pub async fn run(mut self) -> ScenarioReport {
        let begin = self.ctx.run_start + self.config.start_offset;
        let end = begin + self.config.total_duration();

        // Sessions must not start before the offset
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                info!("Scenario '{}' cancelled before its start offset", self.config.name);
                return self.finish(ScenarioStatus::Interrupted);
            }
            _ = sleep_until(begin) => {}
        }

        info!(
            "Scenario '{}' started: {:?} {}, pool {}",
            self.config.name,
            self.config.mode,
            self.config.flow.name(),
            self.config.effective_pool_limit()
        );

        let mut tasks: JoinSet<SessionOutcome> = JoinSet::new();
        let mut ticker = interval_at(begin, self.ctx.timing.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let open_loop = self.controller.mode().is_open_loop();

        let interrupted = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break true,
                _ = sleep_until(end) => break false,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    // Closed loop: replace finished sessions right away; failed
                    // connects wait for the next tick
                    if log_join(joined) && !open_loop {
                        self.schedule(&mut tasks, begin);
                    }
                }
                _ = ticker.tick() => self.schedule(&mut tasks, begin),
            }
        };

        if !interrupted && open_loop {
            // Arrivals due exactly at the end
            self.schedule(&mut tasks, begin);
        }

        self.drain(tasks).await;

        let status = if interrupted {
            ScenarioStatus::Interrupted
        } else {
            ScenarioStatus::Completed
        };
        info!("Scenario '{}' finished: {:?}", self.config.name, status);
        self.finish(status)
    }

    fn finish(&self, status: ScenarioStatus) -> ScenarioReport {
        let peak = lock(&self.slots).peak;
        ScenarioReport::new(&self.config, status, peak, self.metrics.snapshot())
    }

    /// Apply one arrival decision
    fn schedule(&mut self, tasks: &mut JoinSet<SessionOutcome>, begin: Instant) {
        let elapsed = Instant::now().saturating_duration_since(begin);
        let active = lock(&self.slots).slots.values().filter(|s| !s.retiring).count();
        let decision = self.controller.plan(elapsed, active);

        if decision.retire > 0 {
            self.retire_newest(decision.retire);
        }

        // Permits only come back while we run, so this bounds the burst
        let wanted = decision.start.min(self.permits.available_permits());
        let mut started = 0;
        while started < wanted {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            self.spawn_session(tasks, permit);
            started += 1;
        }

        // Closed loop retries the rest on the next tick or completion
        let dropped = if self.controller.mode().is_open_loop() {
            (decision.start - started) as u64
        } else {
            0
        };
        if dropped > 0 {
            debug!(
                "Scenario '{}' pool full: dropped {} arrivals",
                self.config.name, dropped
            );
            self.fanout.record_dropped(dropped);
        }
    }

    fn spawn_session(&mut self, tasks: &mut JoinSet<SessionOutcome>, permit: OwnedSemaphorePermit) {
        let id = self.next_id;
        self.next_id += 1;

        let token = self.cancel.child_token();
        {
            let mut table = lock(&self.slots);
            table.slots.insert(
                id,
                Slot {
                    cancel: token.clone(),
                    retiring: false,
                },
            );
            table.peak = table.peak.max(table.slots.len());
        }
        let guard = SlotGuard {
            id,
            slots: Arc::clone(&self.slots),
            _permit: permit,
        };

        let session = Session::new(id, self.flow.clone(), Arc::clone(&self.ctx.session));
        let fanout = self.fanout.clone();
        tasks.spawn(async move {
            let _guard = guard;
            session.run(token, fanout).await
        });
    }

    /// Ask the most recently started sessions to close early
    fn retire_newest(&self, count: usize) {
        let mut table = lock(&self.slots);
        for slot in table
            .slots
            .values_mut()
            .rev()
            .filter(|s| !s.retiring)
            .take(count)
        {
            slot.retiring = true;
            slot.cancel.cancel();
        }
    }

    /// Graceful window, then force-close, then terminate
    async fn drain(&self, mut tasks: JoinSet<SessionOutcome>) {
        if tasks.is_empty() {
            return;
        }
        let timing = &self.ctx.timing;

        let finished = if self.cancel.is_cancelled() {
            false
        } else {
            debug!(
                "Scenario '{}' waiting for {} sessions",
                self.config.name,
                tasks.len()
            );
            join_until(&mut tasks, Instant::now() + timing.graceful_stop, Some(&self.cancel)).await
        };
        if finished {
            return;
        }

        self.cancel.cancel();
        if join_until(&mut tasks, Instant::now() + timing.force_close, None).await {
            return;
        }

        warn!(
            "Scenario '{}' terminating {} sessions that ignored close",
            self.config.name,
            tasks.len()
        );
        tasks.abort_all();
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }
    }
}

/// Join tasks until none are left (true) or the deadline passes or `cancel` fires (false)
async fn join_until(
    tasks: &mut JoinSet<SessionOutcome>,
    deadline: Instant,
    cancel: Option<&CancellationToken>,
) -> bool {
    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(cancelled);

    loop {
        tokio::select! {
            biased;
            joined = tasks.join_next() => match joined {
                Some(joined) => {
                    log_join(joined);
                }
                None => return true,
            },
            _ = &mut cancelled => return false,
            _ = sleep_until(deadline) => return tasks.is_empty(),
        }
    }
}

/// Returns whether the finished session had connected
fn log_join(joined: Result<SessionOutcome, tokio::task::JoinError>) -> bool {
    match joined {
        Ok(outcome) => outcome.connect_succeeded,
        Err(e) => {
            if e.is_panic() {
                warn!("Session task panicked: {}", e);
            }
            false
        }
    }
}
