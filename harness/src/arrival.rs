//! Arrival control: when a scenario starts and retires sessions
//!
//! Stage targets form a piecewise-linear curve over the scenario's elapsed
//! time. Closed-loop modes track that curve as a concurrency level; the
//! open-loop mode integrates it into a cumulative arrival count.

use crate::config::{ScenarioConfig, duration_str};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Guards `ceil` against float noise when the arrival integral lands on an integer
const ARRIVAL_EPSILON: f64 = 1e-9;

/// How a scenario decides to start sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioMode {
    /// Keep `constant_value` sessions open; replace each one that ends
    ConstantConcurrency,
    /// Start sessions at a staged rate regardless of completions
    RampingArrivalRate,
    /// Track a staged concurrency level, retiring sessions on the way down
    RampingConcurrency,
}

impl ScenarioMode {
    pub fn is_open_loop(&self) -> bool {
        matches!(self, ScenarioMode::RampingArrivalRate)
    }
}

/// Ramp towards `target` over `duration`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub target: f64,
    #[serde(with = "duration_str")]
    pub duration: Duration,
}

/// Piecewise-linear target curve
#[derive(Debug, Clone, PartialEq)]
pub struct StageSchedule {
    start: f64,
    stages: Vec<Stage>,
}

impl StageSchedule {
    pub fn new(start: f64, stages: Vec<Stage>) -> Self {
        Self { start, stages }
    }

    /// Interpolated target at `t`. A zero-length stage jumps to its target;
    /// past the last stage the final target holds.
    pub fn value_at(&self, t: Duration) -> f64 {
        let mut from = self.start;
        let mut offset = Duration::ZERO;
        for stage in &self.stages {
            let end = offset + stage.duration;
            if t < end {
                let progress = (t - offset).as_secs_f64() / stage.duration.as_secs_f64();
                return from + (stage.target - from) * progress;
            }
            from = stage.target;
            offset = end;
        }
        from
    }

    /// Area under the curve from 0 to `t`, in target-seconds
    pub fn integral_to(&self, t: Duration) -> f64 {
        let mut area = 0.0;
        let mut from = self.start;
        let mut offset = Duration::ZERO;
        for stage in &self.stages {
            let end = offset + stage.duration;
            if t < end {
                let elapsed = (t - offset).as_secs_f64();
                let value = from + (stage.target - from) * elapsed / stage.duration.as_secs_f64();
                return area + (from + value) / 2.0 * elapsed;
            }
            area += (from + stage.target) / 2.0 * stage.duration.as_secs_f64();
            from = stage.target;
            offset = end;
        }
        area + from * t.saturating_sub(offset).as_secs_f64()
    }
}

/// What the scenario runner should do this tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Decision {
    /// Sessions to start
    pub start: usize,
    /// Running sessions to close early
    pub retire: usize,
}

/// Per-scenario arrival state
#[derive(Debug, Clone)]
pub enum ArrivalController {
    Constant {
        sessions: usize,
    },
    ArrivalRate {
        schedule: StageSchedule,
        time_unit: Duration,
        /// Arrivals already decided, whether started or dropped
        issued: u64,
    },
    Concurrency {
        schedule: StageSchedule,
    },
}

impl ArrivalController {
    pub fn from_config(config: &ScenarioConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let schedule = || StageSchedule::new(config.start_value, config.stages.clone());
        Ok(match config.mode {
            ScenarioMode::ConstantConcurrency => ArrivalController::Constant {
                sessions: config.constant_value.unwrap_or(0) as usize,
            },
            ScenarioMode::RampingArrivalRate => ArrivalController::ArrivalRate {
                schedule: schedule(),
                time_unit: config.time_unit,
                issued: 0,
            },
            ScenarioMode::RampingConcurrency => ArrivalController::Concurrency { schedule: schedule() },
        })
    }

    pub fn mode(&self) -> ScenarioMode {
        match self {
            ArrivalController::Constant { .. } => ScenarioMode::ConstantConcurrency,
            ArrivalController::ArrivalRate { .. } => ScenarioMode::RampingArrivalRate,
            ArrivalController::Concurrency { .. } => ScenarioMode::RampingConcurrency,
        }
    }

    /// Decide starts and retirements at `elapsed` into the scenario, given
    /// the number of sessions currently running and not already retiring.
    pub fn plan(&mut self, elapsed: Duration, active: usize) -> Decision {
        match self {
            ArrivalController::Constant { sessions } => Decision {
                start: sessions.saturating_sub(active),
                retire: 0,
            },
            ArrivalController::ArrivalRate {
                schedule,
                time_unit,
                issued,
            } => {
                let expected = schedule.integral_to(elapsed) / time_unit.as_secs_f64();
                let due = (expected - ARRIVAL_EPSILON).ceil().max(0.0) as u64;
                let start = due.saturating_sub(*issued);
                *issued = (*issued).max(due);
                Decision {
                    start: start as usize,
                    retire: 0,
                }
            }
            ArrivalController::Concurrency { schedule } => {
                let target = schedule.value_at(elapsed).floor().max(0.0) as usize;
                Decision {
                    start: target.saturating_sub(active),
                    retire: active.saturating_sub(target),
                }
            }
        }
    }
}
