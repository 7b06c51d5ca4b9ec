//! Error types shared across the harness

use std::time::Duration;
use thiserror::Error;

/// Errors raised by a WebSocket transport
///
/// Every variant is absorbed into session metrics; none of them abort a scenario.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Handshake rejected with HTTP status {status}")]
    Handshake { status: u16 },

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Connection is closed")]
    Closed,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Whether the error means the underlying connection is gone
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed)
    }
}

/// Invalid scenario, threshold or plan configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Scenario '{0}': constant concurrency requires constant_value")]
    MissingConstantValue(String),

    #[error("Scenario '{0}': constant concurrency requires a duration")]
    MissingDuration(String),

    #[error("Scenario '{0}': ramping mode requires at least one stage")]
    MissingStages(String),

    #[error("Scenario '{0}': pool_limit must be greater than zero")]
    InvalidPoolLimit(String),

    #[error("Scenario '{scenario}': stage target {target} is not a finite non-negative number")]
    InvalidStageTarget { scenario: String, target: f64 },

    #[error("Scenario '{0}': time_unit must be greater than zero")]
    InvalidTimeUnit(String),

    #[error("Scenario '{0}': hold range minimum exceeds maximum")]
    InvalidHold(String),

    #[error("Scenario '{scenario}': {what} exceeds the {max:?} limit")]
    DurationTooLong {
        scenario: String,
        what: &'static str,
        max: Duration,
    },

    #[error("Scenario name '{0}' is used more than once")]
    DuplicateScenario(String),

    #[error("Scenario name must not be empty")]
    EmptyScenarioName,

    #[error("Invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("Invalid threshold expression '{0}'")]
    InvalidThreshold(String),

    #[error("Unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("Aggregation '{aggregation}' is not supported for metric '{metric}'")]
    UnsupportedAggregation { metric: String, aggregation: String },

    #[error("Threshold references unknown scenario '{0}'")]
    UnknownScenario(String),

    #[error("Failed to read plan file: {0}")]
    PlanIo(#[from] std::io::Error),

    #[error("Failed to parse plan file: {0}")]
    PlanParse(#[from] serde_json::Error),
}

/// Errors that stop a run before any scenario starts
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Run plan contains no scenarios")]
    EmptyPlan,
}
