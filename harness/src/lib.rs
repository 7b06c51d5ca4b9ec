//! wssiege: WebSocket load and abuse testing
//!
//! This module exports the harness components for the binary, integration
//! tests and external tooling.

pub mod aggregate;
pub mod arrival;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod protocol;
pub mod report;
pub mod scenario;
pub mod session;
pub mod threshold;
pub mod transport;

// Re-export commonly used types
pub use aggregate::{Counters, MetricsAggregator, MetricsSnapshot};
pub use config::{Config, Preset, RunPlan, ScenarioConfig};
pub use error::{ConfigError, HarnessError, TransportError};
pub use orchestrator::Orchestrator;
pub use report::{RunReport, RunState, ScenarioReport, ScenarioStatus};
pub use session::{Flow, SessionContext};
pub use transport::{ConnectParams, StubBehavior, StubTransport, Transport, WsTransport};
