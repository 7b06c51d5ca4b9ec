use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Lifecycle of a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl SessionState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Open) | (Connecting, Closed) | (Open, Closing) | (Open, Closed) | (Closing, Closed)
        )
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Hold expired and the session closed normally
    Completed,
    /// The connect attempt failed or timed out
    ConnectFailed,
    /// The target closed the connection
    ClosedByPeer { code: Option<u16> },
    /// Asked to close early (ramp-down, drain, run abort)
    Cancelled,
    /// Cancelled before the connect attempt finished
    Interrupted,
    /// The task was terminated without finishing its flow
    #[default]
    Aborted,
}

/// Outcome of one session, reported exactly once
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOutcome {
    pub connected_at: Option<Instant>,
    pub closed_at: Option<Instant>,
    pub connect_latency: Option<Duration>,
    /// Time from connect attempt to close
    pub duration: Duration,
    pub sent: u64,
    pub received: u64,
    pub errors: u64,
    pub connect_succeeded: bool,
    /// Explicit rejections of intentionally malformed payloads
    pub malformed_rejected: u64,
    pub end: EndReason,
}

impl SessionOutcome {
    /// The session made a connect attempt that counts against the target
    pub fn attempted(&self) -> bool {
        self.connect_succeeded || self.end == EndReason::ConnectFailed
    }
}
