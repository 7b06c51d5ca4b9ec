//! Session driver
//!
//! Runs one connection through `Connecting -> Open -> Closing -> Closed`
//! as a sequential task. The outcome is handed to the metrics sinks exactly
//! once, including when the task is cancelled or aborted mid-flow.

use super::flow::{FlowSpec, SendPolicy, SendTicker};
use super::state::{EndReason, SessionOutcome, SessionState};
use crate::aggregate::MetricsFanout;
use crate::error::TransportError;
use crate::protocol::{PayloadKind, PayloadTemplates};
use crate::transport::{CLOSE_NORMAL, Connection, ConnectParams, Inbound, REJECTION_CLOSE_CODES, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Everything a session needs from its scenario
pub struct SessionContext {
    pub transport: Arc<dyn Transport>,
    pub params: ConnectParams,
    pub templates: Arc<PayloadTemplates>,
    pub connect_timeout: Duration,
    /// Upper bound on the close handshake
    pub close_timeout: Duration,
}

/// One logical connection lifecycle
pub struct Session {
    id: u64,
    flow: FlowSpec,
    ctx: Arc<SessionContext>,
}

/// Reports the outcome when finished, or from `Drop` if the task dies first
struct OutcomeReporter {
    sinks: MetricsFanout,
    started: Instant,
    outcome: SessionOutcome,
    reported: bool,
}

impl OutcomeReporter {
    fn new(sinks: MetricsFanout) -> Self {
        Self {
            sinks,
            started: Instant::now(),
            outcome: SessionOutcome::default(),
            reported: false,
        }
    }

    fn finish(mut self, end: EndReason) -> SessionOutcome {
        self.outcome.end = end;
        self.report();
        self.outcome.clone()
    }

    fn report(&mut self) {
        if self.reported {
            return;
        }
        self.reported = true;
        if self.outcome.connect_succeeded {
            let closed_at = Instant::now();
            self.outcome.closed_at = Some(closed_at);
            self.outcome.duration = closed_at.duration_since(self.started);
        }
        self.sinks.record(&self.outcome);
    }
}

impl Drop for OutcomeReporter {
    fn drop(&mut self) {
        // Task aborted before finishing: end stays `Aborted`
        self.report();
    }
}

impl Session {
    pub fn new(id: u64, flow: FlowSpec, ctx: Arc<SessionContext>) -> Self {
        Self { id, flow, ctx }
    }

    /// Drive the session to completion and report its outcome
    pub async fn run(self, cancel: CancellationToken, sinks: MetricsFanout) -> SessionOutcome {
        let mut reporter = OutcomeReporter::new(sinks);
        let mut state = SessionState::Connecting;

        let connect_timeout = self.ctx.connect_timeout;
        let connect = timeout(connect_timeout, self.ctx.transport.connect(&self.ctx.params));
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                trace!("Session {} cancelled while connecting", self.id);
                return reporter.finish(EndReason::Interrupted);
            }
            result = connect => result.unwrap_or(Err(TransportError::Timeout(connect_timeout))),
        };

        let mut conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                debug!("Session {} failed to connect: {}", self.id, e);
                transition(&mut state, SessionState::Closed);
                return reporter.finish(EndReason::ConnectFailed);
            }
        };
        transition(&mut state, SessionState::Open);
        let connected_at = Instant::now();
        reporter.outcome.connect_succeeded = true;
        reporter.outcome.connected_at = Some(connected_at);
        reporter.outcome.connect_latency = Some(connected_at.duration_since(reporter.started));
        trace!("Session {} open", self.id);

        let stop = match self.send_phase(conn.as_mut(), &cancel, &mut reporter.outcome).await {
            Some(stop) => Some(stop),
            None => {
                let hold_until = Instant::now() + self.flow.hold.sample();
                self.pump_until(conn.as_mut(), hold_until, &cancel, &mut reporter.outcome)
                    .await
            }
        };

        let end = match stop {
            Some(peer @ EndReason::ClosedByPeer { .. }) => {
                transition(&mut state, SessionState::Closed);
                peer
            }
            other => {
                transition(&mut state, SessionState::Closing);
                let reason = if other.is_some() { "cancelled" } else { "done" };
                match timeout(self.ctx.close_timeout, conn.close(CLOSE_NORMAL, reason)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("Session {} close failed: {}", self.id, e),
                    Err(_) => debug!("Session {} close handshake timed out", self.id),
                }
                transition(&mut state, SessionState::Closed);
                other.unwrap_or(EndReason::Completed)
            }
        };

        trace!("Session {} closed: {:?}", self.id, end);
        reporter.finish(end)
    }

    /// Send the flow's messages on their schedule.
    /// Returns the end reason if the session stopped early.
    async fn send_phase(
        &self,
        conn: &mut dyn Connection,
        cancel: &CancellationToken,
        outcome: &mut SessionOutcome,
    ) -> Option<EndReason> {
        let (kind, count, interval) = match &self.flow.send {
            SendPolicy::None => return None,
            SendPolicy::Single(kind) => (kind, 1, Duration::ZERO),
            SendPolicy::Repeated {
                kind,
                count,
                interval,
            } => (kind, *count, *interval),
        };

        for (seq, deadline) in SendTicker::new(Instant::now(), count, interval) {
            if let Some(stop) = self.pump_until(conn, deadline, cancel, outcome).await {
                return Some(stop);
            }
            if let Some(stop) = self.send_one(conn, kind, seq, outcome).await {
                return Some(stop);
            }
        }
        None
    }

    async fn send_one(
        &self,
        conn: &mut dyn Connection,
        kind: &PayloadKind,
        seq: usize,
        outcome: &mut SessionOutcome,
    ) -> Option<EndReason> {
        let payload = self.ctx.templates.render(kind, seq);
        match conn.send(&payload).await {
            Ok(()) => {
                outcome.sent += 1;
                None
            }
            Err(TransportError::Closed) => {
                debug!("Session {} connection closed during send", self.id);
                Some(EndReason::ClosedByPeer { code: None })
            }
            Err(e) => {
                trace!("Session {} send #{} failed: {}", self.id, seq, e);
                outcome.errors += 1;
                None
            }
        }
    }

    /// Consume inbound traffic until `deadline`.
    /// Returns the end reason if the connection stopped before it.
    async fn pump_until(
        &self,
        conn: &mut dyn Connection,
        deadline: Instant,
        cancel: &CancellationToken,
        outcome: &mut SessionOutcome,
    ) -> Option<EndReason> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Some(EndReason::Cancelled),
                inbound = conn.recv() => match inbound {
                    Some(Ok(Inbound::Message { .. })) => outcome.received += 1,
                    Some(Ok(Inbound::Close { code, reason })) => {
                        debug!("Session {} closed by peer: {:?} {}", self.id, code, reason);
                        if self.flow.invalid_payloads
                            && code.is_some_and(|c| REJECTION_CLOSE_CODES.contains(&c))
                        {
                            outcome.malformed_rejected += 1;
                        }
                        return Some(EndReason::ClosedByPeer { code });
                    }
                    Some(Err(e)) => {
                        outcome.errors += 1;
                        if e.is_closed() {
                            return Some(EndReason::ClosedByPeer { code: None });
                        }
                    }
                    None => return Some(EndReason::ClosedByPeer { code: None }),
                },
                _ = sleep_until(deadline) => return None,
            }
        }
    }
}

fn transition(state: &mut SessionState, next: SessionState) {
    debug_assert!(
        state.can_transition_to(next),
        "illegal session transition {:?} -> {:?}",
        state,
        next
    );
    *state = next;
}
