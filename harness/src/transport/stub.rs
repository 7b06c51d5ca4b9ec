//! In-process target used for dry runs and tests
//!
//! The stub never touches the network. It can fail a share of connects,
//! reject payloads by size or content, echo accepted messages, and close
//! the connection itself after a number of sends.

use super::{Connection, ConnectParams, Inbound, Transport};
use crate::error::TransportError;
use crate::protocol::Payload;
use async_trait::async_trait;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// How connect attempts fail
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FailurePattern {
    Never,
    /// Deterministic: exactly `ratio` of attempts fail, spread evenly
    Ratio(f64),
    /// Each attempt fails independently with this probability
    Random(f64),
}

impl FailurePattern {
    fn fails(&self, attempt: u64) -> bool {
        match *self {
            FailurePattern::Never => false,
            FailurePattern::Ratio(ratio) => {
                let ratio = ratio.clamp(0.0, 1.0);
                ((attempt + 1) as f64 * ratio).floor() > (attempt as f64 * ratio).floor()
            }
            FailurePattern::Random(probability) => {
                rand::rng().random_bool(probability.clamp(0.0, 1.0))
            }
        }
    }
}

/// Behaviour of the stub target
#[derive(Debug, Clone)]
pub struct StubBehavior {
    pub connect_latency: Duration,
    pub connect_failures: FailurePattern,
    /// Reject sends larger than this many bytes
    pub max_payload: Option<usize>,
    /// Reject sends containing NUL bytes
    pub reject_nul: bool,
    /// Echo every accepted message back
    pub echo: bool,
    /// Close from the target side after this many accepted sends
    pub close_after_sends: Option<u64>,
    /// Close code used when the target closes
    pub close_code: u16,
}

impl Default for StubBehavior {
    fn default() -> Self {
        Self {
            connect_latency: Duration::ZERO,
            connect_failures: FailurePattern::Never,
            max_payload: None,
            reject_nul: false,
            echo: false,
            close_after_sends: None,
            close_code: 1008,
        }
    }
}

impl StubBehavior {
    /// Behaviour used by dry runs: small latency, echo, random connect failures
    pub fn dry_run(failure_rate: f64) -> Self {
        Self {
            connect_latency: Duration::from_millis(5),
            connect_failures: FailurePattern::Random(failure_rate),
            echo: true,
            ..Default::default()
        }
    }
}

/// Counters observed by the stub target
#[derive(Debug)]
pub struct StubStats {
    pub connect_attempts: AtomicU64,
    pub connect_failures: AtomicU64,
    pub open: AtomicUsize,
    pub peak_open: AtomicUsize,
    pub sends_accepted: AtomicU64,
    pub sends_rejected: AtomicU64,
    pub closes: AtomicU64,
    created_at: Instant,
    connect_offsets: Mutex<Vec<Duration>>,
}

impl StubStats {
    fn new() -> Self {
        Self {
            connect_attempts: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            open: AtomicUsize::new(0),
            peak_open: AtomicUsize::new(0),
            sends_accepted: AtomicU64::new(0),
            sends_rejected: AtomicU64::new(0),
            closes: AtomicU64::new(0),
            created_at: Instant::now(),
            connect_offsets: Mutex::new(Vec::new()),
        }
    }

    pub fn open_now(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak_open.load(Ordering::SeqCst)
    }

    /// Offsets (from stub creation) at which each connect attempt arrived
    pub fn connect_offsets(&self) -> Vec<Duration> {
        self.connect_offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Stub transport; clones share the same statistics
#[derive(Debug, Clone)]
pub struct StubTransport {
    behavior: Arc<StubBehavior>,
    stats: Arc<StubStats>,
}

impl StubTransport {
    pub fn new(behavior: StubBehavior) -> Self {
        Self {
            behavior: Arc::new(behavior),
            stats: Arc::new(StubStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<StubStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn connect(&self, _params: &ConnectParams) -> Result<Box<dyn Connection>, TransportError> {
        let attempt = self.stats.connect_attempts.fetch_add(1, Ordering::SeqCst);
        self.stats
            .connect_offsets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.stats.created_at.elapsed());

        if !self.behavior.connect_latency.is_zero() {
            tokio::time::sleep(self.behavior.connect_latency).await;
        }

        if self.behavior.connect_failures.fails(attempt) {
            self.stats.connect_failures.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::Handshake { status: 503 });
        }

        let open = self.stats.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak_open.fetch_max(open, Ordering::SeqCst);

        Ok(Box::new(StubConnection {
            behavior: Arc::clone(&self.behavior),
            stats: Arc::clone(&self.stats),
            inbox: VecDeque::new(),
            accepted: 0,
            peer_closed: false,
            closed: false,
        }))
    }
}

struct StubConnection {
    behavior: Arc<StubBehavior>,
    stats: Arc<StubStats>,
    inbox: VecDeque<Inbound>,
    accepted: u64,
    peer_closed: bool,
    closed: bool,
}

impl StubConnection {
    fn rejects(&self, payload: &Payload) -> bool {
        if let Some(max) = self.behavior.max_payload
            && payload.len() > max
        {
            return true;
        }
        self.behavior.reject_nul && payload.as_bytes().contains(&0)
    }
}

#[async_trait]
impl Connection for StubConnection {
    async fn send(&mut self, payload: &Payload) -> Result<(), TransportError> {
        if self.peer_closed || self.closed {
            return Err(TransportError::Closed);
        }
        if self.rejects(payload) {
            self.stats.sends_rejected.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::Send("payload rejected".to_string()));
        }

        self.accepted += 1;
        self.stats.sends_accepted.fetch_add(1, Ordering::SeqCst);
        if self.behavior.echo {
            self.inbox.push_back(Inbound::Message { len: payload.len() });
        }
        if let Some(limit) = self.behavior.close_after_sends
            && self.accepted >= limit
        {
            self.peer_closed = true;
            self.inbox.push_back(Inbound::Close {
                code: Some(self.behavior.close_code),
                reason: "limit reached".to_string(),
            });
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        if let Some(next) = self.inbox.pop_front() {
            return Some(Ok(next));
        }
        if self.peer_closed || self.closed {
            return None;
        }
        std::future::pending().await
    }

    async fn close(&mut self, _code: u16, _reason: &str) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for StubConnection {
    fn drop(&mut self) {
        self.stats.open.fetch_sub(1, Ordering::SeqCst);
    }
}
