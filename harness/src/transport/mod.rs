//! Transport capability consumed by sessions
//!
//! Sessions only see the [`Transport`] and [`Connection`] traits:
//! - `WsTransport` drives a real target through tokio-tungstenite
//! - `StubTransport` is an in-process target for dry runs and tests

mod stub;
mod ws;

pub use stub::{FailurePattern, StubBehavior, StubStats, StubTransport};
pub use ws::WsTransport;

use crate::error::TransportError;
use crate::protocol::Payload;
use async_trait::async_trait;

/// Close codes a target uses to reject a message it considers invalid
pub const REJECTION_CLOSE_CODES: &[u16] = &[1003, 1007, 1008, 1009];

/// Normal closure
pub const CLOSE_NORMAL: u16 = 1000;

/// Where and how to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl ConnectParams {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
        }
    }

    /// Attach a bearer token as `Authorization` header, and optionally as `token` query parameter
    pub fn with_token(mut self, token: &str, in_query: bool) -> Self {
        self.headers
            .push(("Authorization".to_string(), format!("Bearer {}", token)));
        if in_query {
            let separator = if self.url.contains('?') { '&' } else { '?' };
            self.url = format!("{}{}token={}", self.url, separator, token);
        }
        self
    }
}

/// Something received from the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A data message of `len` bytes
    Message { len: usize },
    /// The target sent a close frame
    Close { code: Option<u16>, reason: String },
}

/// Opens connections to the target
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>, TransportError>;
}

/// One open WebSocket connection
#[async_trait]
pub trait Connection: Send {
    /// Send one message
    async fn send(&mut self, payload: &Payload) -> Result<(), TransportError>;

    /// Next inbound event; `None` once the connection is gone.
    ///
    /// Must be cancel safe: sessions poll it inside `select!`.
    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>>;

    /// Start the close handshake and wait for the peer to acknowledge
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}
