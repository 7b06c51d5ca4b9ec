//! tokio-tungstenite backed transport

use super::{Connection, ConnectParams, Inbound, Transport};
use crate::error::TransportError;
use crate::protocol::Payload;
use async_trait::async_trait;
use std::sync::Once;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace};

static CRYPTO_PROVIDER: Once = Once::new();

/// Connects to real WebSocket targets (`ws://` and `wss://`)
#[derive(Debug, Clone, Copy)]
pub struct WsTransport {
    _private: (),
}

impl WsTransport {
    /// Installs the process-wide rustls provider on first use
    pub fn new() -> Self {
        CRYPTO_PROVIDER.call_once(|| {
            // Err means another component installed one first
            if rustls::crypto::aws_lc_rs::default_provider()
                .install_default()
                .is_err()
            {
                debug!("Keeping the already installed TLS crypto provider");
            }
        });
        Self { _private: () }
    }
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, params: &ConnectParams) -> Result<Box<dyn Connection>, TransportError> {
        let mut request = params
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        for (name, value) in &params.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Connect(format!("invalid header name: {}", e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Connect(format!("invalid header value: {}", e)))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, response) = connect_async(request).await.map_err(connect_error)?;
        trace!("Handshake complete with status {}", response.status());

        Ok(Box::new(WsConnection { stream }))
    }
}

struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, payload: &Payload) -> Result<(), TransportError> {
        let message = Message::Text(payload.as_str().to_owned().into());
        self.stream.send(message).await.map_err(|e| match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            other => TransportError::Send(other.to_string()),
        })
    }

    async fn recv(&mut self) -> Option<Result<Inbound, TransportError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Some(Ok(Inbound::Message { len: text.len() }));
                }
                Some(Ok(Message::Binary(data))) => {
                    return Some(Ok(Inbound::Message { len: data.len() }));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Some(Ok(Inbound::Close { code, reason }));
                }
                // Ping/pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    return None;
                }
                Some(Err(e)) => return Some(Err(TransportError::Receive(e.to_string()))),
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        };
        match self.stream.close(Some(frame)).await {
            Ok(()) => {}
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => return Ok(()),
            Err(e) => return Err(TransportError::Send(e.to_string())),
        }

        // Drain until the peer acknowledges the close
        while let Some(result) = self.stream.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => break,
                Err(e) => {
                    debug!("Error while awaiting close acknowledgement: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }
}

fn connect_error(error: WsError) -> TransportError {
    match error {
        WsError::Http(response) => TransportError::Handshake {
            status: response.status().as_u16(),
        },
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
        other => TransportError::Connect(other.to_string()),
    }
}
