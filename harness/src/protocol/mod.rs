//! Wire payloads sent by load sessions

mod payloads;

pub use payloads::{MALFORMED_CORPUS_LEN, PayloadKind, PayloadTemplates};

/// A single text WebSocket message as handed to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(String);

impl Payload {
    /// Size of the message body in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw bytes of the message body
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload(text.to_string())
    }
}
