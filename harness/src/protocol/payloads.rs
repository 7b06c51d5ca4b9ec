//! Message templates used by the built-in flows
//!
//! - device telemetry message sent once per connection
//! - spam rotation of three chat-message shapes
//! - per-connection hello message for multi-connect bursts
//! - malformed corpus for input validation probing

use super::Payload;
use serde::{Deserialize, Serialize};
use chrono::Utc;

/// Number of entries in the malformed corpus
pub const MALFORMED_CORPUS_LEN: usize = 10;

/// Size of the oversized entry in the malformed corpus
const OVERSIZED_PAYLOAD_LEN: usize = 1_000_000;

/// Which template a send policy draws from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Device,
    Spam,
    Hello,
    Malformed,
    /// Free-form text; `{seq}` is replaced by the message sequence number
    Custom(String),
}

/// Device telemetry message
#[derive(Debug, Clone, Serialize)]
struct DeviceMessage<'a> {
    topic: &'a str,
    payload: &'a str,
    target_brokers: &'a [String],
}

/// Chat message shapes rotated by the spam flow
#[derive(Debug, Serialize)]
#[serde(untagged)]
enum SpamMessage<'a> {
    Typed {
        #[serde(rename = "type")]
        kind: &'static str,
        solicitation_id: &'a str,
        text: String,
        timestamp: i64,
    },
    Plain {
        message: String,
        solicitation_id: &'a str,
    },
    Content {
        content: String,
        chat_id: &'a str,
    },
}

/// Static message templates, built once per run
#[derive(Debug, Clone)]
pub struct PayloadTemplates {
    /// Topic the device message publishes to
    pub topic: String,
    /// Base64 body of the device message
    pub device_body: String,
    /// Brokers named in the device message
    pub target_brokers: Vec<String>,
    /// Channel identifier embedded in chat-shaped messages
    pub channel_id: String,
}

impl Default for PayloadTemplates {
    fn default() -> Self {
        Self {
            topic: "my.iot".to_string(),
            device_body: "SGVsbG8gV29ybGQ=".to_string(), // "Hello World"
            target_brokers: vec!["ligmaNats".to_string()],
            channel_id: "1".to_string(),
        }
    }
}

impl PayloadTemplates {
    /// Render the message with sequence number `seq` for the given kind
    pub fn render(&self, kind: &PayloadKind, seq: usize) -> Payload {
        match kind {
            PayloadKind::Device => self.device(),
            PayloadKind::Spam => self.spam(seq),
            PayloadKind::Hello => self.hello(seq),
            PayloadKind::Malformed => malformed(seq % MALFORMED_CORPUS_LEN),
            PayloadKind::Custom(template) => Payload::from(template.replace("{seq}", &seq.to_string())),
        }
    }

    pub fn device(&self) -> Payload {
        let message = DeviceMessage {
            topic: &self.topic,
            payload: &self.device_body,
            target_brokers: &self.target_brokers,
        };
        to_json(&message)
    }

    pub fn spam(&self, seq: usize) -> Payload {
        let message = match seq % 3 {
            0 => SpamMessage::Typed {
                kind: "message",
                solicitation_id: &self.channel_id,
                text: format!("Test message {}", seq),
                timestamp: now_millis(),
            },
            1 => SpamMessage::Plain {
                message: format!("Spam {}", seq),
                solicitation_id: &self.channel_id,
            },
            _ => SpamMessage::Content {
                content: format!("Content {}", seq),
                chat_id: &self.channel_id,
            },
        };
        to_json(&message)
    }

    pub fn hello(&self, seq: usize) -> Payload {
        let message = SpamMessage::Typed {
            kind: "message",
            solicitation_id: &self.channel_id,
            text: format!("Connection {} test", seq),
            timestamp: now_millis(),
        };
        to_json(&message)
    }
}

/// Entry `index` of the malformed corpus
fn malformed(index: usize) -> Payload {
    let text = match index {
        0 => "not json".to_string(),
        1 => r#"{"invalid": json}"#.to_string(),
        2 => r#"{"solicitation_id":"' OR '1'='1"}"#.to_string(),
        3 => r#"{"solicitation_id":"../../../etc/passwd"}"#.to_string(),
        4 => "A".repeat(OVERSIZED_PAYLOAD_LEN),
        5 => r#"{"text":"<script>alert(\"xss\")</script>"}"#.to_string(),
        6 => r#"{"solicitation_id":-1}"#.to_string(),
        7 => r#"{"solicitation_id":null}"#.to_string(),
        8 => String::new(),
        _ => "\0\0\0".to_string(),
    };
    Payload::from(text)
}

fn to_json<T: Serialize>(message: &T) -> Payload {
    // Serializing these plain structs cannot fail
    Payload::from(serde_json::to_string(message).unwrap_or_default())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
