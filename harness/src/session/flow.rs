//! Flow templates: what a session sends and how long it stays connected

use crate::config::duration_str;
use crate::error::ConfigError;
use crate::protocol::{MALFORMED_CORPUS_LEN, PayloadKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Named behaviour template for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    /// Always-on device: one message, long hold
    Stable,
    /// Connect, send, disconnect after a short random hold
    Intermittent,
    /// Reconnection storm after an outage; behaves like an intermittent device
    ReconnectSpike,
    /// One connection flooding messages at a fixed rate
    MessageSpam,
    /// Many short connections opened at once
    MultiConnect,
    /// Sends the malformed corpus to test input validation
    MalformedInjection,
}

impl Flow {
    pub fn name(&self) -> &'static str {
        match self {
            Flow::Stable => "stable",
            Flow::Intermittent => "intermittent",
            Flow::ReconnectSpike => "reconnect_spike",
            Flow::MessageSpam => "message_spam",
            Flow::MultiConnect => "multi_connect",
            Flow::MalformedInjection => "malformed_injection",
        }
    }

    /// Resolve the flow's policies, applying per-scenario overrides
    pub fn spec(&self, overrides: &FlowOverrides) -> FlowSpec {
        let mut spec = match self {
            Flow::Stable => FlowSpec {
                send: SendPolicy::Single(PayloadKind::Device),
                hold: HoldPolicy::Fixed(Duration::from_secs(60)),
                invalid_payloads: false,
            },
            Flow::Intermittent | Flow::ReconnectSpike => FlowSpec {
                send: SendPolicy::Single(PayloadKind::Device),
                hold: HoldPolicy::Uniform {
                    min: Duration::from_secs(1),
                    max: Duration::from_secs(3),
                },
                invalid_payloads: false,
            },
            Flow::MessageSpam => FlowSpec {
                send: SendPolicy::Repeated {
                    kind: PayloadKind::Spam,
                    count: 1000,
                    interval: Duration::from_millis(10),
                },
                // Wait for responses before closing
                hold: HoldPolicy::Fixed(Duration::from_secs(2)),
                invalid_payloads: false,
            },
            Flow::MultiConnect => FlowSpec {
                send: SendPolicy::Single(PayloadKind::Hello),
                hold: HoldPolicy::Fixed(Duration::from_secs(1)),
                invalid_payloads: false,
            },
            Flow::MalformedInjection => FlowSpec {
                send: SendPolicy::Repeated {
                    kind: PayloadKind::Malformed,
                    count: MALFORMED_CORPUS_LEN,
                    interval: Duration::from_millis(200),
                },
                hold: HoldPolicy::Fixed(Duration::from_secs(1)),
                invalid_payloads: true,
            },
        };

        if let Some(hold) = overrides.hold {
            spec.hold = hold;
        }
        if let Some(kind) = &overrides.payload {
            spec.send = spec.send.with_kind(kind.clone());
        }
        if overrides.messages.is_some() || overrides.interval.is_some() {
            spec.send = spec.send.with_schedule(overrides.messages, overrides.interval);
        }
        spec
    }
}

/// How long a session stays open after its send phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldPolicy {
    Fixed(#[serde(with = "duration_str")] Duration),
    Uniform {
        #[serde(with = "duration_str")]
        min: Duration,
        #[serde(with = "duration_str")]
        max: Duration,
    },
}

impl HoldPolicy {
    /// Draw a hold duration
    pub fn sample(&self) -> Duration {
        match *self {
            HoldPolicy::Fixed(duration) => duration,
            HoldPolicy::Uniform { min, max } if min >= max => min,
            HoldPolicy::Uniform { min, max } => {
                let millis = rand::rng().random_range(min.as_millis() as u64..=max.as_millis() as u64);
                Duration::from_millis(millis)
            }
        }
    }

    /// Longest hold the policy can draw
    pub fn longest(&self) -> Duration {
        match *self {
            HoldPolicy::Fixed(duration) => duration,
            HoldPolicy::Uniform { min, max } => min.max(max),
        }
    }

    pub fn validate(&self, scenario: &str) -> Result<(), ConfigError> {
        match self {
            HoldPolicy::Uniform { min, max } if min > max => {
                Err(ConfigError::InvalidHold(scenario.to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// What a session sends once it is open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendPolicy {
    None,
    Single(PayloadKind),
    /// `count` messages, one every `interval`
    Repeated {
        kind: PayloadKind,
        count: usize,
        interval: Duration,
    },
}

impl SendPolicy {
    /// Total messages the policy sends
    pub fn message_count(&self) -> usize {
        match self {
            SendPolicy::None => 0,
            SendPolicy::Single(_) => 1,
            SendPolicy::Repeated { count, .. } => *count,
        }
    }

    /// Time from the first send to the last; `None` if it does not fit a `Duration`
    pub fn span(&self) -> Option<Duration> {
        match self {
            SendPolicy::Repeated { interval, .. } => {
                let gaps = u32::try_from(self.message_count().saturating_sub(1)).ok()?;
                interval.checked_mul(gaps)
            }
            SendPolicy::None | SendPolicy::Single(_) => Some(Duration::ZERO),
        }
    }

    fn with_kind(self, kind: PayloadKind) -> Self {
        match self {
            SendPolicy::None | SendPolicy::Single(_) => SendPolicy::Single(kind),
            SendPolicy::Repeated { count, interval, .. } => SendPolicy::Repeated {
                kind,
                count,
                interval,
            },
        }
    }

    fn with_schedule(self, messages: Option<usize>, interval: Option<Duration>) -> Self {
        let (kind, count, current_interval) = match self {
            SendPolicy::None => (PayloadKind::Device, 0, Duration::ZERO),
            SendPolicy::Single(kind) => (kind, 1, Duration::ZERO),
            SendPolicy::Repeated {
                kind,
                count,
                interval,
            } => (kind, count, interval),
        };
        match messages.unwrap_or(count) {
            0 => SendPolicy::None,
            count => SendPolicy::Repeated {
                kind,
                count,
                interval: interval.unwrap_or(current_interval),
            },
        }
    }
}

/// Resolved policies for one flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSpec {
    pub send: SendPolicy,
    pub hold: HoldPolicy,
    /// The flow sends payloads the target is expected to reject
    pub invalid_payloads: bool,
}

/// Per-scenario adjustments to a flow's defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowOverrides {
    pub hold: Option<HoldPolicy>,
    pub messages: Option<usize>,
    #[serde(with = "duration_str::option")]
    pub interval: Option<Duration>,
    pub payload: Option<PayloadKind>,
}

/// Bounded schedule of send deadlines
///
/// Yields `count` deadlines spaced by `interval`, starting at `start`.
/// A deadline already in the past fires immediately; nothing outlives the count.
#[derive(Debug)]
pub struct SendTicker {
    start: Instant,
    interval: Duration,
    count: usize,
    next: usize,
}

impl SendTicker {
    pub fn new(start: Instant, count: usize, interval: Duration) -> Self {
        Self {
            start,
            interval,
            count,
            next: 0,
        }
    }
}

impl Iterator for SendTicker {
    type Item = (usize, Instant);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.count {
            return None;
        }
        let seq = self.next;
        self.next += 1;
        Some((seq, self.start + self.interval * seq as u32))
    }
}
