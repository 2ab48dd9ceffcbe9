//! Job messages
//!
//! A [`Message`] is one delivery of a job document. The document itself is a
//! JSON object ([`JobRecord`]); the exact bytes it was read from are kept
//! alongside it because acknowledgement removes the in-progress entry by
//! value.

use crate::error::MessageError;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Retries granted to a job with `"retry": true`
pub const DEFAULT_MAX_RETRY: u32 = 25;

/// Retry policy carried by a job, encoded as `true`/`false` or a max count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "RetryWire", into = "RetryWire")]
pub enum Retry {
    #[default]
    Disabled,
    /// Retry up to [`DEFAULT_MAX_RETRY`] times
    Enabled,
    /// Retry up to the given number of times
    Max(u32),
}

impl Retry {
    /// Maximum number of retries, `None` when retrying is off
    pub fn max_retries(&self) -> Option<u32> {
        match self {
            Retry::Disabled => None,
            Retry::Enabled => Some(DEFAULT_MAX_RETRY),
            Retry::Max(max) => Some(*max),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, Retry::Disabled)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RetryWire {
    Flag(bool),
    Max(u32),
}

impl From<RetryWire> for Retry {
    fn from(wire: RetryWire) -> Self {
        match wire {
            RetryWire::Flag(true) => Retry::Enabled,
            RetryWire::Flag(false) => Retry::Disabled,
            RetryWire::Max(max) => Retry::Max(max),
        }
    }
}

impl From<Retry> for RetryWire {
    fn from(retry: Retry) -> Self {
        match retry {
            Retry::Disabled => RetryWire::Flag(false),
            Retry::Enabled => RetryWire::Flag(true),
            Retry::Max(max) => RetryWire::Max(max),
        }
    }
}

/// The job document stored in queues and scheduled sets.
///
/// Fields the engine does not know about are kept in `extra` and written back
/// untouched whenever the document is re-encoded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(default)]
    pub jid: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,

    #[serde(default)]
    pub args: Vec<Value>,

    /// Seconds since the epoch, fractional
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enqueued_at: Option<f64>,

    /// Requested execution time, seconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<f64>,

    #[serde(default, skip_serializing_if = "Retry::is_disabled")]
    pub retry: Retry,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_at: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl JobRecord {
    pub fn decode(payload: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One delivery of a job.
///
/// Read-only after parsing apart from the acknowledgement flag, which
/// middleware clears to keep the message in the in-progress list.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    record: JobRecord,
    payload: String,
    ack: bool,
}

impl Message {
    /// Parse a raw payload, keeping the original text verbatim
    pub fn parse(payload: impl Into<String>) -> Result<Self, MessageError> {
        let payload = payload.into();
        let record = JobRecord::decode(&payload)?;
        Ok(Self {
            record,
            payload,
            ack: true,
        })
    }

    pub fn jid(&self) -> &str {
        &self.record.jid
    }

    /// Queue recorded in the document, if any
    pub fn queue(&self) -> Option<&str> {
        self.record.queue.as_deref()
    }

    pub fn args(&self) -> &[Value] {
        &self.record.args
    }

    /// Deserialize the argument list into a typed value (tuple, struct or vec)
    pub fn args_as<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        Ok(serde_json::from_value(Value::Array(self.record.args.clone()))?)
    }

    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.record.enqueued_at.and_then(from_epoch_seconds)
    }

    pub fn retry(&self) -> Retry {
        self.record.retry
    }

    pub fn retry_count(&self) -> Option<u32> {
        self.record.retry_count
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    /// The exact text this message was read from
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Whether the message will be acknowledged once processing ends
    pub fn ack(&self) -> bool {
        self.ack
    }

    /// Keep the message in the in-progress list after processing
    pub fn suppress_ack(&mut self) {
        self.ack = false;
    }
}

/// Current time as fractional seconds since the epoch
pub fn epoch_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_micros() as f64 / 1_000_000.0
}

pub fn now_seconds() -> f64 {
    epoch_seconds(Utc::now())
}

fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let micros = (seconds * 1_000_000.0).round() as i64;
    Utc.timestamp_micros(micros).single()
}
