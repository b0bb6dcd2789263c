//! Wire envelopes of the control-plane protocol.
//!
//! Every inbound text frame is a [`RequestEnvelope`]. Outbound frames are a
//! tagged [`Frame`]: a correlated response, an out-of-band event, or a
//! protocol-level error that is not tied to any request.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Incoming client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Client-chosen correlation id, echoed back as `requestId`.
    #[serde(default)]
    pub id: Value,
    pub command: String,
    #[serde(default)]
    pub data: Value,
}

/// Reply to exactly one [`RequestEnvelope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub error: Option<String>,
    /// Unix time in milliseconds.
    pub time: u64,
    pub pid: u32,
    pub engine_id: u64,
    pub request_id: Value,
    pub data: Value,
}

impl ResponseEnvelope {
    pub fn success(engine_id: u64, request_id: Value, data: Value) -> Self {
        Self {
            error: None,
            time: now_millis(),
            pid: std::process::id(),
            engine_id,
            request_id,
            data,
        }
    }

    pub fn error(engine_id: u64, request_id: Value, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            time: now_millis(),
            pid: std::process::id(),
            engine_id,
            request_id,
            data: Value::Null,
        }
    }
}

/// Outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Response(ResponseEnvelope),
    Event { event: String, data: Value },
    Error { message: String },
}

impl Frame {
    pub fn event(name: impl Into<String>, data: Value) -> Self {
        Self::Event {
            event: name.into(),
            data,
        }
    }

    /// Request id of a response frame.
    pub fn request_id(&self) -> Option<&Value> {
        match self {
            Self::Response(r) => Some(&r.request_id),
            _ => None,
        }
    }
}

/// Out-of-band event names.
pub mod events {
    pub const FRAMEWORK_DIED: &str = "framework died";
    pub const CONFIG_UPDATE: &str = "config update";
    pub const ASSET_LOAD: &str = "asset load";
    pub const STDOUT: &str = "stdout";
    pub const START_TEST: &str = "start test";
    pub const RUN_RESULTS: &str = "run results";
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
