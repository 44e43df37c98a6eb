//! Control-channel message envelope.
//!
//! Every frame on the wire carries one envelope:
//!
//! ```json
//! {"kind": "request", "type": "port_add", "id": "<uuid>", "ts": 1714.5, "payload": {...}}
//! ```
//!
//! `id` is present only on requests and their matching response; events
//! are fire-and-forget and carry no correlation id.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Envelope kind — request/response/event tagged union.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Request,
    Response,
    Event,
}

/// One control-channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: Kind,
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Unix timestamp in seconds, fractional.
    pub ts: f64,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Build a request envelope with a fresh correlation id.
    pub fn request(msg_type: &str, payload: Map<String, Value>) -> Self {
        Self {
            kind: Kind::Request,
            msg_type: msg_type.to_string(),
            id: Some(uuid::Uuid::new_v4().to_string()),
            ts: now_secs(),
            payload,
        }
    }

    /// Build the response to a request, reusing its correlation id.
    pub fn response(id: &str, msg_type: &str, body: ResponseBody) -> Self {
        Self {
            kind: Kind::Response,
            msg_type: msg_type.to_string(),
            id: Some(id.to_string()),
            ts: now_secs(),
            payload: body.into_payload(),
        }
    }

    /// Build a fire-and-forget event envelope (no correlation id).
    pub fn event(msg_type: &str, payload: Map<String, Value>) -> Self {
        Self {
            kind: Kind::Event,
            msg_type: msg_type.to_string(),
            id: None,
            ts: now_secs(),
            payload,
        }
    }
}

/// Response payload convention: `{ok, error?, data?}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseBody {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl ResponseBody {
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            data: None,
        }
    }

    pub fn ok_with(data: Map<String, Value>) -> Self {
        Self {
            ok: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
            data: None,
        }
    }

    /// Parse a response envelope's payload back into the `{ok, error?, data?}` shape.
    pub fn from_payload(payload: &Map<String, Value>) -> Self {
        Self {
            ok: payload.get("ok").and_then(Value::as_bool).unwrap_or(false),
            error: payload
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string),
            data: payload
                .get("data")
                .and_then(Value::as_object)
                .cloned(),
        }
    }

    fn into_payload(self) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("ok".into(), Value::Bool(self.ok));
        if let Some(error) = self.error {
            payload.insert("error".into(), Value::String(error));
        }
        if let Some(data) = self.data {
            payload.insert("data".into(), Value::Object(data));
        }
        payload
    }
}

/// Current wall-clock time as fractional unix seconds.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Shorthand for building a JSON object payload.
#[macro_export]
macro_rules! payload {
    {$($key:expr => $value:expr),* $(,)?} => {{
        let mut map = serde_json::Map::new();
        $(map.insert($key.to_string(), serde_json::Value::from($value));)*
        map
    }};
}
