//! Per-identity usage and rate-limit bookkeeping.
//!
//! In-sandbox helper scripts report agent rate-limit windows through
//! the secondary IPC boundary; those requests are proxied onto the
//! control channel and land here. The store answers `check_agent`,
//! `get_usage_status`, and `clear_rate_limit`.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tether_core::envelope::now_secs;
use tracing::info;

#[derive(Debug, Clone, Default)]
struct UsageRecord {
    /// Unix seconds when the reported limit window resets, if any.
    reset_at: Option<f64>,
    /// The full last report, returned verbatim in status queries.
    last_report: Map<String, Value>,
    reported_at: f64,
}

#[derive(Default)]
pub struct UsageTracker {
    records: Mutex<HashMap<String, UsageRecord>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a `report_rate_limit` payload for this identity.
    pub fn report(&self, identity: &str, payload: &Map<String, Value>) {
        let reset_at = payload.get("reset_at").and_then(Value::as_f64);
        info!(identity, reset_at, "rate limit reported");
        self.records.lock().expect("usage lock").insert(
            identity.to_string(),
            UsageRecord {
                reset_at,
                last_report: payload.clone(),
                reported_at: now_secs(),
            },
        );
    }

    /// Whether a reported limit window is still open.
    pub fn is_limited(&self, identity: &str) -> bool {
        let records = self.records.lock().expect("usage lock");
        match records.get(identity).and_then(|r| r.reset_at) {
            Some(reset_at) => reset_at > now_secs(),
            None => false,
        }
    }

    /// Status payload for `get_usage_status`.
    pub fn status(&self, identity: &str) -> Map<String, Value> {
        let records = self.records.lock().expect("usage lock");
        let mut data = Map::new();
        match records.get(identity) {
            Some(record) => {
                let limited = record.reset_at.is_some_and(|t| t > now_secs());
                data.insert("rate_limited".into(), Value::Bool(limited));
                if let Some(reset_at) = record.reset_at {
                    data.insert("reset_at".into(), Value::from(reset_at));
                }
                data.insert("reported_at".into(), Value::from(record.reported_at));
                data.insert(
                    "last_report".into(),
                    Value::Object(record.last_report.clone()),
                );
            }
            None => {
                data.insert("rate_limited".into(), Value::Bool(false));
            }
        }
        data
    }

    pub fn clear(&self, identity: &str) -> bool {
        let cleared = self
            .records
            .lock()
            .expect("usage lock")
            .remove(identity)
            .is_some();
        if cleared {
            info!(identity, "rate limit cleared");
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::payload;

    #[test]
    fn report_then_status_then_clear() {
        let tracker = UsageTracker::new();
        assert!(!tracker.is_limited("sandbox-a"));
        assert_eq!(tracker.status("sandbox-a")["rate_limited"], false);

        let future = now_secs() + 3600.0;
        tracker.report("sandbox-a", &payload! {"reset_at" => future, "model" => "primary"});
        assert!(tracker.is_limited("sandbox-a"));
        let status = tracker.status("sandbox-a");
        assert_eq!(status["rate_limited"], true);
        assert_eq!(status["last_report"]["model"], "primary");

        assert!(tracker.clear("sandbox-a"));
        assert!(!tracker.is_limited("sandbox-a"));
        assert!(!tracker.clear("sandbox-a"));
    }

    #[test]
    fn expired_window_is_not_limited() {
        let tracker = UsageTracker::new();
        tracker.report("sandbox-a", &payload! {"reset_at" => now_secs() - 10.0});
        assert!(!tracker.is_limited("sandbox-a"));
    }
}
