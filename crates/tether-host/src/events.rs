//! Host event hooks.
//!
//! The seam where external collaborators (web UI, desktop notifier,
//! messaging channels) observe the protocol: connection lifecycle,
//! terminal stream traffic, state refreshes, and user-facing
//! notifications. Everything here is informational; hook impls must
//! not block the protocol loop.

use serde_json::{Map, Value};
use tracing::info;

#[allow(unused_variables)]
pub trait HostEvents: Send + Sync {
    fn agent_connected(&self, identity: &str) {}
    fn agent_disconnected(&self, identity: &str) {}

    /// A `notify` request arrived (stall notifications included).
    fn notification(&self, identity: &str, title: &str, message: &str, urgency: &str) {}

    /// The sandbox asked to place text on the host clipboard.
    fn clipboard(&self, identity: &str, text: &str) {}

    fn stream_registered(&self, identity: &str, session: &str) {}
    fn stream_unregistered(&self, identity: &str, session: &str) {}
    fn stream_data(&self, identity: &str, session: &str, buffer: &str) {}
    fn session_resumed(&self, identity: &str, session: &str) {}

    /// Periodic state refresh; pushed unconditionally by the peer.
    fn state_updated(&self, identity: &str, hash: &str, payload: &Map<String, Value>) {}
}

/// Default hook: structured logs only.
pub struct LogEvents;

impl HostEvents for LogEvents {
    fn agent_connected(&self, identity: &str) {
        info!(identity, "agent connected");
    }

    fn agent_disconnected(&self, identity: &str) {
        info!(identity, "agent disconnected");
    }

    fn notification(&self, identity: &str, title: &str, message: &str, urgency: &str) {
        info!(identity, title, message, urgency, "notification");
    }

    fn clipboard(&self, identity: &str, text: &str) {
        info!(identity, bytes = text.len(), "clipboard set");
    }

    fn stream_registered(&self, identity: &str, session: &str) {
        info!(identity, session, "stream registered");
    }

    fn stream_unregistered(&self, identity: &str, session: &str) {
        info!(identity, session, "stream unregistered");
    }

    fn session_resumed(&self, identity: &str, session: &str) {
        info!(identity, session, "session resumed");
    }
}
