//! Connection registry.
//!
//! The host-side table of live sandbox connections, keyed by the
//! identity declared in the hello handshake. At most one connection
//! exists per identity at any instant: registering a new one returns
//! the superseded entry, which the caller must cancel and close
//! *after* the registry lock is released — cancellation under the lock
//! could re-enter the registry and self-deadlock.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tether_core::{
    Channel, ForwardService, ForwardSpec, PeerForwards, TetherError, TetherResult, TunnelMux,
};
use tokio::task::AbortHandle;
use tracing::{debug, info};

/// Lightweight metadata for a terminal session observed on the peer.
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    pub cursor_x: u64,
    pub cursor_y: u64,
    pub last_data_ts: f64,
}

/// One live peer connection, owned by the registry.
pub struct Connection {
    pub identity: String,
    /// Monotonic id distinguishing this connection from any later one
    /// for the same identity (supersession race guard).
    pub conn_id: u64,
    pub connected_at: SystemTime,
    pub channel: Arc<Channel>,
    pub forwards: Arc<ForwardService>,
    /// `local` forwards the agent holds at this side's request.
    pub peer_forwards: Arc<PeerForwards>,
    pub mux: Arc<TunnelMux>,
    /// Known session names → metadata, written by the control read loop.
    pub sessions: Mutex<HashMap<String, SessionMeta>>,
    /// Last state_update content hash pushed by the peer.
    pub last_state: Mutex<Option<(String, f64)>>,
    /// Abort handle for the control read-loop task; set once after spawn.
    read_task: Mutex<Option<AbortHandle>>,
}

impl Connection {
    pub fn new(
        identity: String,
        conn_id: u64,
        channel: Arc<Channel>,
        forwards: Arc<ForwardService>,
        mux: Arc<TunnelMux>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            conn_id,
            connected_at: SystemTime::now(),
            channel,
            forwards,
            peer_forwards: PeerForwards::new(),
            mux,
            sessions: Mutex::new(HashMap::new()),
            last_state: Mutex::new(None),
            read_task: Mutex::new(None),
        })
    }

    pub fn set_read_task(&self, task: AbortHandle) {
        *self.read_task.lock().expect("read_task lock") = Some(task);
    }

    /// Take the read-loop handle for cancellation (supersession path).
    pub fn take_read_task(&self) -> Option<AbortHandle> {
        self.read_task.lock().expect("read_task lock").take()
    }

    /// Ask the agent to bind a `local` forward and record it on success.
    ///
    /// The record is dropped again by the agent's `forward_removed`
    /// event when that forward goes away.
    pub async fn install_peer_forward(
        &self,
        spec: ForwardSpec,
        timeout: Duration,
    ) -> TetherResult<()> {
        let payload = match serde_json::to_value(&spec)? {
            Value::Object(map) => map,
            _ => {
                return Err(TetherError::InvalidMessage(
                    "forward spec must serialize to an object".into(),
                ))
            }
        };
        let body = self.channel.request("port_add", payload, timeout).await?;
        if !body.ok {
            return Err(TetherError::Forward(
                body.error.unwrap_or_else(|| "refused".into()),
            ));
        }
        self.peer_forwards.record(spec);
        Ok(())
    }

    pub fn record_state(&self, hash: &str, ts: f64) {
        *self.last_state.lock().expect("last_state lock") = Some((hash.to_string(), ts));
    }

    pub fn update_session(&self, name: &str, meta: SessionMeta) {
        self.sessions
            .lock()
            .expect("sessions lock")
            .insert(name.to_string(), meta);
    }

    pub fn drop_session(&self, name: &str) {
        self.sessions.lock().expect("sessions lock").remove(name);
    }

    pub fn session_names(&self) -> Vec<String> {
        self.sessions
            .lock()
            .expect("sessions lock")
            .keys()
            .cloned()
            .collect()
    }

    /// Diagnostic snapshot used by `check_agent`.
    pub fn describe(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("identity".into(), Value::from(self.identity.clone()));
        let uptime = self
            .connected_at
            .elapsed()
            .map(|d| d.as_secs())
            .unwrap_or(0);
        map.insert("connected_secs".into(), Value::from(uptime));
        map.insert(
            "sessions".into(),
            Value::from(self.session_names()),
        );
        map
    }
}

/// Identity-keyed table of live connections.
///
/// One mutex guards the map; mutations run fully under the lock, and
/// no lock is ever held across an await or a task cancellation.
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    next_conn_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert the connection, returning the superseded one if the
    /// identity was already registered. The caller owns cancelling and
    /// closing the returned connection, outside this lock.
    pub fn register(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        let mut connections = self.connections.lock().expect("registry lock");
        let old = connections.insert(conn.identity.clone(), conn.clone());
        if old.is_some() {
            info!(identity = %conn.identity, "superseding existing connection");
        } else {
            info!(identity = %conn.identity, "connection registered");
        }
        old
    }

    /// Remove the connection only if `conn_id` still matches the
    /// registered entry. Guards the race where a newer connection for
    /// the same identity replaced this one before its disconnect was
    /// observed.
    pub fn remove_if_current(&self, identity: &str, conn_id: u64) -> Option<Arc<Connection>> {
        let mut connections = self.connections.lock().expect("registry lock");
        match connections.get(identity) {
            Some(current) if current.conn_id == conn_id => {
                let removed = connections.remove(identity);
                info!(identity, "connection removed");
                removed
            }
            Some(_) => {
                debug!(identity, conn_id, "stale disconnect ignored (superseded)");
                None
            }
            None => None,
        }
    }

    pub fn get(&self, identity: &str) -> Option<Arc<Connection>> {
        self.connections
            .lock()
            .expect("registry lock")
            .get(identity)
            .cloned()
    }

    pub fn identities(&self) -> Vec<String> {
        self.connections
            .lock()
            .expect("registry lock")
            .keys()
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.connections.lock().expect("registry lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{ForwardRole, ForwardService};

    fn connection(registry: &ConnectionRegistry, identity: &str) -> Arc<Connection> {
        let (local, _remote) = tokio::io::duplex(64);
        let channel = Channel::new(local);
        let mux = TunnelMux::new();
        let forwards = ForwardService::new(ForwardRole::Host, mux.clone());
        Connection::new(
            identity.to_string(),
            registry.next_conn_id(),
            channel,
            forwards,
            mux,
        )
    }

    #[tokio::test]
    async fn register_returns_superseded_entry() {
        let registry = ConnectionRegistry::new();
        let first = connection(&registry, "sandbox-a");
        let second = connection(&registry, "sandbox-a");

        assert!(registry.register(first.clone()).is_none());
        let old = registry.register(second.clone()).expect("superseded");
        assert_eq!(old.conn_id, first.conn_id);
        assert_eq!(registry.count(), 1);
        assert_eq!(
            registry.get("sandbox-a").unwrap().conn_id,
            second.conn_id
        );
    }

    #[tokio::test]
    async fn stale_disconnect_does_not_remove_newer_connection() {
        let registry = ConnectionRegistry::new();
        let first = connection(&registry, "sandbox-a");
        let second = connection(&registry, "sandbox-a");

        registry.register(first.clone());
        registry.register(second.clone());

        // The old connection's disconnect races in after supersession.
        assert!(registry
            .remove_if_current("sandbox-a", first.conn_id)
            .is_none());
        assert_eq!(registry.count(), 1);

        assert!(registry
            .remove_if_current("sandbox-a", second.conn_id)
            .is_some());
        assert_eq!(registry.count(), 0);
    }
}
