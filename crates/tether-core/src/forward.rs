//! Port forward descriptors and the listener service behind them.
//!
//! A forward is one TCP listener whose accepted connections become
//! tunnel streams (see [`crate::tunnel`]). `local` forwards carry
//! sandbox-originated traffic out through the host; `remote` forwards
//! expose a host port that tunnels into the sandbox. Each listener runs
//! in its own cancelable accept-loop task, so removing a forward frees
//! its port immediately.

use crate::channel::Channel;
use crate::error::{TetherError, TetherResult};
use crate::tunnel::{self, TunnelMux};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Ports below this are never negotiable at runtime.
pub const PRIVILEGED_PORT_MAX: u16 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardDirection {
    /// Sandbox connects out to a host-bound destination.
    Local,
    /// Host exposes a listening port that tunnels to the sandbox.
    Remote,
}

/// One configured or negotiated port forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardSpec {
    pub name: String,
    pub host_port: u16,
    pub container_port: u16,
    pub direction: ForwardDirection,
    #[serde(default = "default_bind_addresses")]
    pub bind_addresses: Vec<String>,
}

fn default_bind_addresses() -> Vec<String> {
    vec!["127.0.0.1".to_string()]
}

impl ForwardSpec {
    /// Reject privileged ports for dynamically negotiated forwards,
    /// regardless of direction.
    pub fn check_unprivileged(&self) -> TetherResult<()> {
        for port in [self.host_port, self.container_port] {
            if port < PRIVILEGED_PORT_MAX {
                return Err(TetherError::PolicyDenied(format!(
                    "privileged port {port} is not allowed"
                )));
            }
        }
        Ok(())
    }
}

/// Which end of the connection this service runs on. Determines the
/// listen port and the dial target sent in `tunnel_open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardRole {
    Host,
    Agent,
}

struct ActiveForward {
    spec: ForwardSpec,
    cancel_tx: mpsc::Sender<()>,
}

/// Owns the TCP listeners for one connection's active forwards.
pub struct ForwardService {
    role: ForwardRole,
    mux: Arc<TunnelMux>,
    /// Keyed by `host_port` — the lookup key for `port_remove`.
    active: Mutex<HashMap<u16, ActiveForward>>,
}

impl ForwardService {
    pub fn new(role: ForwardRole, mux: Arc<TunnelMux>) -> Arc<Self> {
        Arc::new(Self {
            role,
            mux,
            active: Mutex::new(HashMap::new()),
        })
    }

    fn listen_port(&self, spec: &ForwardSpec) -> u16 {
        match self.role {
            ForwardRole::Host => spec.host_port,
            ForwardRole::Agent => spec.container_port,
        }
    }

    fn dial_target(&self, spec: &ForwardSpec) -> (String, u16) {
        match self.role {
            // The agent dials the container port inside the sandbox.
            ForwardRole::Host => ("127.0.0.1".to_string(), spec.container_port),
            // The host dials the destination bound on its loopback.
            ForwardRole::Agent => ("127.0.0.1".to_string(), spec.host_port),
        }
    }

    /// Bind the forward's listener and start accepting.
    ///
    /// Accepted connections each open one tunnel stream toward the
    /// peer; a failed `tunnel_open` drops the single connection, not
    /// the forward.
    pub async fn add(&self, spec: ForwardSpec, channel: Arc<Channel>) -> TetherResult<()> {
        let port = self.listen_port(&spec);
        {
            let active = self.active.lock().await;
            if active.contains_key(&spec.host_port) {
                return Err(TetherError::Forward(format!(
                    "forward for host port {} already exists",
                    spec.host_port
                )));
            }
        }

        let bind_addr = spec
            .bind_addresses
            .first()
            .cloned()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let listener = TcpListener::bind((bind_addr.as_str(), port))
            .await
            .map_err(|e| TetherError::Forward(format!("bind {bind_addr}:{port}: {e}")))?;

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let (target_host, target_port) = self.dial_target(&spec);
        info!(
            name = %spec.name,
            listen = %format!("{bind_addr}:{port}"),
            target = %format!("{target_host}:{target_port}"),
            "forward listener started"
        );

        self.active.lock().await.insert(
            spec.host_port,
            ActiveForward {
                spec: spec.clone(),
                cancel_tx,
            },
        );

        let mux = self.mux.clone();
        tokio::spawn(accept_loop(
            listener,
            cancel_rx,
            mux,
            channel,
            spec.name.clone(),
            target_host,
            target_port,
        ));
        Ok(())
    }

    /// Tear down the forward listening for `host_port`.
    ///
    /// Returns the removed spec, or `None` if no such forward exists.
    /// The cancel signal stops the accept loop, which drops the bound
    /// listener — the port is bindable again as soon as this returns.
    pub async fn remove(&self, host_port: u16) -> Option<ForwardSpec> {
        let entry = self.active.lock().await.remove(&host_port)?;
        let _ = entry.cancel_tx.send(()).await;
        info!(name = %entry.spec.name, host_port, "forward removed");
        Some(entry.spec)
    }

    /// Drop every forward listener (connection teardown).
    pub async fn clear(&self) {
        let entries: Vec<_> = self.active.lock().await.drain().collect();
        for (_, entry) in entries {
            let _ = entry.cancel_tx.send(()).await;
        }
    }

    /// Specs of the currently active forwards (diagnostics, bookkeeping).
    pub async fn list(&self) -> Vec<ForwardSpec> {
        self.active
            .lock()
            .await
            .values()
            .map(|f| f.spec.clone())
            .collect()
    }
}

/// Forwards the peer holds on this side's behalf, keyed by `host_port`.
///
/// A successful `port_add` negotiation records the spec here; the
/// peer's `forward_removed` event forgets it, so both ends agree on
/// which listeners exist after either side removes one.
pub struct PeerForwards {
    entries: std::sync::Mutex<HashMap<u16, ForwardSpec>>,
}

impl PeerForwards {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn record(&self, spec: ForwardSpec) {
        self.entries
            .lock()
            .expect("peer forwards lock")
            .insert(spec.host_port, spec);
    }

    pub fn forget(&self, host_port: u16) -> Option<ForwardSpec> {
        self.entries
            .lock()
            .expect("peer forwards lock")
            .remove(&host_port)
    }

    pub fn list(&self) -> Vec<ForwardSpec> {
        self.entries
            .lock()
            .expect("peer forwards lock")
            .values()
            .cloned()
            .collect()
    }

    /// Connection teardown drops every record; the peer's listeners die
    /// with the channel.
    pub fn clear(&self) {
        self.entries.lock().expect("peer forwards lock").clear();
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut cancel_rx: mpsc::Receiver<()>,
    mux: Arc<TunnelMux>,
    channel: Arc<Channel>,
    name: String,
    target_host: String,
    target_port: u16,
) {
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!(name = %name, "forward accept loop cancelled");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, peer)) => {
                        debug!(name = %name, peer = %peer, "forward connection accepted");
                        let open = tunnel::open_stream(
                            &mux,
                            channel.clone(),
                            socket,
                            &target_host,
                            target_port,
                            Duration::from_secs(5),
                        )
                        .await;
                        if let Err(e) = open {
                            warn!(name = %name, error = %e, "tunnel open refused, dropping connection");
                        }
                    }
                    Err(e) => {
                        warn!(name = %name, error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(host_port: u16, container_port: u16, direction: ForwardDirection) -> ForwardSpec {
        ForwardSpec {
            name: "t".into(),
            host_port,
            container_port,
            direction,
            bind_addresses: default_bind_addresses(),
        }
    }

    #[test]
    fn privileged_ports_rejected_both_directions() {
        for direction in [ForwardDirection::Local, ForwardDirection::Remote] {
            assert!(spec(80, 8080, direction).check_unprivileged().is_err());
            assert!(spec(8080, 443, direction).check_unprivileged().is_err());
            assert!(spec(8080, 3000, direction).check_unprivileged().is_ok());
        }
    }

    #[test]
    fn spec_serde_wire_names() {
        let s = spec(8080, 3000, ForwardDirection::Remote);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["direction"], "remote");
        assert_eq!(json["host_port"], 8080);
        assert_eq!(json["container_port"], 3000);
    }

    #[tokio::test]
    async fn remove_frees_the_port() {
        let mux = TunnelMux::new();
        let service = ForwardService::new(ForwardRole::Host, mux);
        // Unconnected channel: no traffic flows, we only exercise bind/unbind.
        let (local, _remote) = tokio::io::duplex(1024);
        let channel = Channel::new(local);

        // Pick a free port by binding first and dropping.
        let probe = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        service
            .add(spec(port, 9999, ForwardDirection::Remote), channel.clone())
            .await
            .unwrap();
        assert!(TcpListener::bind(("127.0.0.1", port)).await.is_err());

        assert!(service.remove(port).await.is_some());
        // Give the accept loop a beat to observe the cancel signal.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpListener::bind(("127.0.0.1", port)).await.is_ok());
        assert!(service.remove(port).await.is_none());
    }

    #[test]
    fn peer_record_tracks_and_forgets_by_host_port() {
        let peer = PeerForwards::new();
        peer.record(spec(8080, 3000, ForwardDirection::Remote));
        peer.record(spec(9090, 4000, ForwardDirection::Remote));
        assert_eq!(peer.list().len(), 2);

        let dropped = peer.forget(8080).expect("recorded forward");
        assert_eq!(dropped.host_port, 8080);
        assert!(peer.forget(8080).is_none());
        assert_eq!(peer.list().len(), 1);

        peer.clear();
        assert!(peer.list().is_empty());
    }

    #[tokio::test]
    async fn duplicate_forward_rejected() {
        let mux = TunnelMux::new();
        let service = ForwardService::new(ForwardRole::Host, mux);
        let (local, _remote) = tokio::io::duplex(1024);
        let channel = Channel::new(local);

        let probe = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        service
            .add(spec(port, 9000, ForwardDirection::Remote), channel.clone())
            .await
            .unwrap();
        assert!(service
            .add(spec(port, 9001, ForwardDirection::Remote), channel)
            .await
            .is_err());
        service.clear().await;
    }
}
