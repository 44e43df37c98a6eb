//! Unix-socket control listener.
//!
//! Accepts sandbox connections, runs the hello handshake on the raw
//! stream, and hands the stream to a [`Channel`] plus per-connection
//! dispatcher. One connection per identity: a second hello for the same
//! identity supersedes the first, and the superseded side's disconnect
//! hook fires before the new connect hook.

use crate::events::HostEvents;
use crate::handlers::build_dispatcher;
use crate::policy::PolicyEnforcer;
use crate::registry::{Connection, ConnectionRegistry};
use crate::usage::UsageTracker;
use anyhow::{bail, Context};
use serde_json::Value;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tether_core::codec::{frame_decode, frame_encode, read_frame};
use tether_core::{
    payload, Channel, Envelope, ForwardRole, ForwardService, Kind, ResponseBody, TunnelMux,
    PROTOCOL_VERSION,
};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

/// How long a fresh connection gets to send its hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ControlListener {
    socket_path: PathBuf,
    listener: UnixListener,
    registry: Arc<ConnectionRegistry>,
    policy: Arc<PolicyEnforcer>,
    usage: Arc<UsageTracker>,
    events: Arc<dyn HostEvents>,
}

impl ControlListener {
    /// Bind the control socket, creating its directory with owner-only
    /// permissions and clearing any stale socket file from a previous
    /// run.
    pub fn bind(
        socket_path: &Path,
        registry: Arc<ConnectionRegistry>,
        policy: Arc<PolicyEnforcer>,
        usage: Arc<UsageTracker>,
        events: Arc<dyn HostEvents>,
    ) -> anyhow::Result<Self> {
        if let Some(dir) = socket_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating socket directory {}", dir.display()))?;
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
        }
        if socket_path.exists() {
            std::fs::remove_file(socket_path)
                .with_context(|| format!("removing stale socket {}", socket_path.display()))?;
        }
        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("binding {}", socket_path.display()))?;
        info!(path = %socket_path.display(), "control socket listening");
        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            listener,
            registry,
            policy,
            usage,
            events,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accept loop. Runs until the surrounding task is cancelled.
    pub async fn run(&self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    let registry = self.registry.clone();
                    let policy = self.policy.clone();
                    let usage = self.usage.clone();
                    let events = self.events.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            handle_connection(stream, registry, policy, usage, events).await
                        {
                            warn!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "control socket accept failed");
                }
            }
        }
    }
}

/// Read the hello request off the raw stream and answer it.
///
/// The first frame must arrive within [`HELLO_TIMEOUT`] and be a
/// `hello` request carrying an `identity`; anything else drops the
/// connection before it touches the registry.
async fn handshake(stream: &mut UnixStream) -> anyhow::Result<String> {
    let frame = tokio::time::timeout(HELLO_TIMEOUT, read_frame(stream))
        .await
        .context("timed out waiting for hello")??;
    let Some(frame) = frame else {
        bail!("connection closed before hello");
    };
    let envelope = frame_decode(&frame)?;
    if envelope.kind != Kind::Request || envelope.msg_type != "hello" {
        bail!("first frame was not a hello request");
    }
    let Some(id) = envelope.id.as_deref() else {
        bail!("hello request without id");
    };
    let Some(identity) = envelope
        .payload
        .get("identity")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    else {
        bail!("hello request without identity");
    };
    if let Some(version) = envelope.payload.get("version").and_then(Value::as_str) {
        if version != PROTOCOL_VERSION {
            warn!(identity, version, "peer speaks a different protocol version");
        }
    }

    let body = ResponseBody::ok_with(payload! {"version" => PROTOCOL_VERSION});
    let reply = frame_encode(&Envelope::response(id, "hello", body))?;
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(identity.to_string())
}

async fn handle_connection(
    mut stream: UnixStream,
    registry: Arc<ConnectionRegistry>,
    policy: Arc<PolicyEnforcer>,
    usage: Arc<UsageTracker>,
    events: Arc<dyn HostEvents>,
) -> anyhow::Result<()> {
    let identity = handshake(&mut stream).await?;
    info!(identity, "agent connected");

    let channel = Channel::new(stream);
    let mux = TunnelMux::new();
    let forwards = ForwardService::new(ForwardRole::Host, mux.clone());
    let conn = Connection::new(
        identity.clone(),
        registry.next_conn_id(),
        channel.clone(),
        forwards,
        mux,
    );
    let conn_id = conn.conn_id;

    // Supersession: tear down the old connection for this identity
    // before announcing the new one.
    if let Some(old) = registry.register(conn.clone()) {
        info!(identity, old_conn_id = old.conn_id, "superseding connection");
        if let Some(task) = old.take_read_task() {
            task.abort();
        }
        old.channel.close().await;
        old.forwards.clear().await;
        old.mux.shutdown_all().await;
        events.agent_disconnected(&old.identity);
    }
    events.agent_connected(&identity);

    let dispatcher = Arc::new(build_dispatcher(
        conn.clone(),
        policy,
        usage,
        events.clone(),
    ));
    let read_loop = tokio::spawn({
        let channel = channel.clone();
        async move {
            if let Err(e) = channel.run(dispatcher).await {
                warn!(error = %e, "control read loop ended");
            }
        }
    });
    conn.set_read_task(read_loop.abort_handle());

    match read_loop.await {
        // Aborted by a superseding connection, which owns the cleanup.
        Err(e) if e.is_cancelled() => return Ok(()),
        Err(e) => warn!(identity, error = %e, "read loop task failed"),
        Ok(()) => {}
    }

    // Normal disconnect. remove_if_current guards against a newer
    // connection having replaced us while the read loop was winding down.
    if registry.remove_if_current(&identity, conn_id).is_some() {
        conn.forwards.clear().await;
        conn.mux.shutdown_all().await;
        channel.close().await;
        events.agent_disconnected(&identity);
        info!(identity, "agent disconnected");
    }
    Ok(())
}
