//! Outbound connection loop.
//!
//! One attempt at a time: dial the host's control socket, run the hello
//! handshake, install static forwards, start the session monitor and
//! helper IPC, then drive the read loop until the channel dies. Every
//! exit path funnels back into the reconnect loop with exponential
//! backoff.

use crate::config::AgentConfig;
use crate::handlers::build_dispatcher;
use crate::ipc::HelperIpc;
use crate::monitor::{MonitorConfig, SessionMonitor};
use crate::tmux::TmuxSource;
use anyhow::{bail, Context};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tether_core::codec::{frame_decode, frame_encode, read_frame};
use tether_core::{
    payload, Channel, Envelope, ForwardDirection, ForwardRole, ForwardService, Kind, PeerForwards,
    ResponseBody, TunnelMux, PROTOCOL_VERSION,
};
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::{info, warn};

/// How long the host gets to answer the hello.
const HELLO_TIMEOUT: Duration = Duration::from_secs(5);
/// Timeout for static forward negotiation requests.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect delay: 1s, doubling, capped at 60s.
#[derive(Debug)]
pub struct Backoff {
    delay: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_secs(1);
    const CAP: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self {
            delay: Self::INITIAL,
        }
    }

    /// Current delay; doubles for the next call.
    pub fn next(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(Self::CAP);
        delay
    }

    pub fn reset(&mut self) {
        self.delay = Self::INITIAL;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Connector {
    config: Arc<AgentConfig>,
    /// Remote forwards the host holds on our behalf.
    peer: Arc<PeerForwards>,
}

impl Connector {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config: Arc::new(config),
            peer: PeerForwards::new(),
        }
    }

    pub fn peer_forwards(&self) -> Arc<PeerForwards> {
        self.peer.clone()
    }

    /// Reconnect loop. Never returns; the caller cancels it on shutdown.
    pub async fn run(&self) {
        let mut backoff = Backoff::new();
        loop {
            info!(socket = %self.config.socket_path.display(), "connecting to host");
            match self.session(&mut backoff).await {
                Ok(()) => warn!("connection to host closed, reconnecting"),
                Err(e) => warn!(error = %e, "connection failed"),
            }
            tokio::time::sleep(backoff.next()).await;
        }
    }

    /// One full connection lifetime: handshake through channel loss.
    async fn session(&self, backoff: &mut Backoff) -> anyhow::Result<()> {
        let mut stream = UnixStream::connect(&self.config.socket_path)
            .await
            .with_context(|| format!("dialing {}", self.config.socket_path.display()))?;
        handshake(&mut stream, &self.config.identity).await?;
        info!(identity = %self.config.identity, "connected to host");

        let channel = Channel::new(stream);
        // The link is up past the handshake; however this connection
        // later dies, the next attempt starts from the shortest delay.
        backoff.reset();
        let mux = TunnelMux::new();
        let forwards = ForwardService::new(ForwardRole::Agent, mux.clone());
        let dispatcher = Arc::new(build_dispatcher(
            channel.clone(),
            forwards.clone(),
            mux.clone(),
            self.peer.clone(),
        ));

        self.install_forwards(&channel, &forwards).await;

        let monitor = SessionMonitor::new(
            TmuxSource,
            channel.clone(),
            MonitorConfig {
                stall_enabled: self.config.stall_enabled,
                stall_threshold: self.config.stall_threshold,
                stall_check_interval: self.config.stall_check_interval,
                worktree_root: self.config.worktree_root.clone(),
                ..MonitorConfig::default()
            },
        );
        let monitor_task = tokio::spawn(monitor.run());

        let ipc_task = match &self.config.ipc_path {
            Some(path) => match HelperIpc::bind(path, channel.clone()) {
                Ok(ipc) => Some(tokio::spawn(async move { ipc.run().await })),
                Err(e) => {
                    warn!(error = %e, "helper IPC unavailable");
                    None
                }
            },
            None => None,
        };

        // Blocks until EOF or a transport error.
        let result = channel.run(dispatcher).await;

        monitor_task.abort();
        if let Some(task) = ipc_task {
            task.abort();
        }
        forwards.clear().await;
        self.peer.clear();
        mux.shutdown_all().await;
        channel.close().await;

        result.map_err(Into::into)
    }

    /// Install the statically configured forwards. Individual failures
    /// are logged, never fatal to the connection.
    async fn install_forwards(&self, channel: &Arc<Channel>, forwards: &Arc<ForwardService>) {
        for spec in &self.config.forwards {
            let outcome = match spec.direction {
                // The agent owns the in-sandbox listener.
                ForwardDirection::Local => forwards
                    .add(spec.clone(), channel.clone())
                    .await
                    .map_err(|e| e.to_string()),
                // Remote listeners live on the host; negotiate them.
                ForwardDirection::Remote => {
                    let payload = match serde_json::to_value(spec) {
                        Ok(Value::Object(map)) => map,
                        _ => continue,
                    };
                    match channel.request("port_add", payload, FORWARD_TIMEOUT).await {
                        Ok(body) if body.ok => {
                            self.peer.record(spec.clone());
                            Ok(())
                        }
                        Ok(body) => Err(body.error.unwrap_or_else(|| "refused".into())),
                        Err(e) => Err(e.to_string()),
                    }
                }
            };
            match outcome {
                Ok(()) => info!(name = %spec.name, "forward installed"),
                Err(e) => warn!(name = %spec.name, error = %e, "forward install failed"),
            }
        }
    }
}

/// Send the hello request on the raw stream and await its response.
async fn handshake(stream: &mut UnixStream, identity: &str) -> anyhow::Result<()> {
    let hello = Envelope::request(
        "hello",
        payload! {"identity" => identity, "version" => PROTOCOL_VERSION},
    );
    stream.write_all(&frame_encode(&hello)?).await?;
    stream.flush().await?;

    let frame = tokio::time::timeout(HELLO_TIMEOUT, read_frame(stream))
        .await
        .context("timed out waiting for hello response")??;
    let Some(frame) = frame else {
        bail!("host closed the connection during handshake");
    };
    let reply = frame_decode(&frame)?;
    if reply.kind != Kind::Response || reply.id != hello.id {
        bail!("unexpected frame during handshake");
    }
    let body = ResponseBody::from_payload(&reply.payload);
    if !body.ok {
        bail!(
            "host rejected hello: {}",
            body.error.unwrap_or_else(|| "unknown error".into())
        );
    }
    Ok(())
}
