//! TCP tunnel streams multiplexed over the control channel.
//!
//! A forwarded connection becomes one tunnel stream: the initiating
//! side sends a `tunnel_open` request naming the stream id and the dial
//! target, then both sides exchange `tunnel_data` events (hex-encoded
//! bytes) and end the stream with a `tunnel_close` event. Each active
//! stream is tracked by id and can be cancelled via an `mpsc` signal to
//! its spawned relay task.

use crate::channel::Channel;
use crate::envelope::ResponseBody;
use crate::error::{TetherError, TetherResult};
use crate::payload;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Decides whether an inbound `tunnel_open` may dial its target.
pub trait DialGuard: Send + Sync {
    fn check_dial(&self, host: &str, port: u16) -> Result<(), String>;
}

/// Permits loopback targets only. The agent side uses this for every
/// inbound stream; the host side substitutes its configured policy.
pub struct LoopbackOnly;

impl DialGuard for LoopbackOnly {
    fn check_dial(&self, host: &str, _port: u16) -> Result<(), String> {
        match host {
            "127.0.0.1" | "localhost" | "::1" => Ok(()),
            other => Err(format!("dial target not allowed: {other}")),
        }
    }
}

/// Manages the active tunnel streams of one connection.
pub struct TunnelMux {
    next_stream: AtomicU64,
    /// Peer→socket write channels, keyed by stream id.
    writes: Mutex<HashMap<u64, mpsc::Sender<Vec<u8>>>>,
    /// Cancel signals for spawned relay tasks.
    cancels: Mutex<HashMap<u64, mpsc::Sender<()>>>,
}

impl TunnelMux {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_stream: AtomicU64::new(1),
            writes: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
        })
    }

    /// Allocate a stream id for an outbound (locally accepted) connection.
    pub fn allocate(&self) -> u64 {
        self.next_stream.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a socket as a tunnel stream and spawn its relay task.
    pub async fn attach(self: &Arc<Self>, stream_id: u64, socket: TcpStream, channel: Arc<Channel>) {
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);
        let (write_tx, write_rx) = mpsc::channel::<Vec<u8>>(64);
        self.cancels.lock().await.insert(stream_id, cancel_tx);
        self.writes.lock().await.insert(stream_id, write_tx);

        let mux = self.clone();
        tokio::spawn(async move {
            relay(socket, cancel_rx, write_rx, channel, stream_id).await;
            mux.forget(stream_id).await;
            debug!(stream_id, "tunnel relay ended");
        });
    }

    /// Handle an inbound `tunnel_open`: policy check, dial, attach.
    pub async fn handle_open(
        self: &Arc<Self>,
        payload: &Map<String, Value>,
        guard: &dyn DialGuard,
        channel: Arc<Channel>,
    ) -> ResponseBody {
        let Some(stream_id) = payload.get("stream").and_then(Value::as_u64) else {
            return ResponseBody::err("tunnel_open missing stream id");
        };
        let host = payload
            .get("host")
            .and_then(Value::as_str)
            .unwrap_or("127.0.0.1")
            .to_string();
        let Some(port) = payload.get("port").and_then(Value::as_u64) else {
            return ResponseBody::err("tunnel_open missing port");
        };
        let port = port as u16;

        if let Err(reason) = guard.check_dial(&host, port) {
            return ResponseBody::err(reason);
        }

        match TcpStream::connect((host.as_str(), port)).await {
            Ok(socket) => {
                self.attach(stream_id, socket, channel).await;
                debug!(stream_id, host = %host, port, "tunnel stream opened");
                ResponseBody::ok()
            }
            Err(e) => {
                warn!(stream_id, host = %host, port, error = %e, "tunnel dial failed");
                ResponseBody::err(e.to_string())
            }
        }
    }

    /// Handle a `tunnel_data` event: forward bytes to the stream's socket.
    pub async fn handle_data(&self, payload: &Map<String, Value>) {
        let Some(stream_id) = payload.get("stream").and_then(Value::as_u64) else {
            return;
        };
        let Some(data) = payload
            .get("data")
            .and_then(Value::as_str)
            .and_then(|s| hex::decode(s).ok())
        else {
            warn!(stream_id, "tunnel_data with undecodable payload");
            return;
        };

        let writes = self.writes.lock().await;
        if let Some(tx) = writes.get(&stream_id) {
            if tx.send(data).await.is_err() {
                debug!(stream_id, "write channel closed, relay ended");
            }
        } else {
            debug!(stream_id, "tunnel_data for unknown stream");
        }
    }

    /// Handle a `tunnel_close` event: cancel the relay and drop bookkeeping.
    pub async fn handle_close(&self, payload: &Map<String, Value>) {
        if let Some(stream_id) = payload.get("stream").and_then(Value::as_u64) {
            self.shutdown_stream(stream_id).await;
        }
    }

    /// Cancel one stream's relay task.
    pub async fn shutdown_stream(&self, stream_id: u64) {
        if let Some(tx) = self.cancels.lock().await.remove(&stream_id) {
            let _ = tx.send(()).await;
        }
        self.writes.lock().await.remove(&stream_id);
    }

    /// Cancel every active stream (connection teardown).
    pub async fn shutdown_all(&self) {
        let cancels: Vec<_> = self.cancels.lock().await.drain().collect();
        for (_, tx) in cancels {
            let _ = tx.send(()).await;
        }
        self.writes.lock().await.clear();
    }

    async fn forget(&self, stream_id: u64) {
        self.cancels.lock().await.remove(&stream_id);
        self.writes.lock().await.remove(&stream_id);
    }

    /// Number of active streams (diagnostics).
    pub async fn active(&self) -> usize {
        self.writes.lock().await.len()
    }
}

/// Event payload for `tunnel_data`.
pub fn data_payload(stream_id: u64, chunk: &[u8]) -> Map<String, Value> {
    payload! {"stream" => stream_id, "data" => hex::encode(chunk)}
}

/// Event payload for `tunnel_close`.
pub fn close_payload(stream_id: u64) -> Map<String, Value> {
    payload! {"stream" => stream_id}
}

/// Request payload for `tunnel_open`.
pub fn open_payload(stream_id: u64, host: &str, port: u16) -> Map<String, Value> {
    payload! {"stream" => stream_id, "host" => host, "port" => port}
}

/// Bidirectional relay between one TCP socket and the control channel.
///
/// Three concurrent branches: cancel signal, socket→channel data, and
/// channel→socket writes fed by [`TunnelMux::handle_data`].
async fn relay(
    socket: TcpStream,
    mut cancel_rx: mpsc::Receiver<()>,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
    channel: Arc<Channel>,
    stream_id: u64,
) {
    let (mut read_half, mut write_half) = socket.into_split();
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                debug!(stream_id, "tunnel relay cancelled");
                break;
            }
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) => {
                        let _ = channel.send_event("tunnel_close", close_payload(stream_id)).await;
                        break;
                    }
                    Ok(n) => {
                        let event = data_payload(stream_id, &buf[..n]);
                        if channel.send_event("tunnel_data", event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(stream_id, error = %e, "tunnel read error");
                        let _ = channel.send_event("tunnel_close", close_payload(stream_id)).await;
                        break;
                    }
                }
            }
            Some(data) = write_rx.recv() => {
                if let Err(e) = write_half.write_all(&data).await {
                    warn!(stream_id, error = %e, "tunnel write error");
                    let _ = channel.send_event("tunnel_close", close_payload(stream_id)).await;
                    break;
                }
            }
        }
    }

    let _ = write_half.shutdown().await;
}

/// Open an outbound tunnel stream for a locally accepted connection.
///
/// Sends `tunnel_open` to the peer and attaches the socket on success.
pub async fn open_stream(
    mux: &Arc<TunnelMux>,
    channel: Arc<Channel>,
    socket: TcpStream,
    host: &str,
    port: u16,
    timeout: std::time::Duration,
) -> TetherResult<u64> {
    let stream_id = mux.allocate();
    let body = channel
        .request("tunnel_open", open_payload(stream_id, host, port), timeout)
        .await?;
    if !body.ok {
        return Err(TetherError::Forward(
            body.error.unwrap_or_else(|| "tunnel_open refused".into()),
        ));
    }
    mux.attach(stream_id, socket, channel).await;
    Ok(stream_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_guard() {
        let guard = LoopbackOnly;
        assert!(guard.check_dial("127.0.0.1", 8080).is_ok());
        assert!(guard.check_dial("localhost", 8080).is_ok());
        assert!(guard.check_dial("10.0.0.1", 8080).is_err());
    }

    #[test]
    fn data_payload_round_trips() {
        let payload = data_payload(7, b"\x00\x01\xff");
        assert_eq!(payload["stream"], 7);
        let decoded = hex::decode(payload["data"].as_str().unwrap()).unwrap();
        assert_eq!(decoded, b"\x00\x01\xff");
    }

    #[tokio::test]
    async fn unknown_stream_data_is_ignored() {
        let mux = TunnelMux::new();
        mux.handle_data(&data_payload(99, b"hi")).await;
        assert_eq!(mux.active().await, 0);
    }
}
