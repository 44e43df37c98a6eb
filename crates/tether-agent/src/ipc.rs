//! Helper IPC socket.
//!
//! Shell helpers inside the sandbox (`tether-notify`, status scripts)
//! talk line-JSON to a second Unix socket: one `{type, payload}`
//! request per line, one response body per line. Allowed types are
//! proxied onto the control channel verbatim; anything else is
//! answered locally with `ok:false` and never reaches the host.

use anyhow::Context;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tether_core::{Channel, ResponseBody};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

/// Request types helpers may proxy to the host.
const ALLOWED: [&str; 6] = [
    "notify",
    "clipboard_set",
    "report_rate_limit",
    "check_agent",
    "get_usage_status",
    "clear_rate_limit",
];

const PROXY_TIMEOUT: Duration = Duration::from_secs(10);

pub struct HelperIpc {
    socket_path: PathBuf,
    listener: UnixListener,
    channel: Arc<Channel>,
}

impl HelperIpc {
    pub fn bind(path: &Path, channel: Arc<Channel>) -> anyhow::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("removing stale socket {}", path.display()))?;
        }
        let listener =
            UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))?;
        info!(path = %path.display(), "helper IPC listening");
        Ok(Self {
            socket_path: path.to_path_buf(),
            listener,
            channel,
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
                    let channel = self.channel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_helper(stream, channel).await {
                            debug!(error = %e, "helper connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "helper IPC accept failed");
                }
            }
        }
    }
}

async fn serve_helper(stream: UnixStream, channel: Arc<Channel>) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let body = handle_line(&line, &channel).await;
        let mut reply = serde_json::to_string(&body)?;
        reply.push('\n');
        write_half.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}

async fn handle_line(line: &str, channel: &Arc<Channel>) -> ResponseBody {
    let parsed: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => return ResponseBody::err(format!("bad request line: {e}")),
    };
    let Some(msg_type) = parsed.get("type").and_then(Value::as_str) else {
        return ResponseBody::err("request missing type");
    };
    if !ALLOWED.contains(&msg_type) {
        return ResponseBody::err(format!("unknown request type: {msg_type}"));
    }
    let payload: Map<String, Value> = parsed
        .get("payload")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    match channel.request(msg_type, payload, PROXY_TIMEOUT).await {
        Ok(body) => body,
        Err(e) => ResponseBody::err(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::codec::{frame_decode, frame_encode, read_frame};
    use tether_core::{Dispatcher, Envelope, Kind};

    /// Host stand-in: answers every control-channel request with ok.
    fn channel_with_ok_peer() -> Arc<Channel> {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let channel = Channel::new(local);
        tokio::spawn({
            let channel = channel.clone();
            async move {
                let _ = channel.run(Arc::new(Dispatcher::new())).await;
            }
        });
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(remote);
            while let Ok(Some(frame)) = read_frame(&mut reader).await {
                let Ok(envelope) = frame_decode(&frame) else {
                    continue;
                };
                if envelope.kind == Kind::Request {
                    let id = envelope.id.unwrap();
                    let reply = Envelope::response(
                        &id,
                        &envelope.msg_type,
                        ResponseBody::ok_with(tether_core::payload! {"echoed" => true}),
                    );
                    let _ = writer.write_all(&frame_encode(&reply).unwrap()).await;
                }
            }
        });
        channel
    }

    async fn round_trip(ipc_path: &Path, line: &str) -> ResponseBody {
        let stream = UnixStream::connect(ipc_path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half
            .write_all(format!("{line}\n").as_bytes())
            .await
            .unwrap();
        let mut lines = BufReader::new(read_half).lines();
        let reply = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    #[tokio::test]
    async fn proxies_allowed_requests() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("helper.sock");
        let ipc = HelperIpc::bind(&path, channel_with_ok_peer()).unwrap();
        tokio::spawn(async move { ipc.run().await });

        let body = round_trip(&path, r#"{"type":"check_agent","payload":{}}"#).await;
        assert!(body.ok);
        assert_eq!(body.data.unwrap()["echoed"], true);
    }

    #[tokio::test]
    async fn unknown_type_is_answered_locally() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("helper.sock");
        let ipc = HelperIpc::bind(&path, channel_with_ok_peer()).unwrap();
        tokio::spawn(async move { ipc.run().await });

        let body = round_trip(&path, r#"{"type":"rm_rf","payload":{}}"#).await;
        assert!(!body.ok);
        assert!(body.error.unwrap().contains("unknown request type"));
    }

    #[tokio::test]
    async fn garbage_line_is_an_error_not_a_hangup() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("helper.sock");
        let ipc = HelperIpc::bind(&path, channel_with_ok_peer()).unwrap();
        tokio::spawn(async move { ipc.run().await });

        let stream = UnixStream::connect(&path).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        write_half.write_all(b"not json\n").await.unwrap();
        let mut lines = BufReader::new(read_half).lines();
        let first: ResponseBody =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(!first.ok);

        // Same connection still serves the next request.
        write_half
            .write_all(b"{\"type\":\"notify\",\"payload\":{\"title\":\"t\"}}\n")
            .await
            .unwrap();
        let second: ResponseBody =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert!(second.ok);
    }
}
