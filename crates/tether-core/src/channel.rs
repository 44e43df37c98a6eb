//! Framed control channel with request/response correlation.
//!
//! A [`Channel`] wraps one byte stream (Unix socket in production,
//! `tokio::io::duplex` in tests) and multiplexes three primitives over
//! it: `request` (correlated, awaited), `respond`, and `send_event`
//! (fire-and-forget). Writes are serialized under a per-channel lock so
//! concurrent senders never interleave partial frames.
//!
//! Closing a channel cancels every outstanding request immediately —
//! waiters observe [`TetherError::Closed`], they are never left to time
//! out naturally.

use crate::codec::{frame_decode, frame_encode, read_frame};
use crate::dispatch::Dispatcher;
use crate::envelope::{Envelope, Kind, ResponseBody};
use crate::error::{TetherError, TetherResult};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One end of the control channel.
pub struct Channel {
    writer: Mutex<BoxWriter>,
    /// Taken exactly once by [`Channel::run`].
    reader: Mutex<Option<BoxReader>>,
    /// Correlation-id keyed waiters for in-flight requests.
    pending: Mutex<HashMap<String, oneshot::Sender<ResponseBody>>>,
    closed: AtomicBool,
}

impl Channel {
    /// Wrap a bidirectional byte stream.
    pub fn new<S>(stream: S) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Arc::new(Self {
            writer: Mutex::new(Box::new(write_half)),
            reader: Mutex::new(Some(Box::new(read_half))),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Serialize and write one envelope under the write lock.
    pub async fn send(&self, envelope: &Envelope) -> TetherResult<()> {
        if self.is_closed() {
            return Err(TetherError::Closed);
        }
        let frame = frame_encode(envelope)?;
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| TetherError::Transport(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TetherError::Transport(e.to_string()))
    }

    /// Send a request and await its response or the deadline.
    ///
    /// There is no default timeout — a caller that cannot name one has a
    /// bug, not a use case. On timeout the pending entry is removed and
    /// the request is not retried.
    pub async fn request(
        &self,
        msg_type: &str,
        payload: Map<String, Value>,
        timeout: Duration,
    ) -> TetherResult<ResponseBody> {
        let envelope = Envelope::request(msg_type, payload);
        let id = envelope.id.clone().expect("request envelope carries an id");

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if self.is_closed() {
                return Err(TetherError::Closed);
            }
            pending.insert(id.clone(), tx);
        }

        if let Err(e) = self.send(&envelope).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(body)) => Ok(body),
            // Sender dropped: the channel was closed with this request in flight.
            Ok(Err(_)) => Err(TetherError::Closed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(TetherError::Timeout)
            }
        }
    }

    /// Send the response to a received request.
    pub async fn respond(&self, id: &str, msg_type: &str, body: ResponseBody) -> TetherResult<()> {
        self.send(&Envelope::response(id, msg_type, body)).await
    }

    /// Send a fire-and-forget event.
    pub async fn send_event(&self, msg_type: &str, payload: Map<String, Value>) -> TetherResult<()> {
        self.send(&Envelope::event(msg_type, payload)).await
    }

    /// Resolve the pending request matching this response envelope.
    ///
    /// Returns `false` when no waiter exists (late or unexpected
    /// response) — the caller should only log it.
    pub async fn handle_response(&self, envelope: &Envelope) -> bool {
        let Some(id) = envelope.id.as_deref() else {
            return false;
        };
        let waiter = self.pending.lock().await.remove(id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(ResponseBody::from_payload(&envelope.payload));
                true
            }
            None => false,
        }
    }

    /// Mark the channel closed and cancel all outstanding requests.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut pending = self.pending.lock().await;
        let cancelled = pending.len();
        pending.clear();
        if cancelled > 0 {
            debug!(cancelled, "channel closed with requests in flight");
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// The control-channel read loop. Runs until EOF, transport error,
    /// or task cancellation; always closes the channel on the way out so
    /// pending requests are cancelled rather than left hanging.
    pub async fn run(self: &Arc<Self>, dispatcher: Arc<Dispatcher>) -> TetherResult<()> {
        let mut reader = self
            .reader
            .lock()
            .await
            .take()
            .ok_or_else(|| TetherError::Other("read loop already running".into()))?;

        let result = loop {
            let body = match read_frame(&mut reader).await {
                Ok(Some(body)) => body,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            // A frame that fails to decode is dropped, the channel
            // survives. Only transport-level faults tear it down.
            let envelope = match frame_decode(&body) {
                Ok(env) => env,
                Err(e) => {
                    warn!(error = %e, "dropping undecodable frame");
                    continue;
                }
            };

            match envelope.kind {
                Kind::Response => {
                    if !self.handle_response(&envelope).await {
                        warn!(
                            msg_type = %envelope.msg_type,
                            id = envelope.id.as_deref().unwrap_or(""),
                            "unexpected response"
                        );
                    }
                }
                Kind::Request => {
                    let Some(id) = envelope.id.clone() else {
                        warn!(msg_type = %envelope.msg_type, "request without id");
                        continue;
                    };
                    let body = dispatcher
                        .dispatch_request(&envelope.msg_type, envelope.payload)
                        .await;
                    if let Err(e) = self.respond(&id, &envelope.msg_type, body).await {
                        break Err(e);
                    }
                }
                Kind::Event => {
                    dispatcher
                        .dispatch_event(&envelope.msg_type, envelope.payload)
                        .await;
                }
            }
        };

        self.close().await;
        result
    }
}
