//! Session monitor: buffer diffing, stall detection, state push.
//!
//! One task drives four cadences over a single session map
//! (single-writer, no locks):
//!
//! - session sync: discover new/vanished sessions
//! - buffer diff: recapture panes, emit `stream_data` on change
//! - stall check: drive the per-session [`StallTracker`]s
//! - state push: `state_update` event with a content hash, sent every
//!   period whether or not anything changed, so the host's view can
//!   never go stale silently

use crate::stall::StallTracker;
use crate::tmux::{Capture, SessionSource};
use crate::worktree;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::{payload, Channel};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub stall_enabled: bool,
    pub stall_threshold: Duration,
    pub stall_check_interval: Duration,
    pub sync_interval: Duration,
    pub state_interval: Duration,
    pub diff_interval: Duration,
    pub worktree_root: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            stall_enabled: true,
            stall_threshold: Duration::from_secs(30),
            stall_check_interval: Duration::from_secs(5),
            sync_interval: Duration::from_secs(5),
            state_interval: Duration::from_secs(10),
            diff_interval: Duration::from_millis(100),
            worktree_root: PathBuf::from("."),
        }
    }
}

struct MonitoredSession {
    last_capture: Capture,
    stall: StallTracker,
}

pub struct SessionMonitor<S> {
    source: S,
    channel: Arc<Channel>,
    config: MonitorConfig,
}

impl<S: SessionSource> SessionMonitor<S> {
    pub fn new(source: S, channel: Arc<Channel>, config: MonitorConfig) -> Self {
        Self {
            source,
            channel,
            config,
        }
    }

    /// Run until the channel closes.
    pub async fn run(self) {
        let mut sessions: HashMap<String, MonitoredSession> = HashMap::new();
        let mut sync_tick = tokio::time::interval(self.config.sync_interval);
        let mut state_tick = tokio::time::interval(self.config.state_interval);
        let mut stall_tick = tokio::time::interval(self.config.stall_check_interval);
        let mut diff_tick = tokio::time::interval(self.config.diff_interval);

        loop {
            if self.channel.is_closed() {
                debug!("channel closed, session monitor stopping");
                return;
            }
            tokio::select! {
                _ = sync_tick.tick() => self.sync_sessions(&mut sessions).await,
                _ = diff_tick.tick() => self.diff_buffers(&mut sessions).await,
                _ = stall_tick.tick(), if self.config.stall_enabled => {
                    self.check_stalls(&mut sessions).await;
                }
                _ = state_tick.tick() => self.push_state(&sessions).await,
            }
        }
    }

    /// Reconcile the session map against what the source reports now.
    async fn sync_sessions(&self, sessions: &mut HashMap<String, MonitoredSession>) {
        let live = match self.source.list_sessions().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "session listing failed");
                return;
            }
        };

        for name in &live {
            if sessions.contains_key(name) {
                continue;
            }
            let capture = match self.source.capture(name).await {
                Ok(c) => c,
                Err(e) => {
                    debug!(session = %name, error = %e, "initial capture failed");
                    continue;
                }
            };
            info!(session = %name, "session registered");
            if let Err(e) = self
                .channel
                .send_event("stream_register", payload! {"session" => name.as_str()})
                .await
            {
                debug!(session = %name, error = %e, "stream_register push failed");
            }
            if let Err(e) = self
                .channel
                .send_event("stream_data", stream_data_payload(name, &capture))
                .await
            {
                debug!(session = %name, error = %e, "stream_data push failed");
            }
            sessions.insert(
                name.clone(),
                MonitoredSession {
                    last_capture: capture,
                    stall: StallTracker::new(Instant::now()),
                },
            );
        }

        let vanished: Vec<String> = sessions
            .keys()
            .filter(|name| !live.contains(name))
            .cloned()
            .collect();
        for name in vanished {
            info!(session = %name, "session vanished");
            sessions.remove(&name);
            if let Err(e) = self
                .channel
                .send_event("stream_unregister", payload! {"session" => name.as_str()})
                .await
            {
                debug!(session = %name, error = %e, "stream_unregister push failed");
            }
        }
    }

    /// Recapture every session; changed buffers become `stream_data`.
    async fn diff_buffers(&self, sessions: &mut HashMap<String, MonitoredSession>) {
        for (name, session) in sessions.iter_mut() {
            let capture = match self.source.capture(name).await {
                // A vanishing session is handled by the next sync pass.
                Err(_) => continue,
                Ok(c) => c,
            };
            if capture == session.last_capture {
                continue;
            }

            session.stall.record_activity(Instant::now());
            if let Err(e) = self
                .channel
                .send_event("stream_data", stream_data_payload(name, &capture))
                .await
            {
                debug!(session = %name, error = %e, "stream_data push failed");
            }
            // Activity always clears pending host-side notifications,
            // stall machinery or not.
            if let Err(e) = self
                .channel
                .send_event("session_resumed", payload! {"session" => name.as_str()})
                .await
            {
                debug!(session = %name, error = %e, "session_resumed push failed");
            }
            session.last_capture = capture;
        }
    }

    /// Advance each session's stall machine; stale ones get notified.
    async fn check_stalls(&self, sessions: &mut HashMap<String, MonitoredSession>) {
        let now = Instant::now();
        for (name, session) in sessions.iter_mut() {
            if !session.stall.check(now, self.config.stall_threshold) {
                continue;
            }
            info!(session = %name, "session stalled, notifying");
            let request = payload! {
                "title" => "agent stalled",
                "message" => format!(
                    "session {} has produced no output for {}s",
                    name,
                    self.config.stall_threshold.as_secs()
                ),
                "urgency" => "normal",
                "session" => name.as_str(),
            };
            // Detached so a slow host cannot block the monitor ticks.
            let channel = self.channel.clone();
            tokio::spawn(async move {
                if let Err(e) = channel
                    .request("notify", request, Duration::from_secs(30))
                    .await
                {
                    warn!(error = %e, "stall notification failed");
                }
            });
        }
    }

    /// Push the full state snapshot, hash included, unconditionally.
    async fn push_state(&self, sessions: &HashMap<String, MonitoredSession>) {
        let worktrees = worktree::list_worktrees(&self.config.worktree_root).await;

        let mut session_meta = Map::new();
        let mut names: Vec<&String> = sessions.keys().collect();
        names.sort();
        for name in names {
            let session = &sessions[name];
            let mut meta = Map::new();
            meta.insert("cursor_x".into(), session.last_capture.cursor_x.into());
            meta.insert("cursor_y".into(), session.last_capture.cursor_y.into());
            session_meta.insert(name.clone(), Value::Object(meta));
        }
        let worktrees = serde_json::to_value(&worktrees).unwrap_or(Value::Array(Vec::new()));

        let mut hasher = Sha256::new();
        hasher.update(worktrees.to_string().as_bytes());
        hasher.update(Value::Object(session_meta.clone()).to_string().as_bytes());
        let hash = hex::encode(hasher.finalize());

        let event = payload! {
            "hash" => hash,
            "worktrees" => worktrees,
            "sessions" => Value::Object(session_meta),
        };
        if let Err(e) = self.channel.send_event("state_update", event).await {
            debug!(error = %e, "state push failed");
        }
    }
}

fn stream_data_payload(name: &str, capture: &Capture) -> Map<String, Value> {
    payload! {
        "session" => name,
        "buffer" => capture.buffer.as_str(),
        "cursor_x" => capture.cursor_x,
        "cursor_y" => capture.cursor_y,
    }
}
