//! Host-side control-channel handlers.
//!
//! One dispatcher is built per connection. Every handler runs on the
//! protocol loop and uses the async-native path throughout — a forward
//! created from inside a `port_add` handler must never round-trip
//! through a blocking wrapper on the loop thread.

use crate::events::HostEvents;
use crate::policy::PolicyEnforcer;
use crate::registry::{Connection, SessionMeta};
use crate::usage::UsageTracker;
use serde_json::Value;
use std::sync::Arc;
use tether_core::envelope::now_secs;
use tether_core::{payload, Dispatcher, ForwardDirection, ForwardSpec, ResponseBody};
use tracing::{debug, warn};

pub fn build_dispatcher(
    conn: Arc<Connection>,
    policy: Arc<PolicyEnforcer>,
    usage: Arc<UsageTracker>,
    events: Arc<dyn HostEvents>,
) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();

    // Diagnostic round-trip.
    dispatcher.on_request("echo", |payload| async move { ResponseBody::ok_with(payload) });

    // ── Dynamic forwards ─────────────────────────────────────────────
    {
        let conn = conn.clone();
        dispatcher.on_request("port_add", move |payload| {
            let conn = conn.clone();
            async move {
                let spec: ForwardSpec =
                    match serde_json::from_value(Value::Object(payload)) {
                        Ok(spec) => spec,
                        Err(e) => return ResponseBody::err(format!("bad port_add payload: {e}")),
                    };
                if let Err(e) = spec.check_unprivileged() {
                    return ResponseBody::err(e.to_string());
                }
                if spec.direction != ForwardDirection::Remote {
                    return ResponseBody::err(
                        "local forwards are installed on the agent side",
                    );
                }
                match conn.forwards.add(spec, conn.channel.clone()).await {
                    Ok(()) => ResponseBody::ok(),
                    Err(e) => ResponseBody::err(e.to_string()),
                }
            }
        });
    }
    {
        let conn = conn.clone();
        dispatcher.on_request("port_remove", move |payload| {
            let conn = conn.clone();
            async move {
                let Some(host_port) = payload.get("host_port").and_then(Value::as_u64) else {
                    return ResponseBody::err("port_remove missing host_port");
                };
                match conn.forwards.remove(host_port as u16).await {
                    Some(spec) => {
                        // Let the peer drop its own bookkeeping.
                        let event = payload! {"host_port" => spec.host_port, "name" => spec.name};
                        if let Err(e) = conn.channel.send_event("forward_removed", event).await {
                            warn!(error = %e, "could not emit forward_removed");
                        }
                        ResponseBody::ok()
                    }
                    None => ResponseBody::err(format!("no forward for host port {host_port}")),
                }
            }
        });
    }

    {
        let conn = conn.clone();
        dispatcher.on_event("forward_removed", move |payload| {
            let conn = conn.clone();
            async move {
                let Some(host_port) = payload.get("host_port").and_then(Value::as_u64) else {
                    return;
                };
                if conn.peer_forwards.forget(host_port as u16).is_some() {
                    debug!(identity = %conn.identity, host_port, "agent dropped a forward");
                }
            }
        });
    }

    // ── Tunnel streams ───────────────────────────────────────────────
    {
        let conn = conn.clone();
        let policy = policy.clone();
        dispatcher.on_request("tunnel_open", move |payload| {
            let conn = conn.clone();
            let policy = policy.clone();
            async move {
                conn.mux
                    .handle_open(&payload, policy.as_ref(), conn.channel.clone())
                    .await
            }
        });
    }
    {
        let conn = conn.clone();
        dispatcher.on_event("tunnel_data", move |payload| {
            let conn = conn.clone();
            async move { conn.mux.handle_data(&payload).await }
        });
    }
    {
        let conn = conn.clone();
        dispatcher.on_event("tunnel_close", move |payload| {
            let conn = conn.clone();
            async move { conn.mux.handle_close(&payload).await }
        });
    }

    // ── User-facing requests ─────────────────────────────────────────
    {
        let conn = conn.clone();
        let events = events.clone();
        dispatcher.on_request("notify", move |payload| {
            let conn = conn.clone();
            let events = events.clone();
            async move {
                let title = payload.get("title").and_then(Value::as_str).unwrap_or("");
                let message = payload.get("message").and_then(Value::as_str).unwrap_or("");
                let urgency = payload
                    .get("urgency")
                    .and_then(Value::as_str)
                    .unwrap_or("normal");
                events.notification(&conn.identity, title, message, urgency);
                ResponseBody::ok()
            }
        });
    }
    {
        let conn = conn.clone();
        let events = events.clone();
        dispatcher.on_request("clipboard_set", move |payload| {
            let conn = conn.clone();
            let events = events.clone();
            async move {
                let Some(text) = payload.get("text").and_then(Value::as_str) else {
                    return ResponseBody::err("clipboard_set missing text");
                };
                events.clipboard(&conn.identity, text);
                ResponseBody::ok()
            }
        });
    }

    // ── Usage / rate-limit boundary ──────────────────────────────────
    {
        let conn = conn.clone();
        let usage = usage.clone();
        dispatcher.on_request("report_rate_limit", move |payload| {
            let conn = conn.clone();
            let usage = usage.clone();
            async move {
                usage.report(&conn.identity, &payload);
                ResponseBody::ok()
            }
        });
    }
    {
        let conn = conn.clone();
        let usage = usage.clone();
        dispatcher.on_request("check_agent", move |_payload| {
            let conn = conn.clone();
            let usage = usage.clone();
            async move {
                let mut data = conn.describe();
                data.insert("connected".into(), Value::Bool(true));
                data.insert(
                    "rate_limited".into(),
                    Value::Bool(usage.is_limited(&conn.identity)),
                );
                ResponseBody::ok_with(data)
            }
        });
    }
    {
        let conn = conn.clone();
        let usage = usage.clone();
        dispatcher.on_request("get_usage_status", move |_payload| {
            let conn = conn.clone();
            let usage = usage.clone();
            async move { ResponseBody::ok_with(usage.status(&conn.identity)) }
        });
    }
    {
        let conn = conn.clone();
        let usage = usage.clone();
        dispatcher.on_request("clear_rate_limit", move |_payload| {
            let conn = conn.clone();
            let usage = usage.clone();
            async move {
                usage.clear(&conn.identity);
                ResponseBody::ok()
            }
        });
    }

    // ── Session telemetry events ─────────────────────────────────────
    {
        let conn = conn.clone();
        let events = events.clone();
        dispatcher.on_event("stream_register", move |payload| {
            let conn = conn.clone();
            let events = events.clone();
            async move {
                if let Some(session) = payload.get("session").and_then(Value::as_str) {
                    conn.update_session(session, SessionMeta::default());
                    events.stream_registered(&conn.identity, session);
                }
            }
        });
    }
    {
        let conn = conn.clone();
        let events = events.clone();
        dispatcher.on_event("stream_unregister", move |payload| {
            let conn = conn.clone();
            let events = events.clone();
            async move {
                if let Some(session) = payload.get("session").and_then(Value::as_str) {
                    conn.drop_session(session);
                    events.stream_unregistered(&conn.identity, session);
                }
            }
        });
    }
    {
        let conn = conn.clone();
        let events = events.clone();
        dispatcher.on_event("stream_data", move |payload| {
            let conn = conn.clone();
            let events = events.clone();
            async move {
                let Some(session) = payload.get("session").and_then(Value::as_str) else {
                    return;
                };
                let meta = SessionMeta {
                    cursor_x: payload.get("cursor_x").and_then(Value::as_u64).unwrap_or(0),
                    cursor_y: payload.get("cursor_y").and_then(Value::as_u64).unwrap_or(0),
                    last_data_ts: now_secs(),
                };
                conn.update_session(session, meta);
                let buffer = payload.get("buffer").and_then(Value::as_str).unwrap_or("");
                events.stream_data(&conn.identity, session, buffer);
            }
        });
    }
    {
        let conn = conn.clone();
        let events = events.clone();
        dispatcher.on_event("session_resumed", move |payload| {
            let conn = conn.clone();
            let events = events.clone();
            async move {
                if let Some(session) = payload.get("session").and_then(Value::as_str) {
                    events.session_resumed(&conn.identity, session);
                }
            }
        });
    }
    {
        let conn = conn.clone();
        let events = events.clone();
        dispatcher.on_event("state_update", move |payload| {
            let conn = conn.clone();
            let events = events.clone();
            async move {
                let hash = payload.get("hash").and_then(Value::as_str).unwrap_or("");
                conn.record_state(hash, now_secs());
                events.state_updated(&conn.identity, hash, &payload);
            }
        });
    }

    dispatcher
}
