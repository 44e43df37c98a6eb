//! Sandbox-side control-channel handlers.
//!
//! Mirror image of the host dispatcher: the agent accepts `local`
//! forwards (it owns the in-sandbox listener), restricts inbound tunnel
//! dials to loopback, and turns `stream_input` into tmux keystrokes.

use crate::tmux;
use serde_json::{Map, Value};
use std::sync::Arc;
use tether_core::{
    payload, Channel, Dispatcher, ForwardDirection, ForwardService, ForwardSpec, LoopbackOnly,
    PeerForwards, ResponseBody, TunnelMux,
};
use tracing::{debug, warn};

pub fn build_dispatcher(
    channel: Arc<Channel>,
    forwards: Arc<ForwardService>,
    mux: Arc<TunnelMux>,
    peer: Arc<PeerForwards>,
) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();

    dispatcher.on_request("echo", |payload| async move { ResponseBody::ok_with(payload) });

    {
        let channel = channel.clone();
        let forwards = forwards.clone();
        dispatcher.on_request("port_add", move |payload| {
            let channel = channel.clone();
            let forwards = forwards.clone();
            async move {
                let spec: ForwardSpec =
                    match serde_json::from_value(Value::Object(payload)) {
                        Ok(spec) => spec,
                        Err(e) => return ResponseBody::err(format!("bad port_add payload: {e}")),
                    };
                if let Err(e) = spec.check_unprivileged() {
                    return ResponseBody::err(e.to_string());
                }
                if spec.direction != ForwardDirection::Local {
                    return ResponseBody::err("remote forwards are installed on the host side");
                }
                match forwards.add(spec, channel).await {
                    Ok(()) => ResponseBody::ok(),
                    Err(e) => ResponseBody::err(e.to_string()),
                }
            }
        });
    }
    {
        let channel = channel.clone();
        let forwards = forwards.clone();
        dispatcher.on_request("port_remove", move |payload| {
            let channel = channel.clone();
            let forwards = forwards.clone();
            async move {
                let Some(host_port) = payload.get("host_port").and_then(Value::as_u64) else {
                    return ResponseBody::err("port_remove missing host_port");
                };
                match forwards.remove(host_port as u16).await {
                    Some(spec) => {
                        let event = payload! {"host_port" => spec.host_port, "name" => spec.name};
                        if let Err(e) = channel.send_event("forward_removed", event).await {
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
        // The host removed one of our negotiated remote forwards.
        dispatcher.on_event("forward_removed", move |payload| {
            let peer = peer.clone();
            async move {
                let Some(host_port) = payload.get("host_port").and_then(Value::as_u64) else {
                    return;
                };
                if peer.forget(host_port as u16).is_some() {
                    debug!(host_port, "host dropped a negotiated forward");
                }
            }
        });
    }

    {
        let channel = channel.clone();
        let mux = mux.clone();
        dispatcher.on_request("tunnel_open", move |payload| {
            let channel = channel.clone();
            let mux = mux.clone();
            async move { mux.handle_open(&payload, &LoopbackOnly, channel).await }
        });
    }
    {
        let mux = mux.clone();
        dispatcher.on_event("tunnel_data", move |payload| {
            let mux = mux.clone();
            async move { mux.handle_data(&payload).await }
        });
    }
    {
        let mux = mux.clone();
        dispatcher.on_event("tunnel_close", move |payload| {
            let mux = mux.clone();
            async move { mux.handle_close(&payload).await }
        });
    }

    dispatcher.on_request("stream_input", |payload: Map<String, Value>| async move {
        let Some(session) = payload.get("session").and_then(Value::as_str) else {
            return ResponseBody::err("stream_input missing session");
        };
        let Some(text) = payload.get("text").and_then(Value::as_str) else {
            return ResponseBody::err("stream_input missing text");
        };
        match tmux::send_keys(session, text).await {
            Ok(()) => ResponseBody::ok(),
            Err(e) => ResponseBody::err(e.to_string()),
        }
    });

    dispatcher
}
