//! Request/event handler registry.
//!
//! Handlers are keyed by the envelope's wire `type` string. Request
//! handlers return a [`ResponseBody`] — errors travel as `ok:false`,
//! never as exceptions across the dispatch boundary. The dispatcher
//! still catches panics defensively (handler authors will not always
//! comply) and converts them to the same shape, so one misbehaving
//! handler can never take the read loop down.

use crate::envelope::ResponseBody;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

type RequestFn =
    Arc<dyn Fn(Map<String, Value>) -> BoxFuture<'static, ResponseBody> + Send + Sync>;
type EventFn = Arc<dyn Fn(Map<String, Value>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Maps wire `type` strings to handlers for one side of a channel.
#[derive(Default)]
pub struct Dispatcher {
    requests: HashMap<String, RequestFn>,
    events: HashMap<String, EventFn>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request handler for `msg_type`.
    pub fn on_request<F, Fut>(&mut self, msg_type: &str, handler: F) -> &mut Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ResponseBody> + Send + 'static,
    {
        self.requests
            .insert(msg_type.to_string(), Arc::new(move |p| handler(p).boxed()));
        self
    }

    /// Register an event handler for `msg_type`.
    pub fn on_event<F, Fut>(&mut self, msg_type: &str, handler: F) -> &mut Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.events
            .insert(msg_type.to_string(), Arc::new(move |p| handler(p).boxed()));
        self
    }

    /// Run the request handler for `msg_type`, producing exactly one response body.
    pub async fn dispatch_request(
        &self,
        msg_type: &str,
        payload: Map<String, Value>,
    ) -> ResponseBody {
        let Some(handler) = self.requests.get(msg_type) else {
            debug!(msg_type, "no handler for request type");
            return ResponseBody::err(format!("unknown request type: {msg_type}"));
        };

        match AssertUnwindSafe(handler(payload)).catch_unwind().await {
            Ok(body) => body,
            Err(panic) => {
                let message = panic_message(&panic);
                warn!(msg_type, message, "request handler panicked");
                ResponseBody::err(format!("handler panicked: {message}"))
            }
        }
    }

    /// Run the event handler for `msg_type`, if any. Events get no response.
    pub async fn dispatch_event(&self, msg_type: &str, payload: Map<String, Value>) {
        let Some(handler) = self.events.get(msg_type) else {
            debug!(msg_type, "no handler for event type");
            return;
        };

        if let Err(panic) = AssertUnwindSafe(handler(payload)).catch_unwind().await {
            warn!(msg_type, message = panic_message(&panic), "event handler panicked");
        }
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload;

    #[tokio::test]
    async fn unknown_request_type_is_err_without_handler() {
        let dispatcher = Dispatcher::new();
        let body = dispatcher.dispatch_request("nope", Map::new()).await;
        assert!(!body.ok);
        assert!(body.error.unwrap().contains("unknown request type"));
    }

    #[tokio::test]
    async fn handler_result_passes_through() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.on_request("echo", |payload| async move {
            ResponseBody::ok_with(payload)
        });

        let body = dispatcher
            .dispatch_request("echo", payload! {"x" => 1})
            .await;
        assert!(body.ok);
        assert_eq!(body.data.unwrap()["x"], 1);
    }

    #[tokio::test]
    async fn panicking_handler_becomes_err_response() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.on_request("boom", |_| async move {
            panic!("kaboom");
            #[allow(unreachable_code)]
            ResponseBody::ok()
        });

        let body = dispatcher.dispatch_request("boom", Map::new()).await;
        assert!(!body.ok);
        assert!(body.error.unwrap().contains("kaboom"));
    }

    #[tokio::test]
    async fn event_panic_is_swallowed() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.on_event("tick", |_| async move { panic!("tock") });
        // Must not propagate.
        dispatcher.dispatch_event("tick", Map::new()).await;
        dispatcher.dispatch_event("unregistered", Map::new()).await;
    }
}
