//! Dedicated protocol event loop.
//!
//! Each side of the protocol (listener, connector) runs its channel
//! I/O, correlation, and forward setup on one single-threaded tokio
//! runtime, hosted on its own background thread so it never blocks the
//! caller's main thread.
//!
//! External threads interact through [`ProtocolRuntime::block_on`],
//! which schedules the future onto the loop and blocks on the result.
//! Calling it *from* the loop thread would deadlock (the loop cannot
//! run the scheduled work while blocked waiting for it), so the wrapper
//! detects that case and returns [`TetherError::WouldDeadlock`]. Code
//! that already executes inside a loop-dispatched handler must use the
//! async-native path directly.

use crate::error::{TetherError, TetherResult};
use std::future::Future;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tokio::sync::Notify;
use tracing::debug;

pub struct ProtocolRuntime {
    handle: tokio::runtime::Handle,
    loop_thread: ThreadId,
    shutdown: Arc<Notify>,
    thread: Option<thread::JoinHandle<()>>,
}

impl ProtocolRuntime {
    /// Spawn a named loop thread hosting a current-thread tokio runtime.
    pub fn new(name: &str) -> TetherResult<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let shutdown = Arc::new(Notify::new());
        let loop_shutdown = shutdown.clone();

        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(TetherError::Io(e)));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok((runtime.handle().clone(), thread::current().id())));
                runtime.block_on(loop_shutdown.notified());
                debug!("protocol loop stopped");
            })
            .map_err(TetherError::Io)?;

        let (handle, loop_thread) = ready_rx
            .recv()
            .map_err(|_| TetherError::Other("protocol loop thread died during startup".into()))??;

        Ok(Self {
            handle,
            loop_thread,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Schedule a task onto the loop.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    /// Handle to the loop for components that spawn their own tasks.
    pub fn handle(&self) -> tokio::runtime::Handle {
        self.handle.clone()
    }

    /// Run `future` on the loop and block the calling thread on its result.
    ///
    /// Refuses to run from the loop thread itself.
    pub fn block_on<F>(&self, future: F) -> TetherResult<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if thread::current().id() == self.loop_thread {
            return Err(TetherError::WouldDeadlock);
        }

        let (tx, rx) = std::sync::mpsc::channel();
        self.handle.spawn(async move {
            let _ = tx.send(future.await);
        });
        rx.recv()
            .map_err(|_| TetherError::Other("protocol loop stopped".into()))
    }
}

impl Drop for ProtocolRuntime {
    fn drop(&mut self) {
        self.shutdown.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_on_runs_from_external_thread() {
        let rt = ProtocolRuntime::new("test-loop").unwrap();
        let value = rt.block_on(async { 41 + 1 }).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn block_on_refuses_loop_thread() {
        let rt = Arc::new(ProtocolRuntime::new("test-loop").unwrap());
        let inner = rt.clone();
        let result = rt
            .block_on(async move {
                // We are now on the loop thread; nesting must be refused.
                matches!(inner.block_on(async {}), Err(TetherError::WouldDeadlock))
            })
            .unwrap();
        assert!(result);
    }

    #[test]
    fn spawned_tasks_run() {
        let rt = ProtocolRuntime::new("test-loop").unwrap();
        let handle = rt.spawn(async { "done" });
        assert_eq!(rt.block_on(async move { handle.await.unwrap() }).unwrap(), "done");
    }
}
