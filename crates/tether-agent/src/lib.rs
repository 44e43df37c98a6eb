//! tether-agent: in-sandbox side of the tether bridge.
//!
//! Maintains the outbound control-channel connection to the host
//! daemon, serves forward and tunnel requests, watches local terminal
//! sessions for stalls, and exposes a line-JSON helper socket for
//! in-sandbox scripts.

pub mod config;
pub mod connector;
pub mod handlers;
pub mod ipc;
pub mod monitor;
pub mod stall;
pub mod tmux;
pub mod worktree;

pub use config::AgentConfig;
pub use connector::{Backoff, Connector};
pub use ipc::HelperIpc;
pub use monitor::{MonitorConfig, SessionMonitor};
pub use stall::{StallState, StallTracker};
pub use tmux::{Capture, SessionSource, TmuxSource};
