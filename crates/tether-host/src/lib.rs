//! tether-host: host-side daemon for the tether host↔sandbox bridge.
//!
//! Listens on a Unix control socket for sandbox agents, tracks one
//! connection per identity, enforces forward policy, and surfaces
//! agent-originated notifications, clipboard writes, and session
//! telemetry through the [`events::HostEvents`] hook trait.

pub mod config;
pub mod events;
pub mod handlers;
pub mod listener;
pub mod policy;
pub mod registry;
pub mod usage;

pub use config::HostConfig;
pub use events::{HostEvents, LogEvents};
pub use listener::ControlListener;
pub use policy::{ForwardPolicy, PolicyEnforcer};
pub use registry::{Connection, ConnectionRegistry};
pub use usage::UsageTracker;
