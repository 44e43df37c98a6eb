//! tether-core: Shared protocol library for the tether host↔sandbox bridge.
//!
//! Provides the JSON message envelope, length-prefixed framing, the
//! framed control channel with request/response correlation, the
//! handler dispatcher, port-forward/tunnel plumbing, and the dedicated
//! protocol event loop.

pub mod channel;
pub mod codec;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod forward;
pub mod runtime;
pub mod tunnel;

// Re-export commonly used items at crate root.
pub use channel::Channel;
pub use codec::{frame_decode, frame_encode, MAX_FRAME_BYTES};
pub use dispatch::Dispatcher;
pub use envelope::{Envelope, Kind, ResponseBody};
pub use error::{TetherError, TetherResult};
pub use forward::{ForwardDirection, ForwardRole, ForwardService, ForwardSpec, PeerForwards};
pub use runtime::ProtocolRuntime;
pub use tunnel::{DialGuard, LoopbackOnly, TunnelMux};

/// Protocol version string exchanged in the hello handshake.
pub const PROTOCOL_VERSION: &str = "tether-v1";
