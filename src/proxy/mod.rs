//! Forwarding to the internal backend
//!
//! - **`upstream`**: stateless per-request HTTP forwarding
//! - **`signaling`**: per-session duplex WebSocket relay

pub mod signaling;
pub mod upstream;

pub use signaling::{SessionEnd, SignalingProxy};
pub use upstream::ProxyHandler;
