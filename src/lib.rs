//! Streamgate - single-port gateway for a remote desktop stream
//!
//! Fronts an internal HTTPS UI and WebSocket signaling endpoint behind one
//! listener, and fans a fragmented MP4 capture out to any number of
//! WebSocket viewers.

pub mod activity;
pub mod config;
pub mod http;
pub mod media;
pub mod proxy;
pub mod server;
