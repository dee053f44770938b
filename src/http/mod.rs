//! HTTP protocol implementation.
//!
//! A small HTTP/1.1 server with keep-alive support that fronts every
//! endpoint on a single port.
//!
//! # Architecture
//!
//! - **`connection`**: per-client request/response state machine, including
//!   the hand-off of upgraded connections to WebSocket handlers
//! - **`parser`**: parses incoming HTTP requests from byte buffers
//! - **`request`**: HTTP request representation
//! - **`response`**: HTTP response representation with builder pattern
//! - **`headers`**: ordered header list and proxy header sanitization
//! - **`writer`**: serializes and writes HTTP responses to the client
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │   Reading   │ ← Wait for incoming request data
//!        └──────┬──────┘
//!               │ Request received
//!               ▼
//!        ┌──────────────────┐
//!        │   Processing     │ ← Route: local, proxied, or upgrade
//!        └──────┬───────┬───┘
//!               │       └──────────────┐
//!               ▼                      ▼
//!        ┌──────────────────┐   ┌──────────────┐
//!        │    Writing       │   │  Upgrading   │ → WebSocket handler
//!        └──────┬───────────┘   └──────────────┘
//!               │ Response sent
//!               ├─ Keep-Alive → Reading (same connection)
//!               └─ Close → Closed
//! ```

pub mod connection;
pub mod headers;
pub mod parser;
pub mod request;
pub mod response;
pub mod writer;
