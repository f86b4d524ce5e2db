//! # huddle-server
//!
//! Real-time fan-out for huddle: live WebSocket connections and the HTTP
//! surface around them.
//!
//! - [`websocket::Hub`]: connection registry, visibility-filtered broadcast
//! - [`websocket::WebConn`]: per-connection queue, session cache, lifecycle
//! - Socket pumps in evented or blocking mode, selected per platform and TLS
//! - Axum routes: `/health`, `/metrics`, `/api/v4/websocket`, push acks
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use server::{AppState, HuddleServer};
pub use shutdown::ShutdownCoordinator;
