//! # jobline-server
//!
//! Axum HTTP + `WebSocket` surface of one relay instance.
//!
//! - `POST /api/session`, `GET /api/sessions`: session bootstrap and switcher
//! - `GET /realtime?sid=`: the browser control socket
//! - `GET /health`, `GET /metrics`: operational endpoints
//! - Heartbeat ping/pong and graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod api;
pub mod health;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use server::{AppState, JoblineServer};
pub use shutdown::ShutdownCoordinator;
