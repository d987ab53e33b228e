//! Browser control sockets: session lifecycle and heartbeat.

pub mod heartbeat;
pub mod session;

pub use heartbeat::{run_heartbeat, HeartbeatResult};
pub use session::{run_ws_session, SocketConfig};
