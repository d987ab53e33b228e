//! # jobline-relay
//!
//! The live half of the relay:
//!
//! - **Bridge**: one upstream realtime-voice connection per owned session
//! - **Registry**: which sessions this instance owns and runs bridges for
//! - **Broadcaster**: full-snapshot fan-out to local and remote observers
//! - **Tools / catalog**: the assistant's job-search tools and their HTTP collaborator
//! - **Controls**: manual browser actions applied straight to session state
//! - **Relay**: the per-instance facade the HTTP layer drives

#![deny(unsafe_code)]

pub mod bridge;
pub mod broadcast;
pub mod catalog;
pub mod connection;
pub mod control;
pub mod errors;
pub mod hub;
pub mod registry;
pub mod relay;
pub mod tools;
pub mod upstream;

pub use bridge::{run_bridge, BridgeCommand, BridgeContext, BridgeExit};
pub use broadcast::StateBroadcaster;
pub use catalog::{CareersCatalog, JobCatalog, SearchPage};
pub use connection::{ClientConnection, CloseRequest};
pub use control::ManualControl;
pub use errors::{CatalogError, UpstreamError};
pub use hub::ConnectionHub;
pub use registry::{BridgeRegistry, Role};
pub use relay::Relay;
pub use upstream::UpstreamConfig;
