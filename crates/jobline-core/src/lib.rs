//! # jobline-core
//!
//! Shared vocabulary for the jobline relay:
//!
//! - **Branded IDs**: `SessionId`, `InstanceId`, `ConnectionId`
//! - **Session model**: the versioned `Session` record and the `Mutation` entry point
//! - **Snapshots**: full-state `StateSnapshot` broadcast to browser observers
//! - **Protocol**: browser-facing inbound/outbound message envelopes
//! - **Errors**: `RelayError` taxonomy with machine-readable codes
//! - **Reconnect**: backoff math and the client connection state machine

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod protocol;
pub mod reconnect;
pub mod retry;
pub mod session;
pub mod snapshot;

pub use errors::RelayError;
pub use ids::{ConnectionId, InstanceId, SessionId};
pub use session::{Mutation, Session, VersionedSession};
pub use snapshot::StateSnapshot;
