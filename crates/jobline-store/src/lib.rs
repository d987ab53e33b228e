//! # jobline-store
//!
//! Durable, shared coordination state for the relay:
//!
//! - [`SessionStore`]: versioned, TTL'd session records plus the active-session index
//! - [`OwnershipLease`]: which instance may run a session's upstream bridge
//! - [`Sweeper`]: periodic cleanup of lapsed sessions, index entries and leases
//!
//! All three sit on top of a pluggable [`Backend`] (in-memory, SQLite or Redis).

#![deny(unsafe_code)]

pub mod backend;
pub mod errors;
pub mod lease;
pub mod session_store;
pub mod sweeper;

pub use backend::{open_backend, Backend, BackendOptions, FeedMessage};
pub use errors::{Result, StoreError};
pub use lease::{run_renewal, LeaseRecord, OwnershipLease, RenewalOutcome};
pub use session_store::{MutationOutcome, SessionStore, SessionSummary};
pub use sweeper::{SweepReport, Sweeper};
