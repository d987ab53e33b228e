//! # jobline-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`JoblineSettings::default()`]
//! 2. **Settings file**: JSON, deep-merged over defaults
//! 3. **Environment variables**: highest priority
//!
//! The merged result is validated before it is returned, so every consumer
//! can rely on the cross-field constraints (lease renewal shorter than the
//! lease TTL, bounded broadcast staleness).

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path};
pub use types::*;
