//! # huddle-settings
//!
//! Layered configuration for the huddle real-time server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`HuddleSettings::default()`]
//! 2. **Settings file**: `~/.huddle/settings.json` or an explicit path,
//!    deep-merged over defaults
//! 3. **Environment variables**: `HUDDLE_*` overrides (highest priority)
//!
//! There is no global instance. The daemon loads a [`HuddleSettings`] once
//! and hands the relevant sections to the hub, the push hub, and the server.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
