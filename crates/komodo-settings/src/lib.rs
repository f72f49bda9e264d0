//! # komodo-settings
//!
//! Layered configuration for the Komodo relay.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`RelaySettings::default()`]
//! 2. **Settings file**: `~/.komodo/settings.json` or an explicit path (deep-merged over defaults)
//! 3. **Environment variables**: `KOMODO_*` overrides (highest priority)
//!
//! Command-line flags are applied by the binary after loading.

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
