//! # keyrelay-settings
//!
//! Configuration with layered sources (in priority order, lowest first):
//! 1. **Compiled defaults**: [`KeyRelaySettings::default()`]
//! 2. **Settings file**: `~/.keyrelay/settings.json` or an explicit path,
//!    deep-merged over defaults
//! 3. **Environment variables**: `KEYRELAY_*` overrides
//!
//! Command-line flags are applied by the binary on top of all three.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
