//! Settings
//!
//! Resolved from four layers, later layers winning:
//! 1. Built-in defaults
//! 2. TOML file (`--config` or `$SUNSTONE_CONFIG`)
//! 3. `SUNSTONE_*` environment variables
//! 4. CLI flags

pub mod defaults;
mod merge;
mod settings;

pub use merge::{deep_merge, merge_layers, MergeConflict};
pub use settings::{
    ConfigError, LoadedSettings, MonitorSettings, RetrySettings, Settings, SettingsOrigin,
    SettingsSource, StreamSettings, ALLOW_LOCAL_ENV, CONFIG_ENV, DATA_DIR_ENV,
    DEFAULT_BACKEND_ENV, WORKER_EXECUTABLE_ENV,
};
