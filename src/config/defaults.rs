//! Built-in setting values.

use std::env;
use std::path::PathBuf;

pub const DEFAULT_BACKEND: &str = "dummy";
pub const DEFAULT_REMOTE_WORKER: &str = "sunstone-worker";
pub const DEFAULT_REMOTE_BASE: &str = "sunstone_runs";
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_COMMAND_TIMEOUT_SECONDS: u64 = 120;
pub const DEFAULT_STREAM_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MONITOR_WINDOW: usize = 200;

/// `~/.local/share/sunstone`, or `./.sunstone` without a home directory.
pub fn default_data_dir() -> PathBuf {
    match env::var_os("HOME").filter(|h| !h.is_empty()) {
        Some(home) => PathBuf::from(home).join(".local").join("share").join("sunstone"),
        None => PathBuf::from(".sunstone"),
    }
}
