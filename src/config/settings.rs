//! Resolved settings with provenance.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::defaults::*;
use super::merge::{merge_layers, MergeConflict};

pub const CONFIG_ENV: &str = "SUNSTONE_CONFIG";
pub const DATA_DIR_ENV: &str = "SUNSTONE_DATA_DIR";
pub const ALLOW_LOCAL_ENV: &str = "SUNSTONE_ALLOW_LOCAL_EXECUTION";
pub const DEFAULT_BACKEND_ENV: &str = "SUNSTONE_DEFAULT_BACKEND";
pub const WORKER_EXECUTABLE_ENV: &str = "SUNSTONE_WORKER_EXECUTABLE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },

    #[error("invalid settings: {0}")]
    Invalid(String),

    #[error("conflicting {origin:?} settings layer: {conflict}")]
    Conflict {
        origin: SettingsOrigin,
        #[source]
        conflict: MergeConflict,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    pub interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub interval_ms: u64,
    pub window: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Root of `projects/` and `runs/`.
    pub data_dir: PathBuf,
    /// Local process execution is opt-in.
    pub allow_local_execution: bool,
    pub default_backend: String,
    /// Worker binary (or a directory holding one) for local runs.
    pub worker_executable: Option<PathBuf>,
    /// Command used to start the worker on remote hosts.
    pub remote_worker_command: String,
    /// Parent of remote run directories when the target carries no path.
    pub remote_base_dir: String,
    pub command_timeout_seconds: u64,
    /// JSON capability catalog replacing the built-in one.
    pub catalog_file: Option<PathBuf>,
    pub retry: RetrySettings,
    pub stream: StreamSettings,
    pub monitor: MonitorSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            allow_local_execution: false,
            default_backend: DEFAULT_BACKEND.to_string(),
            worker_executable: None,
            remote_worker_command: DEFAULT_REMOTE_WORKER.to_string(),
            remote_base_dir: DEFAULT_REMOTE_BASE.to_string(),
            command_timeout_seconds: DEFAULT_COMMAND_TIMEOUT_SECONDS,
            catalog_file: None,
            retry: RetrySettings {
                max_attempts: DEFAULT_RETRY_ATTEMPTS,
                base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            },
            stream: StreamSettings {
                interval_ms: DEFAULT_STREAM_INTERVAL_MS,
            },
            monitor: MonitorSettings {
                interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
                window: DEFAULT_MONITOR_WINDOW,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingsOrigin {
    Builtin,
    File,
    Env,
    Cli,
}

/// A contributing layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsSource {
    pub origin: SettingsOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// SHA-256 of the raw file bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadedSettings {
    pub settings: Settings,
    pub sources: Vec<SettingsSource>,
}

impl Settings {
    /// Resolve settings from the process environment.
    pub fn load(
        config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<LoadedSettings, ConfigError> {
        Self::load_with_env(config_path, env::vars(), cli_overrides)
    }

    /// Resolve settings: builtin defaults, TOML file, environment, CLI.
    pub fn load_with_env<I>(
        config_path: Option<&Path>,
        vars: I,
        cli_overrides: Option<Value>,
    ) -> Result<LoadedSettings, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .filter(|(k, _)| k.starts_with("SUNSTONE_"))
            .collect();

        let builtin = serde_json::to_value(Settings::default())
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let mut layers = vec![builtin];
        let mut sources = vec![SettingsSource {
            origin: SettingsOrigin::Builtin,
            path: None,
            digest: None,
        }];

        let file = config_path
            .map(Path::to_path_buf)
            .or_else(|| vars.get(CONFIG_ENV).filter(|v| !v.is_empty()).map(PathBuf::from));
        if let Some(path) = file {
            let (value, digest) = load_toml_file(&path)?;
            debug!(path = %path.display(), %digest, "loaded settings file");
            layers.push(value);
            sources.push(SettingsSource {
                origin: SettingsOrigin::File,
                path: Some(path.to_string_lossy().into_owned()),
                digest: Some(digest),
            });
        }

        let env_layer = env_layer(&vars)?;
        if !env_layer.is_empty() {
            layers.push(Value::Object(env_layer));
            sources.push(SettingsSource {
                origin: SettingsOrigin::Env,
                path: None,
                digest: None,
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(SettingsSource {
                origin: SettingsOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let merged = merge_layers(sources.iter().map(|s| s.origin).zip(layers))
            .map_err(|(origin, conflict)| ConfigError::Conflict { origin, conflict })?;
        let settings: Settings =
            serde_json::from_value(merged).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        settings.validate()?;
        Ok(LoadedSettings { settings, sources })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=10).contains(&self.retry.max_attempts) {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be in [1, 10]".to_string(),
            ));
        }
        if self.command_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "command_timeout_seconds must be positive".to_string(),
            ));
        }
        if self.stream.interval_ms == 0 || self.monitor.interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "stream and monitor intervals must be positive".to_string(),
            ));
        }
        if self.monitor.window == 0 {
            return Err(ConfigError::Invalid(
                "monitor.window must be at least 1".to_string(),
            ));
        }
        if self.default_backend.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "default_backend must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    pub fn stream_interval(&self) -> Duration {
        Duration::from_millis(self.stream.interval_ms)
    }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Env {
            var,
            value: value.to_string(),
        }),
    }
}

fn env_layer(vars: &HashMap<String, String>) -> Result<Map<String, Value>, ConfigError> {
    let mut layer = Map::new();
    if let Some(dir) = vars.get(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        layer.insert("data_dir".to_string(), json!(dir));
    }
    if let Some(value) = vars.get(ALLOW_LOCAL_ENV) {
        layer.insert(
            "allow_local_execution".to_string(),
            json!(parse_bool(ALLOW_LOCAL_ENV, value)?),
        );
    }
    if let Some(backend) = vars.get(DEFAULT_BACKEND_ENV).filter(|v| !v.is_empty()) {
        layer.insert("default_backend".to_string(), json!(backend));
    }
    if let Some(exe) = vars.get(WORKER_EXECUTABLE_ENV).filter(|v| !v.is_empty()) {
        layer.insert("worker_executable".to_string(), json!(exe));
    }
    Ok(layer)
}

/// Parse a TOML file into JSON, returning it with the SHA-256 of its bytes.
fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let digest = hex::encode(Sha256::digest(&bytes));

    let parse_error = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };
    let contents =
        String::from_utf8(bytes).map_err(|e| parse_error(format!("invalid UTF-8: {e}")))?;
    let table: toml::Value = toml::from_str(&contents).map_err(|e| parse_error(e.to_string()))?;
    Ok((toml_to_json(table), digest))
}

fn toml_to_json(value: toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::Array(items.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env() -> Vec<(String, String)> {
        Vec::new()
    }

    #[test]
    fn defaults_validate() {
        let loaded = Settings::load_with_env(None, no_env(), None).unwrap();
        assert_eq!(loaded.settings.default_backend, "dummy");
        assert!(!loaded.settings.allow_local_execution);
        assert_eq!(loaded.settings.retry.max_attempts, 3);
        assert_eq!(loaded.sources.len(), 1);
    }

    #[test]
    fn file_env_and_cli_layers_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sunstone.toml");
        fs::write(
            &path,
            "default_backend = \"meep\"\ncommand_timeout_seconds = 30\n\n[retry]\nmax_attempts = 5\n",
        )
        .unwrap();

        let vars = vec![
            (DEFAULT_BACKEND_ENV.to_string(), "ceviche".to_string()),
            (ALLOW_LOCAL_ENV.to_string(), "yes".to_string()),
            ("HOME".to_string(), "/ignored".to_string()),
        ];
        let loaded = Settings::load_with_env(
            Some(&path),
            vars,
            Some(json!({"retry": {"base_delay_ms": 10}})),
        )
        .unwrap();

        let s = &loaded.settings;
        assert_eq!(s.default_backend, "ceviche");
        assert!(s.allow_local_execution);
        assert_eq!(s.command_timeout_seconds, 30);
        assert_eq!(s.retry.max_attempts, 5);
        assert_eq!(s.retry.base_delay_ms, 10);

        let origins: Vec<_> = loaded.sources.iter().map(|s| s.origin).collect();
        assert_eq!(
            origins,
            vec![
                SettingsOrigin::Builtin,
                SettingsOrigin::File,
                SettingsOrigin::Env,
                SettingsOrigin::Cli
            ]
        );
        assert_eq!(loaded.sources[1].digest.as_ref().unwrap().len(), 64);
    }

    #[test]
    fn config_path_from_env() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("c.toml");
        fs::write(&path, "remote_worker_command = \"/opt/sunstone/bin/worker\"\n").unwrap();
        let vars = vec![(CONFIG_ENV.to_string(), path.display().to_string())];
        let loaded = Settings::load_with_env(None, vars, None).unwrap();
        assert_eq!(loaded.settings.remote_worker_command, "/opt/sunstone/bin/worker");
    }

    #[test]
    fn bad_bool_env_rejected() {
        let vars = vec![(ALLOW_LOCAL_ENV.to_string(), "maybe".to_string())];
        let err = Settings::load_with_env(None, vars, None).unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn retry_attempts_bounded() {
        let err =
            Settings::load_with_env(None, no_env(), Some(json!({"retry": {"max_attempts": 0}})))
                .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err =
            Settings::load_with_env(None, no_env(), Some(json!({"retry": {"max_attempts": 11}})))
                .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_window_rejected() {
        let err = Settings::load_with_env(None, no_env(), Some(json!({"monitor": {"window": 0}})))
            .unwrap_err();
        assert!(err.to_string().contains("window"));
    }

    #[test]
    fn file_scalar_for_a_table_names_key_and_layer() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sunstone.toml");
        fs::write(&path, "retry = 3\n").unwrap();
        let err = Settings::load_with_env(Some(&path), no_env(), None).unwrap_err();
        match err {
            ConfigError::Conflict { origin, conflict } => {
                assert_eq!(origin, SettingsOrigin::File);
                assert_eq!(conflict.key, "retry");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = Settings::load_with_env(Some(Path::new("/nonexistent/s.toml")), no_env(), None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.toml");
        fs::write(&path, "retry = [[[").unwrap();
        let err = Settings::load_with_env(Some(&path), no_env(), None).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
