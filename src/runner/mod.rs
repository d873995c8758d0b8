//! Job runners
//!
//! A runner launches the worker for a run and later cancels or probes it.
//! The variant is chosen by the closed [`JobMode`] tag, which is stored in
//! the Job Record so cancel and probe reach the same runner that launched
//! the job.

mod batch;
pub mod command;
mod local;
mod ssh;

pub use batch::BatchRunner;
pub use command::{
    run_with_retry, CommandError, CommandOutput, CommandRunner, CommandSpec, MockCommandRunner,
    RetryPolicy, SystemCommandRunner,
};
pub use local::{resolve_executable, LocalRunner, WORKER_BINARY};
pub use ssh::{shell_quote, SshRunner, SshTarget};

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sunstone_core::{JobMode, JobRecord, RunRecord, SshOptions};

use crate::config::Settings;

/// Per-submission launch parameters.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    /// Worker executable (or a directory containing one) for local runs.
    pub executable: Option<PathBuf>,
    /// `user@host[:base_path]` for remote runs.
    pub ssh_target: Option<String>,
    pub ssh_options: SshOptions,
}

/// Remote launch steps, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStep {
    CreateDirectory,
    CopyRunDirectory,
    StartWorker,
}

impl std::fmt::Display for RemoteStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RemoteStep::CreateDirectory => "directory creation",
            RemoteStep::CopyRunDirectory => "run directory copy",
            RemoteStep::StartWorker => "worker start",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("could not find worker executable in {0}")]
    ExecutableNotFound(PathBuf),

    #[error("failed to spawn worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error preparing launch: {0}")]
    Io(#[from] io::Error),

    #[error("ssh_target is required for remote submission")]
    MissingTarget,

    #[error("invalid ssh target {0:?} (expected user@host[:path])")]
    InvalidTarget(String),

    #[error("remote {step} failed: {source}")]
    Remote {
        step: RemoteStep,
        #[source]
        source: CommandError,
    },

    #[error("could not parse remote pid from output {0:?}")]
    InvalidPid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CancelError {
    #[error("job record has no ssh_target; refusing to guess the remote host")]
    MissingRemoteTarget,

    #[error("job record has no pid to signal")]
    MissingPid,

    #[cfg(unix)]
    #[error("failed to signal process group {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("remote termination of pid {pid} failed: {source}")]
    Remote {
        pid: u32,
        #[source]
        source: CommandError,
    },

    #[error("process cancellation is not supported on this platform")]
    Unsupported,
}

impl CancelError {
    /// Whether a termination signal was actually attempted.
    pub fn was_dispatched(&self) -> bool {
        match self {
            #[cfg(unix)]
            CancelError::Signal { .. } => true,
            CancelError::Remote { .. } => true,
            _ => false,
        }
    }
}

/// Result of a liveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum Liveness {
    Running,
    NotRunning,
    /// The probe could not reach a verdict. Never read this as "not running".
    Unknown { reason: Option<String> },
}

impl Liveness {
    pub fn unknown(reason: impl Into<String>) -> Self {
        Liveness::Unknown {
            reason: Some(reason.into()),
        }
    }

    /// `Some(true)`, `Some(false)` or `None` for unknown.
    pub fn as_option(&self) -> Option<bool> {
        match self {
            Liveness::Running => Some(true),
            Liveness::NotRunning => Some(false),
            Liveness::Unknown { .. } => None,
        }
    }
}

pub trait JobRunner: Send + Sync {
    fn mode(&self) -> JobMode;

    fn submit(
        &self,
        run: &RunRecord,
        run_dir: &Path,
        backend: &str,
        options: &LaunchOptions,
    ) -> Result<JobRecord, LaunchError>;

    fn cancel(&self, job: &JobRecord) -> Result<(), CancelError>;

    fn probe(&self, job: &JobRecord) -> Liveness;
}

/// Extra worker flags forwarded by both the local and remote runners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerFlags {
    pub monitor_interval_ms: u64,
    pub monitor_window: usize,
}

impl WorkerFlags {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            monitor_interval_ms: settings.monitor.interval_ms,
            monitor_window: settings.monitor.window,
        }
    }

    pub fn to_args(self) -> Vec<String> {
        vec![
            "--monitor-interval-ms".to_string(),
            self.monitor_interval_ms.to_string(),
            "--monitor-window".to_string(),
            self.monitor_window.to_string(),
        ]
    }
}

/// One runner per mode.
pub struct Runners {
    pub local: LocalRunner,
    pub ssh: SshRunner,
    pub batch: BatchRunner,
}

impl Runners {
    /// Production runners driven by `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::with_command_runner(settings, Arc::new(SystemCommandRunner))
    }

    /// Runners whose remote commands go through `commands`.
    pub fn with_command_runner(settings: &Settings, commands: Arc<dyn CommandRunner>) -> Self {
        let flags = WorkerFlags::from_settings(settings);
        let retry = RetryPolicy {
            max_attempts: settings.retry.max_attempts,
            base_delay: Duration::from_millis(settings.retry.base_delay_ms),
        };
        Self {
            local: LocalRunner::new(settings.worker_executable.clone()).with_flags(flags),
            ssh: SshRunner::new(commands)
                .with_retry(retry)
                .with_timeout(settings.command_timeout())
                .with_remote_worker(settings.remote_worker_command.clone())
                .with_remote_base(settings.remote_base_dir.clone())
                .with_flags(flags),
            batch: BatchRunner,
        }
    }

    pub fn for_mode(&self, mode: JobMode) -> &dyn JobRunner {
        match mode {
            JobMode::Local => &self.local,
            JobMode::Ssh => &self.ssh,
            JobMode::Batch => &self.batch,
        }
    }
}
