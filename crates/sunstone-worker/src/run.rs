//! One worker invocation: monitor, status transitions, backend.

use std::path::PathBuf;
use tracing::{error, info, warn};

use sunstone_core::{RunDir, RunStatus};

use crate::backend::{backend_for, BackendError};
use crate::monitor::{host_sampler, MonitorConfig, ResourceMonitor};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub run_dir: PathBuf,
    pub backend: String,
    /// `None` disables resource sampling.
    pub monitor: Option<MonitorConfig>,
}

/// How the run ended, as far as this worker is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl Outcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            Outcome::Succeeded => 0,
            Outcome::Failed => 1,
        }
    }
}

/// Run the backend against `options.run_dir` and record the result.
///
/// Status writes are guarded, so a run canceled while the backend is working
/// stays canceled.
pub fn run_worker(options: &WorkerOptions) -> Outcome {
    let run_dir = RunDir::new(&options.run_dir);

    let monitor = options.monitor.and_then(|config| {
        let Some(sampler) = host_sampler() else {
            warn!("resource sampling is not supported on this platform");
            return None;
        };
        match ResourceMonitor::start(run_dir.clone(), sampler, config) {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                warn!(error = %e, "resource monitor not started");
                None
            }
        }
    });

    if let Err(e) = run_dir.advance_status(RunStatus::Running, None) {
        warn!(error = %e, "could not record running status");
    }
    info!(run_dir = %options.run_dir.display(), backend = %options.backend, "worker started");

    let result = backend_for(&options.backend).and_then(|backend| backend.run(run_dir.root()));

    if let Some(monitor) = monitor {
        monitor.stop();
    }

    finish(&run_dir, result)
}

fn finish(run_dir: &RunDir, result: Result<(), BackendError>) -> Outcome {
    let (status, detail, outcome) = match result {
        Ok(()) => (RunStatus::Succeeded, None, Outcome::Succeeded),
        Err(e) => {
            error!(error = %e, "backend failed");
            (RunStatus::Failed, Some(e.to_string()), Outcome::Failed)
        }
    };
    match run_dir.advance_status(status, detail) {
        Ok(true) => info!(status = %status, "worker finished"),
        Ok(false) => info!(status = %status, "run already terminal; status left unchanged"),
        Err(e) => error!(error = %e, "could not record final status"),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use sunstone_core::StatusRecord;

    fn setup(spec: &str) -> (tempfile::TempDir, RunDir) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = RunDir::new(tmp.path());
        dir.create_skeleton().unwrap();
        fs::write(dir.spec_json(), spec).unwrap();
        dir.write_status(&StatusRecord::new(RunStatus::Submitted))
            .unwrap();
        (tmp, dir)
    }

    fn options(dir: &RunDir, backend: &str) -> WorkerOptions {
        WorkerOptions {
            run_dir: dir.root().to_path_buf(),
            backend: backend.to_string(),
            monitor: None,
        }
    }

    #[test]
    fn dummy_run_succeeds() {
        let (_tmp, dir) = setup("{}");
        assert_eq!(run_worker(&options(&dir, "dummy")), Outcome::Succeeded);
        assert_eq!(
            dir.read_status().unwrap().unwrap().status,
            RunStatus::Succeeded
        );
        assert!(dir.outputs_dir().join("summary.json").is_file());
    }

    #[test]
    fn monitored_run_succeeds_with_or_without_a_sampler() {
        let (_tmp, dir) = setup("{}");
        let mut opts = options(&dir, "dummy");
        opts.monitor = Some(MonitorConfig {
            interval: std::time::Duration::from_millis(1),
            window: 4,
        });
        assert_eq!(run_worker(&opts), Outcome::Succeeded);

        let window = dir.read_resource_window();
        assert!(window.len() <= 4);
        if host_sampler().is_none() {
            assert!(window.is_empty());
        }
    }

    #[test]
    fn unknown_backend_fails_with_detail() {
        let (_tmp, dir) = setup("{}");
        let outcome = run_worker(&options(&dir, "nope"));
        assert_eq!(outcome, Outcome::Failed);
        assert_eq!(outcome.exit_code(), 1);
        let status = dir.read_status().unwrap().unwrap();
        assert_eq!(status.status, RunStatus::Failed);
        assert!(status.detail.unwrap().contains("unknown backend"));
    }

    #[test]
    fn canceled_run_stays_canceled() {
        let (_tmp, dir) = setup("{}");
        dir.write_status(&StatusRecord::new(RunStatus::Canceled))
            .unwrap();
        run_worker(&options(&dir, "dummy"));
        assert_eq!(
            dir.read_status().unwrap().unwrap().status,
            RunStatus::Canceled
        );
    }
}
