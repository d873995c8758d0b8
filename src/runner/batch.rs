use std::path::Path;
use tracing::info;

use sunstone_core::{JobMode, JobRecord, RunRecord};

use super::{CancelError, JobRunner, LaunchError, LaunchOptions, Liveness};

/// Placeholder for cluster schedulers: records the submission and launches
/// nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchRunner;

impl JobRunner for BatchRunner {
    fn mode(&self) -> JobMode {
        JobMode::Batch
    }

    fn submit(
        &self,
        run: &RunRecord,
        _run_dir: &Path,
        backend: &str,
        _options: &LaunchOptions,
    ) -> Result<JobRecord, LaunchError> {
        info!(run_id = %run.id, backend, "batch submission recorded; no process launched");
        Ok(JobRecord::new(0, backend, JobMode::Batch))
    }

    fn cancel(&self, _job: &JobRecord) -> Result<(), CancelError> {
        Ok(())
    }

    fn probe(&self, _job: &JobRecord) -> Liveness {
        Liveness::unknown("batch jobs have no tracked process")
    }
}
