//! Run directory layout and the per-file accessors used by both sides.
//!
//! ```text
//! spec.json
//! runtime/run.json  runtime/status.json  runtime/job.json
//! runtime/backend.json  runtime/backend_options.json
//! runtime/resource.json  runtime/environment.json
//! logs/stdout.log  logs/stderr.log
//! outputs/...
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::atomic;
use crate::error::StoreError;
use crate::records::{JobRecord, ResourceSample, RunStatus, StatusRecord};

/// Which worker log to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl std::str::FromStr for LogStream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(LogStream::Stdout),
            "stderr" => Ok(LogStream::Stderr),
            other => Err(format!("unknown log stream: {other}")),
        }
    }
}

/// Paths and record accessors for one run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunDir {
    root: PathBuf,
}

impl RunDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn spec_json(&self) -> PathBuf {
        self.root.join("spec.json")
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.root.join("runtime")
    }

    pub fn run_json(&self) -> PathBuf {
        self.runtime_dir().join("run.json")
    }

    pub fn status_json(&self) -> PathBuf {
        self.runtime_dir().join("status.json")
    }

    pub fn job_json(&self) -> PathBuf {
        self.runtime_dir().join("job.json")
    }

    pub fn backend_json(&self) -> PathBuf {
        self.runtime_dir().join("backend.json")
    }

    pub fn backend_options_json(&self) -> PathBuf {
        self.runtime_dir().join("backend_options.json")
    }

    pub fn resource_json(&self) -> PathBuf {
        self.runtime_dir().join("resource.json")
    }

    pub fn environment_json(&self) -> PathBuf {
        self.runtime_dir().join("environment.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_path(&self, stream: LogStream) -> PathBuf {
        match stream {
            LogStream::Stdout => self.logs_dir().join("stdout.log"),
            LogStream::Stderr => self.logs_dir().join("stderr.log"),
        }
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.root.join("outputs")
    }

    /// Create `runtime/`, `logs/` and `outputs/`.
    pub fn create_skeleton(&self) -> Result<(), StoreError> {
        for dir in [self.runtime_dir(), self.logs_dir(), self.outputs_dir()] {
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(())
    }

    pub fn read_status(&self) -> Result<Option<StatusRecord>, StoreError> {
        read_json_opt(&self.status_json())
    }

    pub fn write_status(&self, record: &StatusRecord) -> Result<(), StoreError> {
        write_json(&self.status_json(), record)
    }

    /// Guarded status write.
    ///
    /// Reads the current Status Record and writes `status` only if the
    /// transition is allowed. Returns whether a write happened. An unreadable
    /// record is treated as `created`.
    pub fn advance_status(
        &self,
        status: RunStatus,
        detail: Option<String>,
    ) -> Result<bool, StoreError> {
        let current = match self.read_status() {
            Ok(Some(record)) => record.status,
            Ok(None) => RunStatus::Created,
            Err(e) => {
                warn!(run_dir = %self.root.display(), error = %e, "unreadable status record");
                RunStatus::Created
            }
        };
        if !current.can_transition_to(status) {
            debug!(
                run_dir = %self.root.display(),
                from = %current,
                to = %status,
                "status transition skipped"
            );
            return Ok(false);
        }
        let record = StatusRecord {
            detail,
            ..StatusRecord::new(status)
        };
        self.write_status(&record)?;
        Ok(true)
    }

    pub fn read_job(&self) -> Result<Option<JobRecord>, StoreError> {
        read_json_opt(&self.job_json())
    }

    pub fn write_job(&self, job: &JobRecord) -> Result<(), StoreError> {
        write_json(&self.job_json(), job)
    }

    /// Current resource window; missing or unreadable files yield an empty one.
    pub fn read_resource_window(&self) -> Vec<ResourceSample> {
        match read_json_opt::<Vec<ResourceSample>>(&self.resource_json()) {
            Ok(Some(samples)) => samples,
            Ok(None) => Vec::new(),
            Err(e) => {
                debug!(error = %e, "ignoring unreadable resource window");
                Vec::new()
            }
        }
    }

    pub fn write_resource_window(&self, samples: &[ResourceSample]) -> Result<(), StoreError> {
        write_json(&self.resource_json(), samples)
    }
}

/// Read and parse a JSON file; `Ok(None)` when it does not exist.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Json {
            path: path.to_path_buf(),
            source,
        })
}

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StoreError> {
    atomic::write_json(path, value).map_err(|e| StoreError::io(path, e))
}
