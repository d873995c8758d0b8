//! Run service
//!
//! The transport-agnostic operations behind the CLI (and any HTTP layer put
//! in front of it). Each method maps its failures onto [`ServiceError`],
//! whose [`ServiceError::http_status`] gives the response code.

mod error;

pub use error::ServiceError;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use walkdir::WalkDir;

use sunstone_core::layout::write_json;
use sunstone_core::{
    JobMode, JobRecord, LogStream, Project, ResourceSample, RunDir, RunRecord, RunStatus,
    RunStore, SshOptions,
};

use crate::capabilities::{BackendCapabilities, BackendSummary, CapabilityProvider, StaticCatalog};
use crate::config::{ConfigError, Settings};
use crate::environment::EnvironmentSnapshot;
use crate::runner::{LaunchError, LaunchOptions, Liveness, Runners, SshTarget};
use crate::stream::{tail_text, Disconnect, JobStream, StreamConfig};
use crate::validate::{validate_submission, ValidationError};

fn default_mode() -> String {
    JobMode::Local.to_string()
}

/// Remote submissions need a usable `user@host[:path]` before anything is
/// written to the run directory.
fn check_ssh_target(raw: Option<&str>) -> Result<(), ServiceError> {
    let raw = raw
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ServiceError::InvalidRequest(LaunchError::MissingTarget.to_string()))?;
    SshTarget::parse(raw)
        .map(drop)
        .map_err(|e| ServiceError::InvalidRequest(e.to_string()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// `local`, `ssh` (alias `remote`) or `batch` (alias `slurm`).
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub backend_options: Option<Map<String, Value>>,
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default)]
    pub ssh_target: Option<String>,
    #[serde(default)]
    pub ssh_options: Option<SshOptions>,
}

impl Default for SubmitRequest {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            backend: None,
            backend_options: None,
            executable: None,
            ssh_target: None,
            ssh_options: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub run_id: String,
    pub status: RunStatus,
    pub job: JobRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelResponse {
    pub run_id: String,
    pub status: RunStatus,
    /// False when the run was already terminal and nothing was signalled.
    pub signaled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatusView {
    pub run_id: String,
    pub mode: JobMode,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,
    pub running: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogsView {
    pub run_id: String,
    pub stream: LogStream,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactEntry {
    /// Relative to `outputs/`, `/`-separated.
    pub path: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Join `rel` under `base`, refusing absolute paths and `..`.
pub fn safe_join(base: &Path, rel: &str) -> Option<PathBuf> {
    let rel = Path::new(rel);
    let mut out = base.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(out)
}

pub struct RunService {
    settings: Settings,
    store: RunStore,
    catalog: Arc<dyn CapabilityProvider>,
    runners: Arc<Runners>,
}

impl RunService {
    pub fn new(
        settings: Settings,
        catalog: Arc<dyn CapabilityProvider>,
        runners: Arc<Runners>,
    ) -> Self {
        let store = RunStore::new(&settings.data_dir);
        Self {
            settings,
            store,
            catalog,
            runners,
        }
    }

    /// Service with the configured catalog and real process runners.
    pub fn from_settings(settings: Settings) -> Result<Self, ConfigError> {
        let catalog: Arc<dyn CapabilityProvider> = match &settings.catalog_file {
            Some(path) => Arc::new(StaticCatalog::from_file(path)?),
            None => Arc::new(StaticCatalog::builtin()),
        };
        let runners = Arc::new(Runners::from_settings(&settings));
        Ok(Self::new(settings, catalog, runners))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    // --- catalog ---

    pub fn list_backends(&self) -> Vec<BackendSummary> {
        self.catalog.backends()
    }

    pub fn get_backend(&self, name: &str) -> Result<BackendCapabilities, ServiceError> {
        self.catalog
            .capabilities(name)
            .ok_or_else(|| ServiceError::NotFound(format!("unknown backend: {name}")))
    }

    // --- projects and runs ---

    pub fn create_project(&self, name: &str) -> Result<Project, ServiceError> {
        if name.trim().is_empty() {
            return Err(ServiceError::InvalidRequest(
                "project name must not be empty".to_string(),
            ));
        }
        Ok(self.store.create_project(name.trim())?)
    }

    pub fn list_projects(&self) -> Result<Vec<Project>, ServiceError> {
        Ok(self.store.list_projects()?)
    }

    pub fn get_project(&self, id: &str) -> Result<Project, ServiceError> {
        Ok(self.store.get_project(id)?)
    }

    pub fn create_run(
        &self,
        project_id: &str,
        spec: &Value,
        backend: Option<&str>,
    ) -> Result<RunRecord, ServiceError> {
        let backend = backend
            .map(|b| b.trim().to_ascii_lowercase())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| self.settings.default_backend.clone());
        Ok(self.store.create_run(project_id, spec, &backend)?)
    }

    pub fn list_runs(&self, project_id: &str) -> Result<Vec<RunRecord>, ServiceError> {
        Ok(self.store.list_runs(project_id)?)
    }

    pub fn get_run(&self, id: &str) -> Result<RunRecord, ServiceError> {
        Ok(self.store.load_run(id)?)
    }

    // --- submit ---

    /// Validate and launch a run.
    ///
    /// Nothing is written until the mode, permissions, run status, backend
    /// and spec have all been checked.
    pub fn submit_run(
        &self,
        id: &str,
        request: SubmitRequest,
    ) -> Result<SubmitResponse, ServiceError> {
        let mode: JobMode = request.mode.parse()?;
        if mode == JobMode::Local && !self.settings.allow_local_execution {
            return Err(ServiceError::LocalExecutionDisabled);
        }

        let mut run = self.store.load_run(id)?;
        if !run.status.is_submittable() {
            return Err(ServiceError::InvalidRequest(format!(
                "run {id} is {}; only created runs can be submitted",
                run.status
            )));
        }
        if mode == JobMode::Ssh {
            check_ssh_target(request.ssh_target.as_deref())?;
        }

        let backend = request
            .backend
            .as_deref()
            .unwrap_or(&run.backend)
            .trim()
            .to_ascii_lowercase();
        let caps = self
            .catalog
            .capabilities(&backend)
            .ok_or_else(|| ValidationError::UnknownBackend(backend.clone()))?;
        let spec = self.store.load_spec(id)?;
        let validated = validate_submission(&caps, &spec, request.backend_options.as_ref())?;

        let run_dir = self.store.run_dir(id)?;
        if validated.spec_changed {
            self.store.save_spec(id, &validated.spec)?;
        }
        if let Err(e) = write_json(&run_dir.environment_json(), &EnvironmentSnapshot::detect()) {
            warn!(run_id = id, error = %e, "could not write environment snapshot");
        }
        if let Some(options) = &request.backend_options {
            self.store.save_backend_options(id, options)?;
        }
        if run.backend != backend {
            run.backend = backend.clone();
            self.store.save_run(&run)?;
        }

        let launch = LaunchOptions {
            executable: request.executable,
            ssh_target: request.ssh_target,
            ssh_options: request.ssh_options.unwrap_or_default(),
        };
        let job = match self
            .runners
            .for_mode(mode)
            .submit(&run, run_dir.root(), &backend, &launch)
        {
            Ok(job) => job,
            Err(e) => {
                self.record_launch_failure(id, &run_dir, &e.to_string());
                return Err(ServiceError::Launch(e));
            }
        };

        self.store.save_job(id, &job)?;
        self.store.advance_status(id, RunStatus::Submitted, None)?;
        let status = self.store.load_run(id)?.status;
        info!(run_id = id, mode = %mode, backend = %backend, pid = job.pid, %status, "run submitted");

        Ok(SubmitResponse {
            run_id: id.to_string(),
            status,
            job,
        })
    }

    fn record_launch_failure(&self, id: &str, run_dir: &RunDir, message: &str) {
        error!(run_id = id, error = message, "worker launch failed");
        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.log_path(LogStream::Stderr))
            .and_then(|mut log| writeln!(log, "[submit_run] Worker launch failed: {message}"));
        if let Err(e) = appended {
            warn!(run_id = id, error = %e, "could not append launch failure to stderr log");
        }
        let detail = format!("Worker launch failed: {message}");
        if let Err(e) = self.store.advance_status(id, RunStatus::Failed, Some(detail)) {
            warn!(run_id = id, error = %e, "could not record failed status");
        }
    }

    // --- cancel ---

    /// Cancel a submitted run.
    ///
    /// The status becomes `canceled` as soon as a termination signal has been
    /// dispatched, even if the runner then reports an error. Missing job
    /// metadata leaves the status untouched.
    pub fn cancel_run(&self, id: &str) -> Result<CancelResponse, ServiceError> {
        let run = self.store.load_run(id)?;
        let job = match self.store.load_job(id) {
            Ok(job) => job,
            Err(e) if e.is_not_found() => return Err(ServiceError::NotSubmitted(id.to_string())),
            Err(e) => return Err(e.into()),
        };

        if run.status.is_terminal() {
            info!(run_id = id, status = %run.status, "cancel on terminal run acknowledged");
            return Ok(CancelResponse {
                run_id: id.to_string(),
                status: run.status,
                signaled: false,
            });
        }

        let result = self.runners.for_mode(job.mode).cancel(&job);
        let dispatched = match &result {
            Ok(()) => true,
            Err(e) => e.was_dispatched(),
        };
        if dispatched {
            self.store.advance_status(id, RunStatus::Canceled, None)?;
        }

        match result {
            Ok(()) => {
                info!(run_id = id, mode = %job.mode, pid = job.pid, "run canceled");
                Ok(CancelResponse {
                    run_id: id.to_string(),
                    status: self.store.load_run(id)?.status,
                    signaled: true,
                })
            }
            Err(e) => {
                error!(run_id = id, error = %e, dispatched, "cancel failed");
                Err(ServiceError::Cancel(e))
            }
        }
    }

    // --- job views ---

    pub fn get_job(&self, id: &str) -> Result<JobRecord, ServiceError> {
        Ok(self.store.load_job(id)?)
    }

    pub fn get_job_status(&self, id: &str) -> Result<JobStatusView, ServiceError> {
        let job = self.store.load_job(id)?;
        let (running, error) = match self.runners.for_mode(job.mode).probe(&job) {
            Liveness::Running => (Some(true), None),
            Liveness::NotRunning => (Some(false), None),
            Liveness::Unknown { reason } => (None, reason),
        };
        Ok(JobStatusView {
            run_id: id.to_string(),
            mode: job.mode,
            pid: job.pid,
            ssh_target: job.ssh_target,
            remote_path: job.remote_path,
            running,
            error,
        })
    }

    /// Periodic job events; see [`JobStream`].
    pub fn stream_job(
        &self,
        id: &str,
        interval: Option<Duration>,
        max_events: Option<usize>,
        disconnect: Disconnect,
    ) -> Result<JobStream, ServiceError> {
        self.store.load_job(id)?;
        let config = StreamConfig::new(
            interval.unwrap_or_else(|| self.settings.stream_interval()),
            max_events,
        );
        Ok(JobStream::new(
            self.store.run_dir(id)?,
            Arc::clone(&self.runners),
            config,
            disconnect,
        ))
    }

    pub fn get_logs(
        &self,
        id: &str,
        stream: LogStream,
        tail_lines: usize,
    ) -> Result<LogsView, ServiceError> {
        let run_dir = self.store.run_dir(id)?;
        let path = run_dir.log_path(stream);
        let text = tail_text(&path, tail_lines)
            .map_err(|e| ServiceError::Store(sunstone_core::StoreError::io(path, e)))?;
        Ok(LogsView {
            run_id: id.to_string(),
            stream,
            text,
        })
    }

    pub fn get_resource(&self, id: &str) -> Result<Vec<ResourceSample>, ServiceError> {
        Ok(self.store.load_resource_window(id)?)
    }

    // --- artifacts ---

    pub fn list_artifacts(&self, id: &str) -> Result<Vec<ArtifactEntry>, ServiceError> {
        let outputs = self.store.run_dir(id)?.outputs_dir();
        let mut artifacts = Vec::new();
        for entry in WalkDir::new(&outputs).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(run_id = id, error = %e, "skipping unreadable artifact entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&outputs) else {
                continue;
            };
            let metadata = entry.metadata().ok();
            artifacts.push(ArtifactEntry {
                path: rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/"),
                size_bytes: metadata.as_ref().map_or(0, |m| m.len()),
                modified_at: metadata
                    .and_then(|m| m.modified().ok())
                    .map(DateTime::<Utc>::from),
            });
        }
        Ok(artifacts)
    }

    /// Absolute path of one artifact under `outputs/`.
    pub fn artifact_path(&self, id: &str, rel: &str) -> Result<PathBuf, ServiceError> {
        let outputs = self.store.run_dir(id)?.outputs_dir();
        let path = safe_join(&outputs, rel)
            .ok_or_else(|| ServiceError::InvalidRequest(format!("invalid artifact path: {rel}")))?;
        if !path.is_file() {
            return Err(ServiceError::NotFound(format!("artifact not found: {rel}")));
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_join_rejects_traversal() {
        let base = Path::new("/data/runs/run_1/outputs");
        assert_eq!(
            safe_join(base, "spectra/m1.json").unwrap(),
            base.join("spectra").join("m1.json")
        );
        assert_eq!(safe_join(base, "./summary.json").unwrap(), base.join("summary.json"));
        assert!(safe_join(base, "../runtime/job.json").is_none());
        assert!(safe_join(base, "/etc/passwd").is_none());
    }

    #[test]
    fn submit_request_defaults_to_local() {
        let req: SubmitRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.mode, "local");
        assert!(req.backend_options.is_none());
    }
}
