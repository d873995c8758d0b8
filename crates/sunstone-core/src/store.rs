//! File-backed run store.
//!
//! ```text
//! <data_dir>/projects/<id>/project.json
//! <data_dir>/runs/run_<id>/...
//! ```
//!
//! Nothing is cached: every accessor reads the files fresh.

use serde_json::{json, Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::layout::{read_json_opt, write_json, RunDir};
use crate::records::{
    new_id, now, JobRecord, Project, ResourceSample, RunRecord, RunStatus, StatusRecord,
};

const RUN_PREFIX: &str = "run_";
const STAGING_PREFIX: &str = ".staging-";

/// Ids are generated hex strings; anything outside this alphabet never names
/// a record and must not reach a path join.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[derive(Debug, Clone)]
pub struct RunStore {
    data_dir: PathBuf,
}

impl RunStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn projects_dir(&self) -> PathBuf {
        self.data_dir.join("projects")
    }

    fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }

    fn project_json(&self, id: &str) -> PathBuf {
        self.projects_dir().join(id).join("project.json")
    }

    // --- projects ---

    pub fn create_project(&self, name: &str) -> Result<Project, StoreError> {
        let project = Project {
            id: new_id(),
            name: name.to_string(),
            created_at: now(),
        };
        write_json(&self.project_json(&project.id), &project)?;
        info!(project_id = %project.id, name, "project created");
        Ok(project)
    }

    pub fn get_project(&self, id: &str) -> Result<Project, StoreError> {
        if !is_valid_id(id) {
            return Err(StoreError::ProjectNotFound(id.to_string()));
        }
        read_json_opt(&self.project_json(id))?
            .ok_or_else(|| StoreError::ProjectNotFound(id.to_string()))
    }

    pub fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let mut projects = Vec::new();
        for name in list_dir_names(&self.projects_dir())? {
            match read_json_opt::<Project>(&self.project_json(&name)) {
                Ok(Some(project)) => projects.push(project),
                Ok(None) => {}
                Err(e) => warn!(project = %name, error = %e, "skipping unreadable project"),
            }
        }
        projects.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(projects)
    }

    // --- runs ---

    /// Create a run directory for `project_id`.
    ///
    /// The directory is assembled under a staging name and renamed into
    /// place, so a half-written run is never visible.
    pub fn create_run(
        &self,
        project_id: &str,
        spec: &Value,
        backend: &str,
    ) -> Result<RunRecord, StoreError> {
        self.get_project(project_id)?;

        let run = RunRecord {
            id: new_id(),
            project_id: project_id.to_string(),
            created_at: now(),
            status: RunStatus::Created,
            backend: backend.to_string(),
        };

        let runs_dir = self.runs_dir();
        fs::create_dir_all(&runs_dir).map_err(|e| StoreError::io(&runs_dir, e))?;
        let staging = RunDir::new(runs_dir.join(format!("{STAGING_PREFIX}{}", run.id)));
        let target = runs_dir.join(format!("{RUN_PREFIX}{}", run.id));

        let staged = (|| {
            staging.create_skeleton()?;
            write_json(&staging.spec_json(), spec)?;
            write_json(&staging.run_json(), &run)?;
            staging.write_status(&StatusRecord::new(RunStatus::Created))?;
            write_json(&staging.backend_json(), &json!({ "backend": backend }))?;
            fs::rename(staging.root(), &target).map_err(|e| StoreError::io(&target, e))
        })();
        if let Err(e) = staged {
            let _ = fs::remove_dir_all(staging.root());
            return Err(e);
        }

        info!(run_id = %run.id, project_id, backend, "run created");
        Ok(run)
    }

    /// Resolve the directory for an existing run.
    pub fn run_dir(&self, id: &str) -> Result<RunDir, StoreError> {
        if !is_valid_id(id) {
            return Err(StoreError::RunNotFound(id.to_string()));
        }
        let root = self.runs_dir().join(format!("{RUN_PREFIX}{id}"));
        if !root.is_dir() {
            return Err(StoreError::RunNotFound(id.to_string()));
        }
        Ok(RunDir::new(root))
    }

    /// Load a run with its status refreshed from the Status Record.
    pub fn load_run(&self, id: &str) -> Result<RunRecord, StoreError> {
        let dir = self.run_dir(id)?;
        let mut run: RunRecord = read_json_opt(&dir.run_json())?
            .ok_or_else(|| StoreError::RunNotFound(id.to_string()))?;
        match dir.read_status() {
            Ok(Some(status)) => run.status = status.status,
            Ok(None) => {}
            Err(e) => warn!(run_id = id, error = %e, "status record unreadable; using run record"),
        }
        Ok(run)
    }

    pub fn save_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        let dir = self.run_dir(&run.id)?;
        write_json(&dir.run_json(), run)
    }

    pub fn list_runs(&self, project_id: &str) -> Result<Vec<RunRecord>, StoreError> {
        self.get_project(project_id)?;
        let mut runs = Vec::new();
        for name in list_dir_names(&self.runs_dir())? {
            let Some(id) = name.strip_prefix(RUN_PREFIX) else {
                continue;
            };
            match self.load_run(id) {
                Ok(run) if run.project_id == project_id => runs.push(run),
                Ok(_) => {}
                Err(e) => warn!(run_id = id, error = %e, "skipping unreadable run"),
            }
        }
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    // --- status ---

    pub fn load_status(&self, id: &str) -> Result<Option<StatusRecord>, StoreError> {
        self.run_dir(id)?.read_status()
    }

    pub fn save_status(&self, id: &str, record: &StatusRecord) -> Result<(), StoreError> {
        self.run_dir(id)?.write_status(record)
    }

    /// See [`RunDir::advance_status`].
    pub fn advance_status(
        &self,
        id: &str,
        status: RunStatus,
        detail: Option<String>,
    ) -> Result<bool, StoreError> {
        self.run_dir(id)?.advance_status(status, detail)
    }

    // --- job ---

    pub fn load_job(&self, id: &str) -> Result<JobRecord, StoreError> {
        self.run_dir(id)?
            .read_job()?
            .ok_or_else(|| StoreError::JobNotFound(id.to_string()))
    }

    pub fn save_job(&self, id: &str, job: &JobRecord) -> Result<(), StoreError> {
        self.run_dir(id)?.write_job(job)
    }

    // --- spec and options ---

    /// Load `spec.json`; a missing file reads as an empty object.
    pub fn load_spec(&self, id: &str) -> Result<Value, StoreError> {
        let dir = self.run_dir(id)?;
        Ok(read_json_opt(&dir.spec_json())?.unwrap_or_else(|| Value::Object(Map::new())))
    }

    pub fn save_spec(&self, id: &str, spec: &Value) -> Result<(), StoreError> {
        let dir = self.run_dir(id)?;
        write_json(&dir.spec_json(), spec)
    }

    pub fn save_backend_options(
        &self,
        id: &str,
        options: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        let dir = self.run_dir(id)?;
        write_json(&dir.backend_options_json(), options)
    }

    pub fn load_resource_window(&self, id: &str) -> Result<Vec<ResourceSample>, StoreError> {
        Ok(self.run_dir(id)?.read_resource_window())
    }
}

fn list_dir_names(dir: &Path) -> Result<Vec<String>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(dir, e))?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}
