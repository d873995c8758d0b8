//! On-disk records shared by the orchestrator and the worker.
//!
//! Every record is plain JSON inside a run directory. Readers treat each
//! file as a point-in-time snapshot; writers replace whole files atomically
//! (see [`crate::atomic`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current time, truncated the way every record stores it.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Generate a fresh identifier (32 lowercase hex characters).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// A named container for runs. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Run lifecycle status.
///
/// `created → submitted → running → {succeeded | failed | canceled}`.
/// `failed` and `canceled` are also reachable straight from `created` and
/// `submitted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Created,
    Submitted,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled
        )
    }

    /// Only freshly created runs accept a submission.
    pub fn is_submittable(&self) -> bool {
        matches!(self, RunStatus::Created)
    }

    fn rank(&self) -> u8 {
        match self {
            RunStatus::Created => 0,
            RunStatus::Submitted => 1,
            RunStatus::Running => 2,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled => 3,
        }
    }

    /// Check if transition from this status to `target` is valid.
    ///
    /// Status only moves forward. `created → running` is allowed because a
    /// local worker can start before the submitter records `submitted`.
    pub fn can_transition_to(&self, target: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        target.rank() > self.rank()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Submitted => "submitted",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single simulation execution.
///
/// `status` mirrors the Status Record; [`crate::RunStore::load_run`] refreshes
/// it on every read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub project_id: String,
    pub created_at: DateTime<Utc>,
    pub status: RunStatus,
    pub backend: String,
}

/// Authoritative current status of a run (`runtime/status.json`).
///
/// Last writer wins; there is no locking between the submitter and the
/// worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: RunStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(flatten, default)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StatusRecord {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            updated_at: now(),
            detail: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_detail(status: RunStatus, detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::new(status)
        }
    }
}

/// How a job was launched. Stored in the Job Record and used to pick the
/// runner for cancel and liveness probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    Local,
    Ssh,
    Batch,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobMode::Local => "local",
            JobMode::Ssh => "ssh",
            JobMode::Batch => "batch",
        }
    }
}

impl fmt::Display for JobMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unsupported execution mode string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported execution mode: {0:?} (expected local, ssh or batch)")]
pub struct UnknownMode(pub String);

impl FromStr for JobMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(JobMode::Local),
            "ssh" | "remote" => Ok(JobMode::Ssh),
            "batch" | "slurm" => Ok(JobMode::Batch),
            _ => Err(UnknownMode(s.to_string())),
        }
    }
}

/// SSH connection options for remote jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    pub agent_forwarding: bool,
    /// `None` leaves the client default in place.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strict_host_key_checking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_hosts_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_seconds: Option<u32>,
    /// Extra client flags, whitespace separated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

/// Durable handle to a launched worker (`runtime/job.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// 0 when no process was launched (batch placeholder).
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub backend: String,
    pub mode: JobMode,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_options: Option<SshOptions>,
}

impl JobRecord {
    pub fn new(pid: u32, backend: impl Into<String>, mode: JobMode) -> Self {
        Self {
            pid,
            started_at: now(),
            backend: backend.into(),
            mode,
            remote_path: None,
            ssh_target: None,
            ssh_port: None,
            identity_file: None,
            ssh_options: None,
        }
    }
}

/// Per-GPU utilisation as reported by `nvidia-smi`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuSample {
    pub index: u32,
    pub name: String,
    pub load_percent: Option<f64>,
    pub memory_total_mb: Option<f64>,
    pub memory_used_mb: Option<f64>,
}

/// One tick of the resource monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_system_percent: Option<f64>,
    #[serde(default)]
    pub cpu_per_core: Vec<f64>,
    pub proc_cpu_percent: Option<f64>,
    pub proc_memory_rss: Option<u64>,
    pub memory_total: Option<u64>,
    pub memory_available: Option<u64>,
    pub disk_read_bytes: Option<u64>,
    pub disk_write_bytes: Option<u64>,
    pub net_bytes_sent: Option<u64>,
    pub net_bytes_recv: Option<u64>,
    pub threads: Option<u64>,
    pub open_files: Option<u64>,
    #[serde(default)]
    pub gpus: Vec<GpuSample>,
}

impl ResourceSample {
    /// A sample with a timestamp and nothing measured yet.
    pub fn empty() -> Self {
        Self {
            timestamp: now(),
            cpu_system_percent: None,
            cpu_per_core: Vec::new(),
            proc_cpu_percent: None,
            proc_memory_rss: None,
            memory_total: None,
            memory_available: None,
            disk_read_bytes: None,
            disk_write_bytes: None,
            net_bytes_sent: None,
            net_bytes_recv: None,
            threads: None,
            open_files: None,
            gpus: Vec::new(),
        }
    }
}
