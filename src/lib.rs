//! Sunstone run orchestration
//!
//! Accepts simulation runs, validates them against backend capabilities,
//! launches the worker locally, over SSH or through a batch placeholder,
//! and serves status, logs, resource samples and artifacts back from the
//! run directory.

pub mod capabilities;
pub mod config;
pub mod environment;
pub mod runner;
pub mod service;
pub mod stream;
pub mod validate;

pub use capabilities::{BackendCapabilities, CapabilityProvider, OptionSchema, StaticCatalog};
pub use config::{ConfigError, LoadedSettings, Settings};
pub use runner::{CancelError, JobRunner, LaunchError, LaunchOptions, Liveness, Runners};
pub use service::{
    ArtifactEntry, CancelResponse, JobStatusView, LogsView, RunService, ServiceError,
    SubmitRequest, SubmitResponse,
};
pub use stream::{Disconnect, JobEvent, JobStream, StreamConfig};
pub use validate::{validate_submission, ValidatedSubmission, ValidationError};
