//! Sunstone core records and storage.
//!
//! Shared by the orchestrator and the worker process. The two sides only
//! communicate through the JSON files of a run directory, so this crate owns
//! the layout, the record types and the atomic write discipline.

pub mod atomic;
pub mod error;
pub mod host;
pub mod layout;
pub mod records;
pub mod store;

pub use error::StoreError;
pub use layout::{LogStream, RunDir};
pub use records::{
    GpuSample, JobMode, JobRecord, Project, ResourceSample, RunRecord, RunStatus, SshOptions,
    StatusRecord, UnknownMode,
};
pub use store::RunStore;
