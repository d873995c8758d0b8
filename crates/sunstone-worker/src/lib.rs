//! Sunstone worker
//!
//! The process launched for every run. It records `running`, executes the
//! solver backend, records the terminal status, and samples resource usage
//! into `runtime/resource.json` while the backend works.

pub mod backend;
pub mod monitor;
#[cfg(target_os = "linux")]
pub mod procfs;
pub mod run;

pub use backend::{backend_for, Backend, BackendError, DummyBackend};
#[cfg(target_os = "linux")]
pub use monitor::ProcSampler;
pub use monitor::{host_sampler, MonitorConfig, ResourceMonitor, Sampler};
pub use run::{run_worker, Outcome, WorkerOptions};
