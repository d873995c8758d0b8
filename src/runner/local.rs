//! Local worker processes.
//!
//! The worker is spawned detached in its own process group with its output
//! appended to the run's log files. A reaper thread waits on the child so it
//! never lingers as a zombie; cancel signals the whole group.

use std::env;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use tracing::{debug, info, warn};

use sunstone_core::{JobMode, JobRecord, LogStream, RunDir, RunRecord};

use super::{CancelError, JobRunner, LaunchError, LaunchOptions, Liveness, WorkerFlags};

pub const WORKER_BINARY: &str = "sunstone-worker";

/// Locations probed, in order, when the executable option names a directory
/// (an install prefix or a virtual environment).
fn directory_candidates(dir: &Path) -> [PathBuf; 3] {
    [
        dir.join("bin").join(WORKER_BINARY),
        dir.join(WORKER_BINARY),
        dir.join("Scripts").join(format!("{WORKER_BINARY}.exe")),
    ]
}

/// Resolve the worker executable.
///
/// An explicit path wins; a directory is searched for a worker binary. With
/// nothing explicit the configured default applies, then a binary next to
/// the current executable, then `sunstone-worker` from `$PATH`.
pub fn resolve_executable(
    explicit: Option<&Path>,
    default: Option<&Path>,
) -> Result<PathBuf, LaunchError> {
    if let Some(path) = explicit.or(default) {
        if path.is_dir() {
            return directory_candidates(path)
                .into_iter()
                .find(|candidate| candidate.is_file())
                .ok_or_else(|| LaunchError::ExecutableNotFound(path.to_path_buf()));
        }
        return Ok(path.to_path_buf());
    }

    let sibling = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BINARY)))
        .filter(|candidate| candidate.is_file());
    Ok(sibling.unwrap_or_else(|| PathBuf::from(WORKER_BINARY)))
}

#[derive(Debug, Clone, Default)]
pub struct LocalRunner {
    default_executable: Option<PathBuf>,
    flags: Option<WorkerFlags>,
}

impl LocalRunner {
    pub fn new(default_executable: Option<PathBuf>) -> Self {
        Self {
            default_executable,
            flags: None,
        }
    }

    pub fn with_flags(mut self, flags: WorkerFlags) -> Self {
        self.flags = Some(flags);
        self
    }
}

impl JobRunner for LocalRunner {
    fn mode(&self) -> JobMode {
        JobMode::Local
    }

    fn submit(
        &self,
        run: &RunRecord,
        run_dir: &Path,
        backend: &str,
        options: &LaunchOptions,
    ) -> Result<JobRecord, LaunchError> {
        let exe = resolve_executable(
            options.executable.as_deref(),
            self.default_executable.as_deref(),
        )?;
        // The child runs with cwd = run dir, so relative paths would break.
        let run_dir = fs::canonicalize(run_dir)?;
        let layout = RunDir::new(&run_dir);
        fs::create_dir_all(layout.logs_dir())?;
        let open_log = |stream| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(layout.log_path(stream))
        };
        let stdout = open_log(LogStream::Stdout)?;
        let stderr = open_log(LogStream::Stderr)?;

        let mut cmd = Command::new(&exe);
        cmd.arg("--run-dir")
            .arg(&run_dir)
            .arg("--backend")
            .arg(backend)
            .args(self.flags.map(WorkerFlags::to_args).unwrap_or_default())
            .current_dir(&run_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
            program: exe.display().to_string(),
            source,
        })?;
        let pid = child.id();

        let reaper = thread::Builder::new()
            .name(format!("reap-{pid}"))
            .spawn(move || match child.wait() {
                Ok(status) => debug!(pid, ?status, "worker exited"),
                Err(e) => warn!(pid, error = %e, "failed to wait on worker"),
            });
        if let Err(e) = reaper {
            warn!(pid, error = %e, "could not start reaper thread");
        }

        info!(run_id = %run.id, pid, exe = %exe.display(), backend, "local worker started");
        Ok(JobRecord::new(pid, backend, JobMode::Local))
    }

    #[cfg(unix)]
    fn cancel(&self, job: &JobRecord) -> Result<(), CancelError> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        // pid 0 would address our own process group.
        let pid = i32::try_from(job.pid)
            .ok()
            .filter(|p| *p > 0)
            .ok_or(CancelError::MissingPid)?;
        match killpg(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                info!(pid, "sent SIGTERM to worker process group");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!(pid, "worker process group already gone");
                Ok(())
            }
            Err(source) => Err(CancelError::Signal {
                pid: job.pid,
                source,
            }),
        }
    }

    #[cfg(not(unix))]
    fn cancel(&self, _job: &JobRecord) -> Result<(), CancelError> {
        Err(CancelError::Unsupported)
    }

    fn probe(&self, _job: &JobRecord) -> Liveness {
        Liveness::Unknown { reason: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_file_path_used_verbatim() {
        let path = Path::new("/opt/sunstone/bin/sunstone-worker");
        assert_eq!(resolve_executable(Some(path), None).unwrap(), path);
    }

    #[test]
    fn directory_probes_bin_first() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("bin")).unwrap();
        fs::write(tmp.path().join("bin").join(WORKER_BINARY), b"").unwrap();
        fs::write(tmp.path().join(WORKER_BINARY), b"").unwrap();
        assert_eq!(
            resolve_executable(Some(tmp.path()), None).unwrap(),
            tmp.path().join("bin").join(WORKER_BINARY)
        );
    }

    #[test]
    fn directory_without_worker_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve_executable(Some(tmp.path()), None),
            Err(LaunchError::ExecutableNotFound(_))
        ));
    }

    #[test]
    fn explicit_beats_default() {
        let explicit = Path::new("/a/worker");
        let default = Path::new("/b/worker");
        assert_eq!(
            resolve_executable(Some(explicit), Some(default)).unwrap(),
            explicit
        );
        assert_eq!(resolve_executable(None, Some(default)).unwrap(), default);
    }

    #[cfg(unix)]
    #[test]
    fn cancel_rejects_pid_zero() {
        let job = JobRecord::new(0, "dummy", JobMode::Local);
        assert!(matches!(
            LocalRunner::default().cancel(&job),
            Err(CancelError::MissingPid)
        ));
    }
}
