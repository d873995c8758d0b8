//! Local worker launch and process-group cancel, using a shell script in
//! place of the real worker.

#![cfg(unix)]

mod common;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use common::{created_run, fdtd_spec, harness_with, healthy_remote};
use sunstone_core::{JobMode, LogStream, RunStatus};
use sunstone_orchestrator::SubmitRequest;

/// Prints its arguments, then waits on a child sleeping in the same group.
const FAKE_WORKER: &str = "#!/bin/sh\necho \"worker $*\"\nsleep 60 &\nwait\n";

fn install_fake_worker(dir: &Path) -> std::path::PathBuf {
    let bin = dir.join("bin");
    fs::create_dir_all(&bin).unwrap();
    let path = bin.join("sunstone-worker");
    fs::write(&path, FAKE_WORKER).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    done()
}

#[test]
fn local_worker_is_started_and_its_group_terminated() {
    let h = harness_with(true, healthy_remote());
    let prefix = h.tmp.path().join("venv");
    install_fake_worker(&prefix);
    let id = created_run(&h.service, &fdtd_spec(), "dummy");

    // a directory resolves to <dir>/bin/sunstone-worker
    let response = h
        .service
        .submit_run(
            &id,
            SubmitRequest {
                executable: Some(prefix),
                ..SubmitRequest::default()
            },
        )
        .unwrap();
    assert_eq!(response.job.mode, JobMode::Local);
    assert_eq!(response.status, RunStatus::Submitted);
    let pid = Pid::from_raw(response.job.pid as i32);

    assert!(wait_until(Duration::from_secs(10), || {
        h.service
            .get_logs(&id, LogStream::Stdout, 10)
            .map(|logs| logs.text.contains("worker --run-dir"))
            .unwrap_or(false)
    }));
    let logs = h.service.get_logs(&id, LogStream::Stdout, 10).unwrap();
    assert!(logs.text.contains("--backend dummy"));
    assert!(logs.text.contains("--monitor-interval-ms 1000"));

    let view = h.service.get_job_status(&id).unwrap();
    assert_eq!(view.running, None, "local jobs are not probed");

    let cancel = h.service.cancel_run(&id).unwrap();
    assert!(cancel.signaled);
    assert_eq!(cancel.status, RunStatus::Canceled);

    // the reaper thread collects the script once the group is gone
    assert!(wait_until(Duration::from_secs(10), || {
        kill(pid, None) == Err(Errno::ESRCH)
    }));
}
