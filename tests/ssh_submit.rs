//! Remote submission command sequences.

mod common;

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::Map;

use common::{created_run, fdtd_spec, harness_with, is_launch, is_mkdir};
use sunstone_core::{RunStatus, SshOptions};
use sunstone_orchestrator::runner::{CommandOutput, MockCommandRunner};
use sunstone_orchestrator::SubmitRequest;

fn request(target: &str, options: Option<SshOptions>) -> SubmitRequest {
    SubmitRequest {
        mode: "remote".to_string(),
        ssh_target: Some(target.to_string()),
        ssh_options: options,
        ..SubmitRequest::default()
    }
}

#[test]
fn pid_comes_from_the_attempt_that_succeeded() {
    // launch fails once with a transport error, then prints a banner and the pid
    let launches = Arc::new(AtomicUsize::new(0));
    let counter = launches.clone();
    let remote = MockCommandRunner::new(move |spec, _| {
        if !is_launch(spec) {
            return Ok(CommandOutput::ok(""));
        }
        match counter.fetch_add(1, Ordering::SeqCst) {
            0 => Ok(CommandOutput {
                status: Some(255),
                stdout: "999\n".to_string(),
                stderr: "Connection reset by peer".to_string(),
            }),
            _ => Ok(CommandOutput::ok("Welcome to the cluster\n31337\n")),
        }
    });
    let h = harness_with(false, remote);
    let id = created_run(&h.service, &fdtd_spec(), "meep");

    let response = h
        .service
        .submit_run(&id, request("bob@gpu01", None))
        .unwrap();

    assert_eq!(response.job.pid, 31337);
    assert_eq!(launches.load(Ordering::SeqCst), 2);
    assert_eq!(response.status, RunStatus::Submitted);
}

#[test]
fn command_sequence_and_launch_line() {
    let h = harness_with(false, common::healthy_remote());
    let id = created_run(&h.service, &fdtd_spec(), "meep");

    h.service
        .submit_run(&id, request("bob@gpu01:/scratch/bob/runs", None))
        .unwrap();

    let calls = h.commands.calls();
    assert_eq!(calls.len(), 3);
    assert!(is_mkdir(&calls[0]));
    assert_eq!(
        calls[0].args.last().unwrap(),
        &format!("mkdir -p /scratch/bob/runs/run_{id}")
    );

    assert_eq!(calls[1].program, "scp");
    assert_eq!(calls[1].args[0], "-r");
    assert_eq!(
        calls[1].args.last().unwrap(),
        &format!("bob@gpu01:/scratch/bob/runs/run_{id}/")
    );
    assert!(calls[1].args.iter().any(|a| a.ends_with("spec.json")));

    let launch = calls[2].args.last().unwrap();
    assert!(is_launch(&calls[2]));
    assert!(launch.starts_with(&format!("cd /scratch/bob/runs/run_{id} && mkdir -p logs")));
    assert!(launch.contains("sunstone-worker --run-dir . --backend meep"));
    assert!(launch.contains("--monitor-interval-ms 1000 --monitor-window 200"));
    assert!(launch.contains("> logs/stdout.log 2> logs/stderr.log < /dev/null & echo $!"));
    assert!(calls.iter().all(|c| c.args.contains(&"BatchMode=yes".to_string())));

    let job = h.service.get_job(&id).unwrap();
    assert_eq!(job.ssh_target.as_deref(), Some("bob@gpu01"));
    assert_eq!(
        job.remote_path.as_deref(),
        Some(format!("/scratch/bob/runs/run_{id}").as_str())
    );
}

#[test]
fn authentication_options_reach_ssh_and_scp() {
    let h = harness_with(false, common::healthy_remote());
    let id = created_run(&h.service, &fdtd_spec(), "meep");
    let options = SshOptions {
        port: Some(2222),
        identity_file: Some("/home/bob/.ssh/id_cluster".to_string()),
        agent_forwarding: true,
        strict_host_key_checking: Some(false),
        known_hosts_file: Some("/dev/null".to_string()),
        connect_timeout_seconds: Some(5),
        extra: Some("-o ServerAliveInterval=30".to_string()),
    };

    h.service
        .submit_run(&id, request("bob@gpu01", Some(options.clone())))
        .unwrap();

    let calls = h.commands.calls();
    let ssh = &calls[0].args;
    let scp = &calls[1].args;
    let has_pair = |args: &[String], flag: &str, value: &str| {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    };

    assert!(has_pair(ssh, "-p", "2222"));
    assert!(has_pair(scp, "-P", "2222"));
    assert!(has_pair(ssh, "-i", "/home/bob/.ssh/id_cluster"));
    assert!(has_pair(scp, "-i", "/home/bob/.ssh/id_cluster"));
    assert!(ssh.contains(&"-A".to_string()));
    assert!(!scp.contains(&"-A".to_string()));
    assert!(has_pair(ssh, "-o", "StrictHostKeyChecking=no"));
    assert!(has_pair(ssh, "-o", "UserKnownHostsFile=/dev/null"));
    assert!(has_pair(ssh, "-o", "ConnectTimeout=5"));
    assert!(has_pair(ssh, "-o", "ServerAliveInterval=30"));

    let job = h.service.get_job(&id).unwrap();
    assert_eq!(job.ssh_port, Some(2222));
    assert_eq!(job.identity_file.as_deref(), Some("/home/bob/.ssh/id_cluster"));
    assert_eq!(job.ssh_options, Some(options));

    // cancel reuses the recorded connection options
    h.service.cancel_run(&id).unwrap();
    let kill = h.commands.calls().pop().unwrap();
    assert!(has_pair(&kill.args, "-p", "2222"));
    assert_eq!(kill.args.last().unwrap(), &format!("kill -TERM {}", job.pid));
}

#[test]
fn submit_requires_a_usable_target() {
    let h = harness_with(false, common::healthy_remote());
    let id = created_run(&h.service, &fdtd_spec(), "meep");
    let run_dir = h.service.store().run_dir(&id).unwrap();
    let spec_before = fs::read(run_dir.spec_json()).unwrap();

    let missing = SubmitRequest {
        mode: "ssh".to_string(),
        backend_options: Some(Map::new()),
        ..SubmitRequest::default()
    };
    let blank = SubmitRequest {
        ssh_target: Some("  ".to_string()),
        ..missing.clone()
    };
    let option_injection = SubmitRequest {
        ssh_target: Some("-oProxyCommand=touch".to_string()),
        ..missing.clone()
    };

    for request in [missing, blank, option_injection] {
        let err = h.service.submit_run(&id, request).unwrap_err();
        assert_eq!(err.http_status(), 400, "{err}");
    }
    let err = h
        .service
        .submit_run(
            &id,
            SubmitRequest {
                mode: "remote".to_string(),
                ..SubmitRequest::default()
            },
        )
        .unwrap_err();
    assert!(err.to_string().contains("ssh_target is required"));

    assert!(h.commands.calls().is_empty());
    assert_eq!(h.service.get_run(&id).unwrap().status, RunStatus::Created);
    assert_eq!(fs::read(run_dir.spec_json()).unwrap(), spec_before);
    assert!(!run_dir.environment_json().exists());
    assert!(!run_dir.backend_options_json().exists());
    assert!(!run_dir.job_json().exists());
}

#[test]
fn unparseable_pid_fails_the_launch() {
    let remote = MockCommandRunner::new(|spec, _| {
        if is_launch(spec) {
            Ok(CommandOutput::ok("nohup: ignoring input\n"))
        } else {
            Ok(CommandOutput::ok(""))
        }
    });
    let h = harness_with(false, remote);
    let id = created_run(&h.service, &fdtd_spec(), "meep");

    let err = h
        .service
        .submit_run(&id, request("bob@gpu01", None))
        .unwrap_err();
    assert!(err.to_string().contains("could not parse remote pid"));
    assert_eq!(h.service.get_run(&id).unwrap().status, RunStatus::Failed);
}

#[test]
fn transient_copy_failure_is_retried() {
    let copies = Arc::new(AtomicUsize::new(0));
    let counter = copies.clone();
    let remote = MockCommandRunner::new(move |spec, _| {
        if spec.program == "scp" && counter.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(CommandOutput::exit(1, "lost connection"));
        }
        Ok(common::respond_healthy(spec))
    });
    let h = harness_with(false, remote);
    let id = created_run(&h.service, &fdtd_spec(), "meep");

    let response = h
        .service
        .submit_run(&id, request("bob@gpu01", None))
        .unwrap();

    assert_eq!(copies.load(Ordering::SeqCst), 2);
    assert_eq!(response.job.pid, 4242);
    assert_eq!(h.service.get_job(&id).unwrap().pid, 4242);
}
