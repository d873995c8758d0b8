//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use sunstone_orchestrator::runner::{CommandOutput, CommandSpec, MockCommandRunner};
use sunstone_orchestrator::{RunService, Runners, Settings, StaticCatalog};
use tempfile::TempDir;

pub struct Harness {
    pub tmp: TempDir,
    pub service: RunService,
    pub commands: Arc<MockCommandRunner>,
}

pub fn settings(tmp: &TempDir, allow_local: bool) -> Settings {
    let mut settings = Settings {
        data_dir: tmp.path().join("data"),
        allow_local_execution: allow_local,
        ..Settings::default()
    };
    settings.retry.base_delay_ms = 1;
    settings
}

/// Service whose remote commands go through `commands`.
pub fn harness_with(allow_local: bool, commands: MockCommandRunner) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let settings = settings(&tmp, allow_local);
    let commands = Arc::new(commands);
    let runners = Arc::new(Runners::with_command_runner(&settings, commands.clone()));
    let service = RunService::new(settings, Arc::new(StaticCatalog::builtin()), runners);
    Harness {
        tmp,
        service,
        commands,
    }
}

/// Remote host that accepts everything and reports pid 4242 at launch.
pub fn healthy_remote() -> MockCommandRunner {
    MockCommandRunner::new(|spec, _| Ok(respond_healthy(spec)))
}

pub fn respond_healthy(spec: &CommandSpec) -> CommandOutput {
    if is_launch(spec) {
        CommandOutput::ok("4242\n")
    } else {
        CommandOutput::ok("")
    }
}

pub fn is_launch(spec: &CommandSpec) -> bool {
    spec.program == "ssh" && spec.args.last().is_some_and(|a| a.contains("nohup"))
}

pub fn is_mkdir(spec: &CommandSpec) -> bool {
    spec.program == "ssh" && spec.args.last().is_some_and(|a| a.starts_with("mkdir -p"))
}

pub fn is_kill(spec: &CommandSpec, signal: &str) -> bool {
    spec.program == "ssh"
        && spec
            .args
            .last()
            .is_some_and(|a| a.starts_with(&format!("kill -{signal} ")))
}

pub fn fdtd_spec() -> Value {
    json!({
        "domain": {"size": [1.0, 1.0, 0.0]},
        "boundary_conditions": [
            {"face": "nx", "type": "pml"},
            {"face": "px", "type": "pml"}
        ],
        "materials": {
            "si": {"eps": 12.0},
            "gold": {"model": "drude", "eps_inf": 1.0}
        },
        "sources": [{"type": "gaussian_pulse", "center_freq": 1.0}],
        "monitors": [{"id": "m1", "type": "point"}]
    })
}

/// A project with one `created` run; returns the run id.
pub fn created_run(service: &RunService, spec: &Value, backend: &str) -> String {
    let project = service.create_project("waveguides").unwrap();
    service
        .create_run(&project.id, spec, Some(backend))
        .unwrap()
        .id
}
