//! Sunstone CLI
//!
//! Entry point for the `sunstone` command-line tool. Every command prints
//! JSON on stdout; diagnostics go to stderr through `tracing`.

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;
use sunstone_core::{LogStream, SshOptions};
use sunstone_orchestrator::{Disconnect, RunService, ServiceError, Settings, SubmitRequest};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sunstone")]
#[command(about = "Simulation run orchestration", version)]
struct Cli {
    /// Settings file (TOML); defaults to $SUNSTONE_CONFIG
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    /// Data directory holding projects/ and runs/
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Permit launching workers on this machine
    #[arg(long, global = true)]
    allow_local: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Project management
    Project {
        #[command(subcommand)]
        action: ProjectCommands,
    },

    /// Run lifecycle and inspection
    Run {
        #[command(subcommand)]
        action: RunCommands,
    },

    /// Backend capability catalog
    Backends {
        #[command(subcommand)]
        action: BackendCommands,
    },

    /// Print the resolved settings and where they came from
    Config,
}

#[derive(Subcommand)]
enum ProjectCommands {
    Create { name: String },
    List,
    Get { id: String },
}

#[derive(Subcommand)]
enum RunCommands {
    /// Create a run from a JSON simulation spec
    Create {
        project_id: String,

        /// Spec file, or `-` for stdin
        #[arg(long, short = 's')]
        spec: PathBuf,

        #[arg(long, short = 'b')]
        backend: Option<String>,
    },

    List { project_id: String },

    Get { id: String },

    /// Validate and launch a run
    Submit(SubmitArgs),

    Cancel { id: String },

    /// Print the Job Record
    Job { id: String },

    /// Job Record plus a liveness probe
    JobStatus { id: String },

    /// Emit job events until interrupted
    Stream {
        id: String,

        #[arg(long)]
        interval_ms: Option<u64>,

        #[arg(long)]
        max_events: Option<usize>,

        /// Frame events as server-sent events instead of JSON lines
        #[arg(long)]
        sse: bool,
    },

    Logs {
        id: String,

        #[arg(long, default_value = "stdout")]
        stream: LogStream,

        #[arg(long, default_value_t = 200)]
        tail: usize,
    },

    /// Resource sample window written by the worker
    Resource { id: String },

    Artifacts {
        id: String,

        /// Print the absolute path of one artifact instead of listing
        #[arg(long)]
        resolve: Option<String>,
    },
}

#[derive(Args)]
struct SubmitArgs {
    id: String,

    /// local, ssh (remote) or batch (slurm)
    #[arg(long, short = 'm', default_value = "local")]
    mode: String,

    #[arg(long, short = 'b')]
    backend: Option<String>,

    /// Backend options as inline JSON or @file
    #[arg(long)]
    options: Option<String>,

    /// Worker executable for local runs
    #[arg(long)]
    executable: Option<PathBuf>,

    /// user@host[:path]
    #[arg(long)]
    ssh_target: Option<String>,

    #[arg(long)]
    ssh_port: Option<u16>,

    #[arg(long)]
    identity_file: Option<String>,

    #[arg(long)]
    agent_forwarding: bool,

    #[arg(long)]
    strict_host_key_checking: Option<bool>,

    #[arg(long)]
    known_hosts_file: Option<String>,

    #[arg(long)]
    connect_timeout: Option<u32>,

    /// Extra ssh arguments, split on whitespace
    #[arg(long)]
    ssh_extra: Option<String>,
}

#[derive(Subcommand)]
enum BackendCommands {
    List,
    Show { name: String },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let mut overrides = Map::new();
    if let Some(dir) = &cli.data_dir {
        overrides.insert("data_dir".to_string(), json!(dir));
    }
    if cli.allow_local {
        overrides.insert("allow_local_execution".to_string(), json!(true));
    }
    let overrides = (!overrides.is_empty()).then_some(Value::Object(overrides));

    let loaded = match Settings::load(cli.config.as_deref(), overrides) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error loading settings: {e}");
            process::exit(1);
        }
    };
    debug!(sources = loaded.sources.len(), data_dir = %loaded.settings.data_dir.display(), "settings resolved");

    if let Commands::Config = cli.command {
        print_json(&loaded);
        return;
    }

    let service = match RunService::from_settings(loaded.settings) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Error loading backend catalog: {e}");
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Project { action } => run_project(&service, action),
        Commands::Run { action } => run_run(&service, action),
        Commands::Backends { action } => run_backends(&service, action),
        Commands::Config => Ok(()),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(exit_code(&e));
    }
}

/// 2 for bad requests, 3 for forbidden, 4 for not found, 1 otherwise.
fn exit_code(err: &ServiceError) -> i32 {
    match err.http_status() {
        400 => 2,
        403 => 3,
        404 => 4,
        _ => 1,
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => {
            eprintln!("Error serializing output: {e}");
            process::exit(1);
        }
    }
}

fn run_project(service: &RunService, action: ProjectCommands) -> Result<(), ServiceError> {
    match action {
        ProjectCommands::Create { name } => print_json(&service.create_project(&name)?),
        ProjectCommands::List => print_json(&service.list_projects()?),
        ProjectCommands::Get { id } => print_json(&service.get_project(&id)?),
    }
    Ok(())
}

fn read_spec(path: &Path) -> Result<Value, ServiceError> {
    let text = if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| ServiceError::InvalidRequest(format!("cannot read spec from stdin: {e}")))?;
        buf
    } else {
        fs::read_to_string(path).map_err(|e| {
            ServiceError::InvalidRequest(format!("cannot read spec {}: {e}", path.display()))
        })?
    };
    serde_json::from_str(&text)
        .map_err(|e| ServiceError::InvalidRequest(format!("spec is not valid JSON: {e}")))
}

fn parse_options(raw: &str) -> Result<Map<String, Value>, ServiceError> {
    let text = match raw.strip_prefix('@') {
        Some(path) => fs::read_to_string(path).map_err(|e| {
            ServiceError::InvalidRequest(format!("cannot read options file {path}: {e}"))
        })?,
        None => raw.to_string(),
    };
    match serde_json::from_str(&text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ServiceError::InvalidRequest(
            "backend options must be a JSON object".to_string(),
        )),
        Err(e) => Err(ServiceError::InvalidRequest(format!(
            "backend options are not valid JSON: {e}"
        ))),
    }
}

fn submit_request(args: SubmitArgs) -> Result<SubmitRequest, ServiceError> {
    let backend_options = args.options.as_deref().map(parse_options).transpose()?;
    let ssh_options = SshOptions {
        port: args.ssh_port,
        identity_file: args.identity_file,
        agent_forwarding: args.agent_forwarding,
        strict_host_key_checking: args.strict_host_key_checking,
        known_hosts_file: args.known_hosts_file,
        connect_timeout_seconds: args.connect_timeout,
        extra: args.ssh_extra,
    };
    Ok(SubmitRequest {
        mode: args.mode,
        backend: args.backend,
        backend_options,
        executable: args.executable,
        ssh_target: args.ssh_target,
        ssh_options: (ssh_options != SshOptions::default()).then_some(ssh_options),
    })
}

fn run_run(service: &RunService, action: RunCommands) -> Result<(), ServiceError> {
    match action {
        RunCommands::Create {
            project_id,
            spec,
            backend,
        } => {
            let spec = read_spec(&spec)?;
            print_json(&service.create_run(&project_id, &spec, backend.as_deref())?);
        }
        RunCommands::List { project_id } => print_json(&service.list_runs(&project_id)?),
        RunCommands::Get { id } => print_json(&service.get_run(&id)?),
        RunCommands::Submit(args) => {
            let id = args.id.clone();
            let request = submit_request(args)?;
            print_json(&service.submit_run(&id, request)?);
        }
        RunCommands::Cancel { id } => print_json(&service.cancel_run(&id)?),
        RunCommands::Job { id } => print_json(&service.get_job(&id)?),
        RunCommands::JobStatus { id } => print_json(&service.get_job_status(&id)?),
        RunCommands::Stream {
            id,
            interval_ms,
            max_events,
            sse,
        } => run_stream(service, &id, interval_ms, max_events, sse)?,
        RunCommands::Logs { id, stream, tail } => {
            print_json(&service.get_logs(&id, stream, tail)?)
        }
        RunCommands::Resource { id } => print_json(&service.get_resource(&id)?),
        RunCommands::Artifacts { id, resolve } => match resolve {
            Some(rel) => print_json(&json!({ "path": service.artifact_path(&id, &rel)? })),
            None => print_json(&service.list_artifacts(&id)?),
        },
    }
    Ok(())
}

fn run_stream(
    service: &RunService,
    id: &str,
    interval_ms: Option<u64>,
    max_events: Option<usize>,
    sse: bool,
) -> Result<(), ServiceError> {
    let disconnect = Disconnect::new();
    let on_interrupt = disconnect.clone();
    if let Err(e) = ctrlc::set_handler(move || on_interrupt.trigger()) {
        warn!(error = %e, "could not install interrupt handler");
    }

    let stream = service.stream_job(
        id,
        interval_ms.map(Duration::from_millis),
        max_events,
        disconnect.clone(),
    )?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    for event in stream {
        let frame = if sse {
            event.to_sse()
        } else {
            serde_json::to_string(&event).map(|line| format!("{line}\n"))
        };
        let written = match frame {
            Ok(frame) => out.write_all(frame.as_bytes()).and_then(|_| out.flush()),
            Err(e) => {
                warn!(error = %e, "could not serialize job event");
                continue;
            }
        };
        // A closed pipe is a disconnect.
        if written.is_err() {
            disconnect.trigger();
        }
    }
    Ok(())
}

fn run_backends(service: &RunService, action: BackendCommands) -> Result<(), ServiceError> {
    match action {
        BackendCommands::List => print_json(&service.list_backends()),
        BackendCommands::Show { name } => print_json(&service.get_backend(&name)?),
    }
    Ok(())
}
