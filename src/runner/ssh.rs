//! Remote workers over SSH.
//!
//! Launch protocol, each step retried with backoff:
//! 1. `ssh target "mkdir -p <remote_path>"`
//! 2. `scp -r <run dir entries> target:<remote_path>/`
//! 3. `ssh target "cd <remote_path> && ... nohup <worker> ... & echo $!"`
//!
//! The pid printed by step 3 is the only handle we keep; cancel and the
//! liveness probe both address it on the recorded target.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use sunstone_core::{JobMode, JobRecord, RunRecord, SshOptions};

use crate::config::defaults::{DEFAULT_REMOTE_BASE, DEFAULT_REMOTE_WORKER};

use super::command::{run_with_retry, CommandError, CommandRunner, CommandSpec, RetryPolicy};
use super::{
    CancelError, JobRunner, LaunchError, LaunchOptions, Liveness, RemoteStep, WorkerFlags,
};

const DEFAULT_CONNECT_TIMEOUT_SECONDS: u32 = 10;
/// Exit status ssh uses for its own (transport) failures.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Parsed `user@host[:base_path]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub base_path: Option<String>,
}

impl SshTarget {
    pub fn parse(raw: &str) -> Result<Self, LaunchError> {
        let raw = raw.trim();
        let (host, base) = match raw.split_once(':') {
            Some((host, base)) => (host, Some(base)),
            None => (raw, None),
        };
        let valid_host = !host.is_empty()
            && !host.starts_with('-')
            && !host.chars().any(char::is_whitespace);
        if !valid_host {
            return Err(LaunchError::InvalidTarget(raw.to_string()));
        }
        Ok(Self {
            host: host.to_string(),
            base_path: base
                .map(|b| b.trim_end_matches('/').to_string())
                .filter(|b| !b.is_empty()),
        })
    }
}

/// Quote `s` for a POSIX shell. Plain words pass through unchanged so a
/// leading `~` still expands.
pub fn shell_quote(s: &str) -> String {
    let plain = !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./~+=:@,%".contains(c));
    if plain {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r#"'\''"#))
    }
}

/// Flags shared by ssh and scp. Only the port flag differs (`-p` / `-P`).
fn client_args(options: &SshOptions, port_flag: &str, agent_forwarding: bool) -> Vec<String> {
    let timeout = options
        .connect_timeout_seconds
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECONDS);
    let mut args = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={timeout}"),
    ];
    if let Some(port) = options.port {
        args.push(port_flag.to_string());
        args.push(port.to_string());
    }
    if let Some(identity) = &options.identity_file {
        args.push("-i".to_string());
        args.push(identity.clone());
    }
    if agent_forwarding && options.agent_forwarding {
        args.push("-A".to_string());
    }
    if let Some(strict) = options.strict_host_key_checking {
        args.push("-o".to_string());
        args.push(format!(
            "StrictHostKeyChecking={}",
            if strict { "yes" } else { "no" }
        ));
    }
    if let Some(known_hosts) = &options.known_hosts_file {
        args.push("-o".to_string());
        args.push(format!("UserKnownHostsFile={known_hosts}"));
    }
    if let Some(extra) = &options.extra {
        args.extend(extra.split_whitespace().map(str::to_string));
    }
    args
}

pub struct SshRunner {
    commands: Arc<dyn CommandRunner>,
    retry: RetryPolicy,
    timeout: Duration,
    remote_worker: String,
    remote_base: String,
    flags: Option<WorkerFlags>,
}

impl SshRunner {
    pub fn new(commands: Arc<dyn CommandRunner>) -> Self {
        Self {
            commands,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(120),
            remote_worker: DEFAULT_REMOTE_WORKER.to_string(),
            remote_base: DEFAULT_REMOTE_BASE.to_string(),
            flags: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_remote_worker(mut self, command: String) -> Self {
        self.remote_worker = command;
        self
    }

    pub fn with_remote_base(mut self, base: String) -> Self {
        self.remote_base = base;
        self
    }

    pub fn with_flags(mut self, flags: WorkerFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    fn ssh(&self, host: &str, options: &SshOptions, remote_command: String) -> CommandSpec {
        CommandSpec::new("ssh")
            .args(client_args(options, "-p", true))
            .arg(host)
            .arg(remote_command)
            .with_timeout(self.timeout)
    }

    fn scp(&self, sources: Vec<String>, destination: String, options: &SshOptions) -> CommandSpec {
        CommandSpec::new("scp")
            .arg("-r")
            .args(client_args(options, "-P", false))
            .args(sources)
            .arg(destination)
            .with_timeout(self.timeout)
    }

    fn step(&self, step: RemoteStep, spec: &CommandSpec) -> Result<String, LaunchError> {
        run_with_retry(self.commands.as_ref(), spec, self.retry)
            .map(|out| out.stdout)
            .map_err(|source| LaunchError::Remote { step, source })
    }

    fn job_options(job: &JobRecord) -> SshOptions {
        let mut options = job.ssh_options.clone().unwrap_or_default();
        options.port = options.port.or(job.ssh_port);
        options.identity_file = options.identity_file.or_else(|| job.identity_file.clone());
        options
    }

    /// Run `kill -<signal> <pid>` on the job's host, single attempt.
    fn signal(&self, job: &JobRecord, host: &str, signal: &str) -> Result<(), CommandError> {
        let spec = self.ssh(
            host,
            &Self::job_options(job),
            format!("kill -{signal} {}", job.pid),
        );
        self.commands.run_checked(&spec).map(|_| ())
    }
}

fn parse_pid(stdout: &str) -> Option<u32> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()?
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid > 0)
}

impl JobRunner for SshRunner {
    fn mode(&self) -> JobMode {
        JobMode::Ssh
    }

    fn submit(
        &self,
        run: &RunRecord,
        run_dir: &Path,
        backend: &str,
        options: &LaunchOptions,
    ) -> Result<JobRecord, LaunchError> {
        let raw_target = options
            .ssh_target
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or(LaunchError::MissingTarget)?;
        let target = SshTarget::parse(raw_target)?;
        let ssh_options = &options.ssh_options;

        let base = target
            .base_path
            .clone()
            .unwrap_or_else(|| self.remote_base.trim_end_matches('/').to_string());
        let remote_path = format!("{base}/run_{}", run.id);
        let quoted_path = shell_quote(&remote_path);

        // 1. remote directory
        self.step(
            RemoteStep::CreateDirectory,
            &self.ssh(&target.host, ssh_options, format!("mkdir -p {quoted_path}")),
        )?;

        // 2. run directory contents
        let mut entries: Vec<String> = fs::read_dir(run_dir)?
            .filter_map(Result::ok)
            .map(|e| e.path().display().to_string())
            .collect();
        entries.sort();
        if !entries.is_empty() {
            self.step(
                RemoteStep::CopyRunDirectory,
                &self.scp(entries, format!("{}:{remote_path}/", target.host), ssh_options),
            )?;
        }

        // 3. detached worker; `$!` inside the braces is the worker itself.
        let flags = self
            .flags
            .map(|f| format!(" {}", f.to_args().join(" ")))
            .unwrap_or_default();
        let launch = format!(
            "cd {quoted_path} && mkdir -p logs && {{ nohup {worker} --run-dir . --backend {backend}{flags} \
             > logs/stdout.log 2> logs/stderr.log < /dev/null & echo $!; }}",
            worker = self.remote_worker,
            backend = shell_quote(backend),
        );
        let stdout = self.step(
            RemoteStep::StartWorker,
            &self.ssh(&target.host, ssh_options, launch),
        )?;
        let pid = parse_pid(&stdout).ok_or_else(|| LaunchError::InvalidPid(stdout.clone()))?;

        info!(
            run_id = %run.id,
            host = %target.host,
            remote_path = %remote_path,
            pid,
            "remote worker started"
        );

        let mut job = JobRecord::new(pid, backend, JobMode::Ssh);
        job.remote_path = Some(remote_path);
        job.ssh_target = Some(target.host);
        job.ssh_port = ssh_options.port;
        job.identity_file = ssh_options.identity_file.clone();
        job.ssh_options = Some(ssh_options.clone());
        Ok(job)
    }

    fn cancel(&self, job: &JobRecord) -> Result<(), CancelError> {
        let host = job
            .ssh_target
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or(CancelError::MissingRemoteTarget)?;
        if job.pid == 0 {
            return Err(CancelError::MissingPid);
        }
        match self.signal(job, host, "TERM") {
            Ok(()) => {
                info!(host, pid = job.pid, "sent TERM to remote worker");
                Ok(())
            }
            Err(term_err) => {
                warn!(host, pid = job.pid, error = %term_err, "TERM failed; escalating to KILL");
                self.signal(job, host, "KILL").map_err(|source| CancelError::Remote {
                    pid: job.pid,
                    source,
                })
            }
        }
    }

    fn probe(&self, job: &JobRecord) -> Liveness {
        let Some(host) = job.ssh_target.as_deref().filter(|h| !h.is_empty()) else {
            return Liveness::unknown("job record has no ssh_target");
        };
        if job.pid == 0 {
            return Liveness::NotRunning;
        }
        let spec = self.ssh(host, &Self::job_options(job), format!("kill -0 {}", job.pid));

        let attempts = self.retry.max_attempts.max(1);
        let mut delay = self.retry.base_delay;
        let mut last_reason = String::new();
        for attempt in 1..=attempts {
            match self.commands.run(&spec) {
                Ok(out) if out.success() => return Liveness::Running,
                Ok(out) if out.status.is_some() && out.status != Some(SSH_TRANSPORT_FAILURE) => {
                    return Liveness::NotRunning
                }
                Ok(out) => {
                    last_reason = format!("ssh exited with {:?}: {}", out.status, out.stderr.trim())
                }
                Err(e) => last_reason = e.to_string(),
            }
            if attempt < attempts {
                std::thread::sleep(delay);
                delay = delay.saturating_mul(2);
            }
        }
        warn!(host, pid = job.pid, reason = %last_reason, "liveness probe inconclusive");
        Liveness::unknown(last_reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::command::{CommandOutput, MockCommandRunner};

    #[test]
    fn target_parsing() {
        let t = SshTarget::parse("alice@cluster:/scratch/alice/").unwrap();
        assert_eq!(t.host, "alice@cluster");
        assert_eq!(t.base_path.as_deref(), Some("/scratch/alice"));

        let t = SshTarget::parse("bob@node7").unwrap();
        assert_eq!(t.base_path, None);

        assert!(SshTarget::parse("").is_err());
        assert!(SshTarget::parse("-oProxyCommand=x").is_err());
        assert!(SshTarget::parse("a b@c").is_err());
    }

    #[test]
    fn quoting() {
        assert_eq!(shell_quote("~/sunstone_runs/run_1"), "~/sunstone_runs/run_1");
        assert_eq!(shell_quote("/data/my runs"), "'/data/my runs'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn pid_from_last_non_empty_line() {
        assert_eq!(parse_pid("Welcome to node7\n4242\n\n"), Some(4242));
        assert_eq!(parse_pid("motd\n"), None);
        assert_eq!(parse_pid("0\n"), None);
    }

    #[test]
    fn client_args_compose_options() {
        let options = SshOptions {
            port: Some(2222),
            identity_file: Some("/home/u/.ssh/id_ed25519".into()),
            agent_forwarding: true,
            strict_host_key_checking: Some(false),
            known_hosts_file: Some("/tmp/kh".into()),
            connect_timeout_seconds: Some(5),
            extra: Some("-o ServerAliveInterval=15".into()),
        };
        let ssh = client_args(&options, "-p", true);
        assert!(ssh.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(ssh.windows(2).any(|w| w == ["-i", "/home/u/.ssh/id_ed25519"]));
        assert!(ssh.contains(&"-A".to_string()));
        assert!(ssh.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(ssh.contains(&"UserKnownHostsFile=/tmp/kh".to_string()));
        assert!(ssh.contains(&"ConnectTimeout=5".to_string()));
        assert!(ssh.contains(&"ServerAliveInterval=15".to_string()));

        let scp = client_args(&options, "-P", false);
        assert!(scp.windows(2).any(|w| w == ["-P", "2222"]));
        assert!(!scp.contains(&"-A".to_string()));
    }

    #[test]
    fn probe_distinguishes_exit_codes() {
        let mut job = JobRecord::new(99, "dummy", JobMode::Ssh);
        job.ssh_target = Some("u@h".into());
        let fast = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        };

        let running = SshRunner::new(Arc::new(MockCommandRunner::always(""))).with_retry(fast);
        assert_eq!(running.probe(&job), Liveness::Running);

        let gone = SshRunner::new(Arc::new(MockCommandRunner::new(|_, _| {
            Ok(CommandOutput::exit(1, "No such process"))
        })))
        .with_retry(fast);
        assert_eq!(gone.probe(&job), Liveness::NotRunning);

        let unreachable = SshRunner::new(Arc::new(MockCommandRunner::new(|_, _| {
            Ok(CommandOutput::exit(255, "Connection timed out"))
        })))
        .with_retry(fast);
        assert_eq!(unreachable.probe(&job).as_option(), None);
    }
}
