//! External command execution for the remote runner.
//!
//! - `CommandRunner`: interface used by the SSH runner
//! - `SystemCommandRunner`: spawns real processes under a timeout
//! - `MockCommandRunner`: scripted responses for tests
//! - `run_with_retry`: bounded retry with doubling delay

use std::io::{self, Read};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const WAIT_POLL: Duration = Duration::from_millis(20);

/// One program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Space-joined form for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Output of a process that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn exit(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with status {status:?}: {stderr}")]
    Failed {
        program: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("giving up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<CommandError>,
    },
}

pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is still `Ok`; only failures to
    /// run at all are errors.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;

    /// Run and treat a non-zero exit as [`CommandError::Failed`].
    fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let output = self.run(spec)?;
        if output.success() {
            Ok(output)
        } else {
            Err(CommandError::Failed {
                program: spec.program.clone(),
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

/// Run `spec` until it succeeds or `policy.max_attempts` is reached, doubling
/// the delay after each failure.
pub fn run_with_retry(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
    policy: RetryPolicy,
) -> Result<CommandOutput, CommandError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut delay = policy.base_delay;
    let mut attempt = 1;
    loop {
        match runner.run_checked(spec) {
            Ok(output) => return Ok(output),
            Err(e) if attempt >= max_attempts => {
                return Err(CommandError::Exhausted {
                    attempts: attempt,
                    last: Box::new(e),
                })
            }
            Err(e) => {
                warn!(
                    program = %spec.program,
                    attempt,
                    max_attempts,
                    error = %e,
                    "command failed; retrying"
                );
                thread::sleep(delay);
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
        }
    }
}

/// Runs real processes.
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn wait_with_deadline(
    child: &mut Child,
    spec: &CommandSpec,
) -> Result<Option<std::process::ExitStatus>, CommandError> {
    let io_err = |source| CommandError::Io {
        program: spec.program.clone(),
        source,
    };
    let Some(timeout) = spec.timeout else {
        return child.wait().map(Some).map_err(io_err);
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().map_err(io_err)? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(WAIT_POLL);
    }
}

impl CommandRunner for SystemCommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        debug!(command = %spec.display(), "running");
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let status = wait_with_deadline(&mut child, spec)?;
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        match status {
            Some(status) => Ok(CommandOutput {
                status: status.code(),
                stdout,
                stderr,
            }),
            None => Err(CommandError::Timeout {
                program: spec.program.clone(),
                timeout: spec.timeout.unwrap_or_default(),
            }),
        }
    }
}

type Responder = dyn Fn(&CommandSpec, usize) -> Result<CommandOutput, CommandError> + Send + Sync;

/// Scripted runner for tests. The responder receives each spec and the
/// zero-based index of the call.
pub struct MockCommandRunner {
    responder: Box<Responder>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl MockCommandRunner {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&CommandSpec, usize) -> Result<CommandOutput, CommandError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every command succeeds with `stdout`.
    pub fn always(stdout: &str) -> Self {
        let stdout = stdout.to_string();
        Self::new(move |_, _| Ok(CommandOutput::ok(stdout.clone())))
    }

    /// Commands received so far, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl CommandRunner for MockCommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let index = match self.calls.lock() {
            Ok(mut calls) => {
                calls.push(spec.clone());
                calls.len() - 1
            }
            Err(_) => 0,
        };
        (self.responder)(spec, index)
    }
}
