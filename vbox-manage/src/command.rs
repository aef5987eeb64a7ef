//! VBoxManage command construction and execution.
//!
//! [`VboxCommand`] is a builder for a single CLI invocation with consistent
//! error handling and logging. The actual child-process work sits behind the
//! [`CommandRunner`] trait so the state machine can be exercised against a
//! scripted runner in tests.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use regex::Regex;
use vbox_core::error::{Result, VboxError};

use crate::environment::ServiceDaemon;
use crate::retry::{self, RetryPolicy};

/// Name of the hypervisor control tool, resolved through `PATH`.
pub const VBOXMANAGE: &str = "VBoxManage";

/// How often a running child is checked against its deadline.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Combined output of a finished VBoxManage child, before error analysis.
#[derive(Debug, Clone)]
pub struct RawOutput {
    /// Whether the process itself exited zero.
    pub success: bool,
    /// Combined stdout+stderr with carriage returns stripped.
    pub text: String,
}

/// Executes `VBoxManage -q <args>` and captures combined output.
///
/// `timeout` of `None` waits indefinitely; otherwise the child is killed at
/// the deadline and the call fails with [`VboxError::Timeout`].
pub trait CommandRunner: Send + Sync {
    fn run(&self, args: &[String], timeout: Option<Duration>) -> Result<RawOutput>;
}

impl<T: CommandRunner + ?Sized> CommandRunner for Arc<T> {
    fn run(&self, args: &[String], timeout: Option<Duration>) -> Result<RawOutput> {
        (**self).run(args, timeout)
    }
}

/// Scan CLI output for the first embedded `(0x…)` hypervisor error code.
pub fn extract_error_code(output: &str) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\(0x([0-9A-Fa-f]{1,8})\)").expect("static regex"));
    let caps = re.captures(output)?;
    u32::from_str_radix(&caps[1], 16).ok()
}

/// Turn a finished child's output into the caller-facing result.
///
/// A zero exit is success. A non-zero exit yields the parsed `(0x…)` code
/// when the output carries one, and a generic command failure otherwise.
pub fn interpret(raw: RawOutput) -> Result<String> {
    if raw.success {
        return Ok(raw.text);
    }
    match extract_error_code(&raw.text) {
        Some(code) => Err(VboxError::Hypervisor {
            code,
            output: raw.text,
        }),
        None => Err(VboxError::Command(raw.text)),
    }
}

/// Runs the real `VBoxManage` binary as a child process.
pub struct SystemRunner {
    service: Option<Arc<ServiceDaemon>>,
}

impl SystemRunner {
    pub fn new() -> Result<Self> {
        if which::which(VBOXMANAGE).is_err() {
            return Err(VboxError::Dependency(VBOXMANAGE.into()));
        }
        Ok(Self { service: None })
    }

    /// Runner for sandboxed jobs that must keep `VBoxSVC` alive themselves.
    pub fn with_service_daemon(service: Arc<ServiceDaemon>) -> Result<Self> {
        let mut runner = Self::new()?;
        runner.service = Some(service);
        Ok(runner)
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, args: &[String], timeout: Option<Duration>) -> Result<RawOutput> {
        // A sandboxed service daemon may have been shut down for being idle;
        // relaunch it so this invocation inherits the intended environment.
        if let Some(service) = &self.service {
            service.ensure_running();
        }

        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push("-q".to_string());
        argv.extend(args.iter().cloned());

        let handle = duct::cmd(VBOXMANAGE, argv)
            .stdout_capture()
            .stderr_to_stdout()
            .unchecked()
            .start()
            .map_err(VboxError::Spawn)?;

        let deadline = timeout.map(|t| (Instant::now() + t, t.as_secs()));
        loop {
            if let Some(output) = handle.try_wait()? {
                return Ok(RawOutput {
                    success: output.status.success(),
                    text: String::from_utf8_lossy(&output.stdout).replace('\r', ""),
                });
            }
            if let Some((at, seconds)) = deadline {
                if Instant::now() >= at {
                    let _ = handle.kill();
                    return Err(VboxError::Timeout { seconds });
                }
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }
    }
}

/// Handle on the hypervisor CLI: a command runner plus the retry policy
/// applied to invocations that opt in.
pub struct VboxManage {
    runner: Box<dyn CommandRunner>,
    retry: RetryPolicy,
}

impl VboxManage {
    pub fn new(runner: Box<dyn CommandRunner>) -> Self {
        Self::with_policy(runner, RetryPolicy::default())
    }

    pub fn with_policy(runner: Box<dyn CommandRunner>, retry: RetryPolicy) -> Self {
        Self { runner, retry }
    }

    /// Start building an invocation. `operation` names the step in error
    /// reports ("register", "create new snapshot", …).
    pub fn command(&self, operation: &'static str) -> VboxCommand<'_> {
        VboxCommand {
            runner: self.runner.as_ref(),
            retry: &self.retry,
            operation,
            args: Vec::new(),
            log_error: true,
            retry_failures: true,
            timeout: None,
        }
    }
}

/// Builder for a single VBoxManage invocation.
///
/// By default failures are retried under the session-lock policy and the
/// final failure is logged with the full arguments and output. Discovery
/// probes downgrade both with [`VboxCommand::probe`].
pub struct VboxCommand<'m> {
    runner: &'m dyn CommandRunner,
    retry: &'m RetryPolicy,
    operation: &'static str,
    args: Vec<String>,
    log_error: bool,
    retry_failures: bool,
    timeout: Option<Duration>,
}

impl VboxCommand<'_> {
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
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

    /// Discovery probe: failure is an answer, not an error to log or retry.
    pub fn probe(mut self) -> Self {
        self.log_error = false;
        self.retry_failures = false;
        self
    }

    /// Log the final failure but do not retry.
    pub fn no_retry(mut self) -> Self {
        self.retry_failures = false;
        self
    }

    /// Kill the child if it has not exited after `secs` seconds.
    /// Zero means wait indefinitely.
    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = if secs == 0 {
            None
        } else {
            Some(Duration::from_secs(secs))
        };
        self
    }

    pub fn run(self) -> Result<String> {
        retry::execute(
            self.runner,
            self.retry,
            self.operation,
            &self.args,
            self.log_error,
            self.retry_failures,
            self.timeout,
        )
    }
}
