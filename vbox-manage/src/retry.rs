//! Retry controller for transient hypervisor failures.
//!
//! VBoxManage holds the VM session lock only for the duration of each
//! invocation, so a concurrently running management UI can grab it in
//! between and hold it for a while. That condition surfaces as error code
//! `0x80bb0007` and is worth retrying with an exponential backoff; all other
//! failures are retried at the base interval when the caller opted in.

use std::time::Duration;

use tracing::{error, warn};
use vbox_core::error::Result;

use crate::command::{self, CommandRunner};

/// Operator note accumulated when the session lock is observed. Appended to
/// the failure report so the volunteer can see why the job aborted.
pub const SESSION_LOCK_NOTE: &str =
    "Another VirtualBox management application has locked the session for\n\
     this VM. The wrapper cannot properly monitor this VM\n\
     and so this job will be aborted.\n";

/// Backoff policy for retryable invocations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed, the initial one included.
    pub max_attempts: u32,
    /// Sleep before the first re-attempt; doubled on repeated lock
    /// contention.
    pub initial_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
        }
    }
}

pub(crate) fn execute(
    runner: &dyn CommandRunner,
    policy: &RetryPolicy,
    operation: &'static str,
    args: &[String],
    log_error: bool,
    retry_failures: bool,
    timeout: Option<Duration>,
) -> Result<String> {
    let mut sleep_interval = policy.initial_interval;
    let mut attempts = 0u32;
    let mut notes = String::new();

    loop {
        attempts += 1;
        let attempt = runner
            .run(args, timeout)
            .and_then(command::interpret);

        let err = match attempt {
            Ok(text) => {
                if !notes.is_empty() {
                    // Recovered after lock contention; leave a trace for the
                    // operator anyway.
                    warn!("{}", notes.trim_end());
                }
                return Ok(text);
            }
            Err(err) => err,
        };

        if err.is_session_locked() {
            if notes.is_empty() {
                notes.push_str(SESSION_LOCK_NOTE);
            }
            if attempts > 1 {
                sleep_interval *= 2;
            }
        }

        if !retry_failures || attempts >= policy.max_attempts {
            if log_error {
                let code = err.hypervisor_code().unwrap_or(0);
                let output = err.output().unwrap_or_default();
                let notes_section = if notes.is_empty() {
                    String::new()
                } else {
                    format!("\nNotes:\n\n{}", notes)
                };
                error!(
                    "Error in {} for VM: 0x{:08x}\nArguments:\n{}\nOutput:\n{}{}",
                    operation,
                    code,
                    args.join(" "),
                    output,
                    notes_section
                );
            }
            return Err(err);
        }

        std::thread::sleep(sleep_interval);
    }
}
