//! Power-state lifecycle for the guest.
//!
//! Transitions are observed, not asserted: each action issues a CLI command
//! and then polls until the observed state matches the intent, within a time
//! budget. Waits are capped with absolute deadlines so a slow CLI does not
//! silently extend them.

use std::thread;
use std::time::Instant;

use tracing::{error, info};
use vbox_core::error::{Result, VboxError};

use crate::VboxVm;

impl VboxVm {
    /// Bring the guest up: register it if needed (recovering a stale prior
    /// registration first), restore the last checkpoint when resuming a job
    /// in progress, and start it.
    pub fn run(&mut self, elapsed_time: f64) -> Result<()> {
        if !self.is_registered() {
            if self.is_hdd_registered() {
                // A previous instance of this slot's VM was initialized but
                // aborted while the task was suspended and unloaded.
                self.deregister_stale_vm()?;
            }
            self.register_vm()?;
        }

        // Registration-only jobs are done here; the distinguished error
        // tells the outer wrapper to stop processing.
        if self.descriptor.register_only {
            return Err(VboxError::RegisterOnly);
        }

        // When restarting an already registered VM the name may still be
        // stale; repopulate it so every subsequent command addresses the
        // right machine.
        self.vm_name = self.descriptor.master_name.clone();

        self.poll(false);
        if self.online {
            self.poweroff()?;
        }

        // A non-zero elapsed time means a checkpoint exists to resume from.
        if elapsed_time > 0.0 {
            self.restoresnapshot()?;
        }

        self.start()
    }

    /// Start the VM and wait for it to come online.
    pub fn start(&mut self) -> Result<()> {
        info!("Starting VM.");
        let mut command = self
            .manage
            .command("start VM")
            .args(["startvm", self.vm_name.as_str()]);
        if self.descriptor.headless {
            command = command.args(["--type", "headless"]);
        }
        command.run()?;

        // A system under load can take a while; the budget is a deadline,
        // not an iteration count.
        let deadline = Instant::now() + self.start_timeout;
        loop {
            self.poll(false);
            if self.online {
                break;
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(self.poll_interval);
        }

        if self.online {
            info!("Successfully started VM.");
            Ok(())
        } else {
            error!(
                "VM did not start within {} seconds, aborting job.",
                self.start_timeout.as_secs()
            );
            Err(VboxError::StateTransition {
                operation: "start VM",
                seconds: self.start_timeout.as_secs(),
            })
        }
    }

    /// Save the guest's state and stop it.
    pub fn stop(&mut self) -> Result<()> {
        info!("Stopping VM.");
        if !self.online {
            return Ok(());
        }

        self.manage
            .command("stop VM")
            .args(["controlvm", self.vm_name.as_str(), "savestate"])
            .no_retry()
            .run()?;

        self.poll(false);
        if !self.online {
            info!("Successfully stopped VM.");
            Ok(())
        } else {
            error!("VM did not stop when requested.");
            Err(VboxError::StateTransition {
                operation: "stop VM",
                seconds: 0,
            })
        }
    }

    /// Hard power-off without saving guest state.
    pub fn poweroff(&mut self) -> Result<()> {
        info!("Powering off VM.");
        if !self.online {
            return Ok(());
        }

        self.manage
            .command("poweroff VM")
            .args(["controlvm", self.vm_name.as_str(), "poweroff"])
            .no_retry()
            .run()?;

        self.poll(false);
        if !self.online {
            info!("Successfully powered off VM.");
            Ok(())
        } else {
            error!("VM did not power off when requested.");
            Err(VboxError::StateTransition {
                operation: "poweroff VM",
                seconds: 0,
            })
        }
    }

    /// Pause execution. The frontend's priority is restored to normal first
    /// so maintenance work (savestate, snapshots) completes promptly while
    /// the guest sleeps.
    pub fn pause(&mut self) -> Result<()> {
        self.reset_vm_process_priority();

        self.manage
            .command("pause VM")
            .args(["controlvm", self.vm_name.as_str(), "pause"])
            .run()?;
        self.suspended = true;
        Ok(())
    }

    /// Resume execution. The frontend drops back to idle priority so the
    /// long-running workload does not starve the host.
    pub fn resume(&mut self) -> Result<()> {
        self.lower_vm_process_priority();

        self.manage
            .command("resume VM")
            .args(["controlvm", self.vm_name.as_str(), "resume"])
            .run()?;
        self.suspended = false;
        Ok(())
    }

    /// Tear the VM down at the end of the job: power off, deregister with
    /// media deletion, and give the hypervisor service time to flush.
    pub fn cleanup(&mut self) -> Result<()> {
        let _ = self.poweroff();
        self.deregister_vm(true)?;

        thread::sleep(self.cleanup_delay);
        Ok(())
    }
}
