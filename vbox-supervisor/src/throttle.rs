//! Resource throttling, network gating, and frontend process priority.

use std::sync::OnceLock;

use regex::Regex;
use tracing::{debug, info};
use vbox_core::error::{Result, VboxError};
use vbox_core::platform::ProcessPriority;

use crate::VboxVm;

/// Pull the frontend's `Process ID: <n>` line out of the VM log header.
pub(crate) fn extract_process_id(output: &str) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"Process ID: (\d+)").expect("static regex"));
    re.captures(output)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

impl VboxVm {
    /// Cap guest CPU execution at `percentage` percent (1-100).
    pub fn set_cpu_usage(&mut self, percentage: u32) -> Result<()> {
        info!("Setting cpu throttle for VM. ({}%)", percentage);
        self.manage
            .command("CPU throttle")
            .args(["controlvm", self.vm_name.as_str(), "cpuexecutioncap"])
            .arg(percentage.to_string())
            .run()?;
        Ok(())
    }

    /// Cap the NIC at `kilobits_per_second`.
    pub fn set_network_usage(&mut self, kilobits_per_second: u32) -> Result<()> {
        info!("Setting network throttle for VM.");
        self.manage
            .command("network throttle")
            .args(["modifyvm", self.vm_name.as_str(), "--nicspeed1"])
            .arg(kilobits_per_second.to_string())
            .run()?;
        Ok(())
    }

    /// Connect or disconnect the virtual network cable.
    ///
    /// The change takes effect at the hypervisor's next scheduler tick;
    /// `network_suspended` is updated optimistically without waiting for
    /// confirmation.
    pub fn set_network_access(&mut self, enabled: bool) -> Result<()> {
        self.network_suspended = !enabled;

        if enabled {
            info!("Enabling network access for VM.");
        } else {
            info!("Disabling network access for VM.");
        }
        let cable = if enabled { "on" } else { "off" };
        self.manage
            .command(if enabled { "enable network" } else { "disable network" })
            .args(["modifyvm", self.vm_name.as_str(), "--cableconnected1", cable])
            .run()?;
        Ok(())
    }

    /// Drop the VM frontend to idle priority. No-op while the PID is
    /// unknown.
    pub fn lower_vm_process_priority(&self) {
        if let Some(pid) = self.vm_pid {
            if let Err(err) = self.platform.set_process_priority(pid, ProcessPriority::Idle) {
                debug!("Failed to lower priority of process {}: {}", pid, err);
            }
        }
    }

    /// Restore the VM frontend to normal priority. No-op while the PID is
    /// unknown.
    pub fn reset_vm_process_priority(&self) {
        if let Some(pid) = self.vm_pid {
            if let Err(err) = self
                .platform
                .set_process_priority(pid, ProcessPriority::Normal)
            {
                debug!("Failed to reset priority of process {}: {}", pid, err);
            }
        }
    }

    /// Recover the VM frontend's process id from its log header and record
    /// it for priority control and exit-code probes.
    pub fn get_vm_process_id(&mut self) -> Result<u32> {
        let output = self
            .manage
            .command("get process ID")
            .args(["showvminfo", self.vm_name.as_str(), "--log", "0"])
            .run()?;

        let pid = extract_process_id(&output)
            .ok_or_else(|| VboxError::NotFound("VM process id".into()))?;
        self.vm_pid = Some(pid);
        Ok(pid)
    }

    /// Non-blocking probe for the frontend's exit code. `None` while it is
    /// still running.
    pub fn get_vm_exit_code(&self) -> Result<Option<i32>> {
        let Some(pid) = self.vm_pid else {
            return Err(VboxError::NotFound("VM process id".into()));
        };
        self.platform.process_exit_code(pid)
    }
}
