//! Observation of the guest's power state.
//!
//! The hypervisor offers no push notifications; the supervisor polls
//! `showvminfo --machinereadable` and maps the `VMState` token onto the
//! three flags the lifecycle logic runs on.

use std::sync::OnceLock;

use regex::Regex;
use tracing::info;

use crate::VboxVm;

/// Power state token reported by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    Running,
    Starting,
    Stopping,
    Saving,
    Restoring,
    LiveSnapshotting,
    DeletingSnapshotLive,
    Paused,
    DeletingSnapshotLivePaused,
    Aborted,
    GuruMeditation,
    /// Anything else, powered off included.
    Other(String),
}

/// Flag view of a state token: what the lifecycle logic actually consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateFlags {
    pub online: bool,
    pub suspended: bool,
    pub crashed: bool,
}

impl VmState {
    pub fn parse(token: &str) -> Self {
        match token {
            "running" => VmState::Running,
            "starting" => VmState::Starting,
            "stopping" => VmState::Stopping,
            "saving" => VmState::Saving,
            "restoring" => VmState::Restoring,
            "livesnapshotting" => VmState::LiveSnapshotting,
            "deletingsnapshotlive" => VmState::DeletingSnapshotLive,
            "paused" => VmState::Paused,
            "deletingsnapshotlivepaused" => VmState::DeletingSnapshotLivePaused,
            "aborted" => VmState::Aborted,
            "gurumeditation" => VmState::GuruMeditation,
            other => VmState::Other(other.to_string()),
        }
    }

    pub fn flags(&self) -> StateFlags {
        match self {
            VmState::Running
            | VmState::Starting
            | VmState::Stopping
            | VmState::Saving
            | VmState::Restoring
            | VmState::LiveSnapshotting
            | VmState::DeletingSnapshotLive => StateFlags {
                online: true,
                suspended: false,
                crashed: false,
            },
            VmState::Paused | VmState::DeletingSnapshotLivePaused => StateFlags {
                online: true,
                suspended: true,
                crashed: false,
            },
            VmState::Aborted | VmState::GuruMeditation => StateFlags {
                online: false,
                suspended: false,
                crashed: true,
            },
            VmState::Other(_) => StateFlags {
                online: false,
                suspended: false,
                crashed: false,
            },
        }
    }
}

/// Pull the `VMState="…"` token out of machine-readable VM info.
pub(crate) fn extract_state_token(output: &str) -> Option<&str> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r#"VMState="([^"]*)""#).expect("static regex"));
    re.captures(output).map(|caps| {
        caps.get(1)
            .map(|m| m.as_str())
            .unwrap_or_default()
    })
}

impl VboxVm {
    /// Refresh `online`, `suspended`, and `crashed` from the hypervisor.
    ///
    /// A failing probe leaves the flags untouched; the next tick will try
    /// again. When `log_state` is set, dropping out of the online states
    /// emits a log line naming the token.
    pub fn poll(&mut self, log_state: bool) {
        let output = match self
            .manage
            .command("VM state")
            .args(["showvminfo", self.vm_name.as_str(), "--machinereadable"])
            .probe()
            .run()
        {
            Ok(output) => output,
            Err(_) => return,
        };

        let Some(token) = extract_state_token(&output) else {
            return;
        };

        let state = VmState::parse(token);
        let flags = state.flags();
        self.online = flags.online;
        self.suspended = flags.suspended;
        self.crashed = flags.crashed;

        if log_state {
            if let VmState::Other(token) = &state {
                info!("VM is no longer in a running state. It is in '{}'.", token);
            }
        }
    }
}
