//! Error types shared across the supervisor workspace.

pub use anyhow::bail;
use thiserror::Error;

/// Hypervisor error code raised when another management application holds the
/// session lock for a VM (`VBOX_E_INVALID_OBJECT_STATE`).
pub const E_SESSION_LOCKED: u32 = 0x80bb_0007;

/// Errors that can occur while supervising a VirtualBox guest.
#[derive(Error, Debug)]
pub enum VboxError {
    /// VBoxManage reported a `(0x…)` error code in its output.
    #[error("VBoxManage failed with error 0x{code:08x}")]
    Hypervisor { code: u32, output: String },

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Dependency not found: {0}")]
    Dependency(String),

    #[error("VBoxManage did not exit within {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("failed to spawn VBoxManage: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("{operation}: VM did not reach the requested state within {seconds} seconds")]
    StateTransition {
        operation: &'static str,
        seconds: u64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to bind loopback port: {0}")]
    Bind(String),

    #[error("failed to create floppy image: {0}")]
    FloppyCreate(String),

    /// Registration-only mode: the VM is registered and the job is done.
    #[error("VM registered; registration-only mode requested an early exit")]
    RegisterOnly,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VboxError {
    /// True when the failure is the hypervisor's cross-process session lock,
    /// which is transient and worth retrying with backoff.
    pub fn is_session_locked(&self) -> bool {
        matches!(self, VboxError::Hypervisor { code, .. } if *code == E_SESSION_LOCKED)
    }

    /// The numeric hypervisor code, when one was parsed out of the output.
    pub fn hypervisor_code(&self) -> Option<u32> {
        match self {
            VboxError::Hypervisor { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Combined CLI output attached to the failure, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            VboxError::Hypervisor { output, .. } => Some(output),
            VboxError::Command(output) => Some(output),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, VboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lock_detection() {
        let locked = VboxError::Hypervisor {
            code: E_SESSION_LOCKED,
            output: String::new(),
        };
        assert!(locked.is_session_locked());

        let other = VboxError::Hypervisor {
            code: 0x80bb_0001,
            output: String::new(),
        };
        assert!(!other.is_session_locked());
        assert!(!VboxError::Command("spawn".into()).is_session_locked());
    }

    #[test]
    fn test_hypervisor_code_extraction() {
        let err = VboxError::Hypervisor {
            code: 0x80bb_0005,
            output: "details".into(),
        };
        assert_eq!(err.hypervisor_code(), Some(0x80bb_0005));
        assert_eq!(err.output(), Some("details"));
        assert_eq!(VboxError::RegisterOnly.hypervisor_code(), None);
    }
}
