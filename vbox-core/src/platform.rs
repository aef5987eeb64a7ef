//! Platform-specific process and hypervisor-host operations.
//!
//! Everything that differs between POSIX and Windows hosts lives behind
//! [`PlatformProvider`]: locating the VirtualBox installation, adjusting the
//! scheduling priority of the VM frontend process, probing a foreign process
//! for its exit code, and launching the `VBoxSVC` service daemon for
//! sandboxed jobs. The lifecycle state machine never touches a platform
//! conditional directly.

use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::Arc;

use crate::error::Result;

/// Scheduling priority classes applied to the VM frontend process.
///
/// The guest runs at `Idle` while the scientific workload executes so it does
/// not starve the host, and is reset to `Normal` around pause/snapshot work
/// so those operations complete promptly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPriority {
    Idle,
    Normal,
}

/// Platform abstraction consumed by the supervisor.
pub trait PlatformProvider: Send + Sync {
    /// Get the platform name (e.g., "unix", "windows").
    fn name(&self) -> &'static str;

    /// Directory the hypervisor is installed in, when the host records it.
    ///
    /// Windows keeps this under `HKLM\SOFTWARE\Oracle\VirtualBox\InstallDir`;
    /// POSIX hosts return `None` and trust `PATH`.
    fn hypervisor_install_dir(&self) -> Option<PathBuf>;

    /// Adjust the scheduling priority of a foreign process.
    fn set_process_priority(&self, pid: u32, priority: ProcessPriority) -> Result<()>;

    /// Non-blocking exit-code probe for a foreign process.
    ///
    /// Returns `Ok(None)` while the process is still running or when the
    /// platform cannot observe it.
    fn process_exit_code(&self, pid: u32) -> Result<Option<i32>>;

    /// True when sandboxed jobs must launch the hypervisor service daemon
    /// themselves so it inherits the overridden environment.
    fn needs_service_daemon(&self) -> bool;

    /// Launch the hypervisor service daemon detached.
    fn spawn_service_daemon(&self, install_dir: &Path) -> Result<Child>;
}

/// Get the platform provider for the current operating system.
pub fn current() -> Arc<dyn PlatformProvider> {
    #[cfg(unix)]
    return Arc::new(unix::UnixPlatform);

    #[cfg(windows)]
    return Arc::new(windows::WindowsPlatform);

    #[cfg(not(any(unix, windows)))]
    compile_error!("Unsupported platform - only Unix-like and Windows hosts are supported");
}

#[cfg(unix)]
mod unix {
    use super::*;
    use crate::error::VboxError;

    // setpriority niceness for the two classes the supervisor uses.
    const NICE_IDLE: libc::c_int = 19;
    const NICE_NORMAL: libc::c_int = 0;

    pub struct UnixPlatform;

    impl PlatformProvider for UnixPlatform {
        fn name(&self) -> &'static str {
            "unix"
        }

        fn hypervisor_install_dir(&self) -> Option<PathBuf> {
            // VBoxManage is expected to be reachable through PATH.
            None
        }

        fn set_process_priority(&self, pid: u32, priority: ProcessPriority) -> Result<()> {
            let nice = match priority {
                ProcessPriority::Idle => NICE_IDLE,
                ProcessPriority::Normal => NICE_NORMAL,
            };
            let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, pid as _, nice) };
            if rc != 0 {
                return Err(VboxError::Io(std::io::Error::last_os_error()));
            }
            Ok(())
        }

        fn process_exit_code(&self, pid: u32) -> Result<Option<i32>> {
            let mut status: libc::c_int = 0;
            let rc = unsafe { libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG) };
            if rc == pid as libc::pid_t {
                return Ok(Some(status));
            }
            // Not our child, or still running. A null signal tells us whether
            // the process exists at all.
            if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
                Ok(None)
            } else {
                Ok(Some(0))
            }
        }

        fn needs_service_daemon(&self) -> bool {
            false
        }

        fn spawn_service_daemon(&self, _install_dir: &Path) -> Result<Child> {
            Err(VboxError::Command(
                "VBoxSVC is managed by the hypervisor itself on this platform".into(),
            ))
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use crate::error::VboxError;
    use std::process::Command;

    const INSTALL_DIR_KEY: &str = r"HKLM\SOFTWARE\Oracle\VirtualBox";

    pub struct WindowsPlatform;

    impl PlatformProvider for WindowsPlatform {
        fn name(&self) -> &'static str {
            "windows"
        }

        fn hypervisor_install_dir(&self) -> Option<PathBuf> {
            let output = Command::new("reg")
                .args(["query", INSTALL_DIR_KEY, "/v", "InstallDir"])
                .output()
                .ok()?;
            if !output.status.success() {
                return None;
            }
            let text = String::from_utf8_lossy(&output.stdout);
            // Output line: "    InstallDir    REG_SZ    C:\Program Files\..."
            for line in text.lines() {
                let mut fields = line.split_whitespace();
                if fields.next() == Some("InstallDir") && fields.next() == Some("REG_SZ") {
                    let rest = line.splitn(3, "REG_SZ").nth(1)?.trim();
                    if !rest.is_empty() {
                        return Some(PathBuf::from(rest));
                    }
                }
            }
            None
        }

        fn set_process_priority(&self, pid: u32, priority: ProcessPriority) -> Result<()> {
            let class = match priority {
                ProcessPriority::Idle => "Idle",
                ProcessPriority::Normal => "Normal",
            };
            let script = format!("(Get-Process -Id {}).PriorityClass = '{}'", pid, class);
            let status = Command::new("powershell")
                .args(["-NoProfile", "-Command", &script])
                .status()
                .map_err(VboxError::Io)?;
            if !status.success() {
                return Err(VboxError::Command(format!(
                    "failed to set priority class {} on process {}",
                    class, pid
                )));
            }
            Ok(())
        }

        fn process_exit_code(&self, pid: u32) -> Result<Option<i32>> {
            let script = format!("Get-Process -Id {} -ErrorAction SilentlyContinue", pid);
            let output = Command::new("powershell")
                .args(["-NoProfile", "-Command", &script])
                .output()
                .map_err(VboxError::Io)?;
            if output.stdout.is_empty() {
                // Process gone; the exit code is not observable from here.
                Ok(Some(0))
            } else {
                Ok(None)
            }
        }

        fn needs_service_daemon(&self) -> bool {
            true
        }

        fn spawn_service_daemon(&self, install_dir: &Path) -> Result<Child> {
            let exe = install_dir.join("VBoxSVC.exe");
            Command::new(exe)
                .args(["--logrotate", "1", "--logsize", "1024000"])
                .spawn()
                .map_err(VboxError::Spawn)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_current_platform_name() {
        assert_eq!(current().name(), "unix");
    }

    #[test]
    fn test_unix_trusts_path_for_install_dir() {
        assert!(current().hypervisor_install_dir().is_none());
    }

    #[test]
    fn test_exit_code_probe_for_dead_pid() {
        // A wildly out-of-range pid is never alive; the probe must report an
        // exit rather than "still running".
        let result = current().process_exit_code(0x3fff_fff0).unwrap();
        assert!(result.is_some());
    }
}
