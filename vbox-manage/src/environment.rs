//! Hypervisor environment bootstrap.
//!
//! Prepares the process so `VBoxManage` can be executed: puts the install
//! directory on `PATH` where the host records one, picks the per-instance
//! hypervisor home directory (sandboxed jobs get one under the project
//! directory), exports the override, launches the `VBoxSVC` service daemon
//! where the platform requires it, and records the hypervisor version.
//!
//! The process environment is mutated here and nowhere else.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tracing::{info, warn};
use vbox_core::error::Result;
use vbox_core::platform::{self, PlatformProvider};

use crate::command::{SystemRunner, VboxManage};
use crate::retry::RetryPolicy;

/// The hypervisor context established by [`bootstrap`].
#[derive(Debug, Clone)]
pub struct Environment {
    /// Install directory, when the host records one (Windows registry).
    pub install_directory: Option<PathBuf>,
    /// Directory holding all per-instance hypervisor state.
    pub home_directory: PathBuf,
    /// Version string reported by `VBoxManage --version`.
    pub version: String,
}

/// Keeps the `VBoxSVC` service daemon alive for sandboxed jobs.
///
/// When launched lazily by the system service manager the daemon inherits an
/// environment without the `VBOX_USER_HOME` override, so sandboxed jobs
/// launch it themselves and re-launch it whenever it exits for being idle.
pub struct ServiceDaemon {
    platform: Arc<dyn PlatformProvider>,
    install_dir: PathBuf,
    child: Mutex<Option<Child>>,
}

impl ServiceDaemon {
    pub fn new(platform: Arc<dyn PlatformProvider>, install_dir: PathBuf) -> Self {
        Self {
            platform,
            install_dir,
            child: Mutex::new(None),
        }
    }

    /// Launch the daemon unless a previously launched instance is still
    /// running.
    pub fn ensure_running(&self) {
        let mut guard = match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let alive = guard
            .as_mut()
            .map(|child| matches!(child.try_wait(), Ok(None)))
            .unwrap_or(false);
        if alive {
            return;
        }
        match self.platform.spawn_service_daemon(&self.install_dir) {
            Ok(child) => *guard = Some(child),
            Err(err) => warn!("Failed to launch the hypervisor service daemon: {}", err),
        }
    }
}

/// Prepare the hypervisor environment and hand back a ready CLI handle.
///
/// `project_dir` is the volunteer project directory; the sandboxed home
/// override lands next to it. `using_sandbox` reflects the job context; a
/// missing `HOME` on POSIX forces the override regardless.
pub fn bootstrap(
    project_dir: &Path,
    using_sandbox: bool,
    policy: RetryPolicy,
) -> Result<(VboxManage, Environment)> {
    let platform = platform::current();

    let install_directory = platform.hypervisor_install_dir();
    if let Some(dir) = &install_directory {
        prepend_path(dir);
    }

    // Without a home directory the hypervisor tries to write its state under
    // root's home, which ends badly for an unprivileged job.
    let force_sandbox = cfg!(unix) && env::var_os("HOME").is_none();

    let (home_directory, overridden) = choose_home_directory(
        env::var_os("VBOX_USER_HOME").map(PathBuf::from),
        user_home(),
        project_dir,
        using_sandbox || force_sandbox,
    );

    let mut service = None;
    if overridden {
        fs::create_dir_all(&home_directory)
            .with_context(|| format!("Failed to create hypervisor home {:?}", home_directory))?;
        env::set_var("VBOX_USER_HOME", &home_directory);

        if platform.needs_service_daemon() {
            if let Some(dir) = &install_directory {
                let daemon = Arc::new(ServiceDaemon::new(platform.clone(), dir.clone()));
                daemon.ensure_running();
                service = Some(daemon);
            }
        }
    }

    let runner = match service {
        Some(daemon) => SystemRunner::with_service_daemon(daemon)?,
        None => SystemRunner::new()?,
    };
    let manage = VboxManage::with_policy(Box::new(runner), policy);

    let version = record_version(&manage)?;
    info!("Detected: {}", version);

    Ok((
        manage,
        Environment {
            install_directory,
            home_directory,
            version,
        },
    ))
}

/// Pick the hypervisor home directory.
///
/// Returns the directory plus whether it is a sandbox override that must be
/// created and exported through `VBOX_USER_HOME`.
fn choose_home_directory(
    vbox_user_home: Option<PathBuf>,
    user_home: Option<PathBuf>,
    project_dir: &Path,
    sandboxed: bool,
) -> (PathBuf, bool) {
    if sandboxed {
        return (project_dir.join("..").join("virtualbox"), true);
    }
    let home = vbox_user_home.unwrap_or_else(|| {
        user_home
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".VirtualBox")
    });
    (home, false)
}

fn user_home() -> Option<PathBuf> {
    let var = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    env::var_os(var).map(PathBuf::from)
}

fn prepend_path(dir: &Path) {
    let separator = if cfg!(windows) { ';' } else { ':' };
    let old = env::var("PATH").unwrap_or_default();
    env::set_var("PATH", format!("{}{}{}", dir.display(), separator, old));
}

fn record_version(manage: &VboxManage) -> Result<String> {
    let output = manage.command("version check").arg("--version").run()?;
    let cleaned: String = output
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .collect();
    Ok(format!("VirtualBox {}", cleaned))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_home_directory_prefers_vbox_user_home() {
        let (home, overridden) = choose_home_directory(
            Some(PathBuf::from("/custom/vbox")),
            Some(PathBuf::from("/home/volunteer")),
            Path::new("/var/lib/project"),
            false,
        );
        assert_eq!(home, PathBuf::from("/custom/vbox"));
        assert!(!overridden);
    }

    #[test]
    fn test_home_directory_defaults_under_user_home() {
        let (home, overridden) = choose_home_directory(
            None,
            Some(PathBuf::from("/home/volunteer")),
            Path::new("/var/lib/project"),
            false,
        );
        assert_eq!(home, PathBuf::from("/home/volunteer/.VirtualBox"));
        assert!(!overridden);
    }

    #[test]
    fn test_sandbox_overrides_everything() {
        let (home, overridden) = choose_home_directory(
            Some(PathBuf::from("/custom/vbox")),
            Some(PathBuf::from("/home/volunteer")),
            Path::new("/var/lib/project"),
            true,
        );
        assert_eq!(home, Path::new("/var/lib/project").join("..").join("virtualbox"));
        assert!(overridden);
    }
}
