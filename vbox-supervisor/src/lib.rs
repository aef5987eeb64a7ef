//! VM lifecycle supervisor for a single VirtualBox guest.
//!
//! The supervisor owns the guest from first registration through teardown:
//! it drives `VBoxManage`, tracks the observed power state, coordinates
//! snapshot checkpoints, mediates CPU/network throttling, and shuttles small
//! blobs through a synthetic floppy image. Execution is a single cooperative
//! loop owned by the outer job wrapper; every call here blocks until the CLI
//! child exits or times out.
//!
//! The central [`VboxVm`] struct is split across focused modules:
//! [`registry`] creates and destroys the registration, [`lifecycle`] drives
//! power states, [`poll`] observes them, [`snapshot`] handles checkpoints,
//! [`throttle`] covers resource caps and process priority, and [`stats`],
//! [`floppy`], and [`ports`] surface data back to the wrapper.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use vbox_core::error::Result;
use vbox_core::platform::{self, PlatformProvider};
use vbox_manage::{Environment, VboxManage};

pub mod config;
pub mod floppy;
pub mod lifecycle;
pub mod poll;
pub mod ports;
pub mod registry;
pub mod snapshot;
pub mod stats;
pub mod throttle;

pub use config::{ClientVersion, HostContext, VmDescriptor};
pub use floppy::FloppyChannel;
pub use poll::VmState;

/// Name given to the fixed-disk storage controller at registration.
pub const HARD_DISK_CONTROLLER: &str = "Hard Disk Controller";
/// Name given to the floppy storage controller at registration.
pub const FLOPPY_CONTROLLER: &str = "Floppy Controller";

/// The per-job working directory: the VM's base folder and the home of all
/// of its artifacts. There is exactly one VM per slot directory.
pub fn slot_directory() -> Result<PathBuf> {
    Ok(env::current_dir()?)
}

/// Supervisor for one guest VM.
pub struct VboxVm {
    pub(crate) manage: VboxManage,
    pub(crate) platform: Arc<dyn PlatformProvider>,

    pub descriptor: VmDescriptor,
    pub host: HostContext,
    pub environment: Environment,
    slot_dir: PathBuf,

    /// Name used for CLI addressing. Equals `descriptor.master_name` during
    /// normal operation; temporarily holds a UUID while a stale prior VM is
    /// being cleaned up.
    pub vm_name: String,

    // Last observed guest state.
    pub online: bool,
    pub suspended: bool,
    pub network_suspended: bool,
    pub crashed: bool,

    pub pf_host_port: u16,
    pub rd_host_port: u16,

    pub(crate) vm_pid: Option<u32>,
    pub(crate) floppy: Option<FloppyChannel>,

    /// Delay between state polls while waiting on a transition.
    pub poll_interval: Duration,
    /// Budget for `start()` to observe the guest come online.
    pub start_timeout: Duration,
    /// Settling time after teardown so the hypervisor service can flush.
    pub cleanup_delay: Duration,
}

impl VboxVm {
    /// Build a supervisor rooted at the current working directory.
    pub fn new(
        descriptor: VmDescriptor,
        host: HostContext,
        environment: Environment,
        manage: VboxManage,
    ) -> Result<Self> {
        let slot_dir = slot_directory()?;
        Ok(Self::with_slot_directory(
            descriptor,
            host,
            environment,
            manage,
            slot_dir,
        ))
    }

    /// Build a supervisor rooted at an explicit slot directory.
    pub fn with_slot_directory(
        descriptor: VmDescriptor,
        host: HostContext,
        environment: Environment,
        manage: VboxManage,
        slot_dir: PathBuf,
    ) -> Self {
        let vm_name = descriptor.master_name.clone();
        let pf_host_port = descriptor.pf_host_port;
        Self {
            manage,
            platform: platform::current(),
            descriptor,
            host,
            environment,
            slot_dir,
            vm_name,
            online: false,
            suspended: false,
            network_suspended: false,
            crashed: false,
            pf_host_port,
            rd_host_port: 0,
            vm_pid: None,
            floppy: None,
            poll_interval: Duration::from_secs(1),
            start_timeout: Duration::from_secs(300),
            cleanup_delay: Duration::from_secs(5),
        }
    }

    pub fn slot_dir(&self) -> &Path {
        &self.slot_dir
    }

    pub(crate) fn disk_image_path(&self) -> PathBuf {
        self.slot_dir.join(&self.descriptor.image_filename)
    }

    pub(crate) fn floppy_image_path(&self) -> PathBuf {
        self.slot_dir.join(&self.descriptor.floppy_image_filename)
    }
}
