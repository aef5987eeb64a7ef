//! Shared fixture for supervisor integration tests: a supervisor wired to a
//! scripted runner inside a temporary slot directory, with fast timeouts.

// Each integration test binary compiles its own copy of this module and not
// every binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use vbox_manage::mock::MockRunner;
use vbox_manage::{Environment, RetryPolicy, VboxManage};
use vbox_supervisor::{HostContext, VboxVm, VmDescriptor};

pub const VM_NAME: &str = "boinc_f1e61a2b";

/// Descriptor for a plain 64-bit two-core guest with no capabilities.
pub fn descriptor() -> VmDescriptor {
    VmDescriptor {
        master_name: VM_NAME.into(),
        master_description: "volunteer workload".into(),
        os_type_tag: "Linux_64".into(),
        cpu_count: "2".into(),
        memory_mb: 1024,
        image_filename: "vm.vdi".into(),
        ..Default::default()
    }
}

pub struct Fixture {
    pub vm: VboxVm,
    pub runner: Arc<MockRunner>,
    // Held so the slot directory outlives the supervisor.
    #[allow(dead_code)]
    pub slot: TempDir,
}

pub fn fixture(descriptor: VmDescriptor, host: HostContext) -> Fixture {
    let runner = Arc::new(MockRunner::new());
    let manage = VboxManage::with_policy(
        Box::new(runner.clone()),
        RetryPolicy {
            max_attempts: 5,
            initial_interval: Duration::from_millis(10),
        },
    );

    let slot = TempDir::new().expect("slot directory");
    let environment = Environment {
        install_directory: None,
        home_directory: slot.path().join("vbox-home"),
        version: "VirtualBox 7.0.14".into(),
    };

    let mut vm = VboxVm::with_slot_directory(
        descriptor,
        host,
        environment,
        manage,
        slot.path().to_path_buf(),
    );
    vm.poll_interval = Duration::from_millis(2);
    vm.start_timeout = Duration::from_millis(80);
    vm.cleanup_delay = Duration::from_millis(1);

    Fixture { vm, runner, slot }
}

/// Machine-readable info output reporting the given state token.
pub fn vminfo_state(token: &str) -> String {
    format!("name=\"{}\"\nVMState=\"{}\"\n", VM_NAME, token)
}

/// Output of a failing probe for an unregistered VM.
pub fn not_found_output() -> String {
    "VBoxManage: error: Could not find a registered machine\n\
     VBoxManage: error: Details: code VBOX_E_OBJECT_NOT_FOUND (0x80bb0001)\n"
        .to_string()
}

/// Output of a failing probe for an unregistered disk.
pub fn hdd_not_found_output() -> String {
    "VBoxManage: error: Could not find file for the medium\n\
     VBoxManage: error: Details: code VBOX_E_FILE_ERROR (0x80bb0004)\n"
        .to_string()
}
