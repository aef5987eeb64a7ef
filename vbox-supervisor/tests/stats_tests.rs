//! Network counters, logs, and the floppy channel through the supervisor.

mod common;

use std::fs;

use common::{descriptor, fixture, VM_NAME};
use vbox_core::error::VboxError;
use vbox_supervisor::HostContext;

const STATISTICS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<Statistics>
<Counter c="397229" unit="bytes" name="/Devices/PCNet0/TransmitBytes"/>
<Counter c="256" unit="bytes" name="/Devices/PCNet1/TransmitBytes"/>
</Statistics>
"#;

#[test]
fn test_network_byte_counters_are_summed() {
    let fx = fixture(descriptor(), HostContext::default());
    fx.runner.succeed_with("debugvm", STATISTICS);

    let sent = fx.vm.get_network_bytes_sent().unwrap();
    assert_eq!(sent, 397_485.0);
    let received = fx.vm.get_network_bytes_received().unwrap();
    assert_eq!(received, 397_485.0);

    let calls = fx.runner.rendered_calls();
    assert_eq!(
        calls[0],
        format!(
            "debugvm {} statistics --pattern /Devices/*/TransmitBytes",
            VM_NAME
        )
    );
    assert_eq!(
        calls[1],
        format!(
            "debugvm {} statistics --pattern /Devices/*/ReceiveBytes",
            VM_NAME
        )
    );
}

#[test]
fn test_vm_log_tolerates_spurious_cli_failure() {
    let fx = fixture(descriptor(), HostContext::default());
    // VBoxManage exits non-zero but the dump is present and usable.
    fx.runner.fail_with(
        "showvminfo",
        "VirtualBox 7.0.14 release log\n\
         00:00:06.015 Process ID: 6128\n\
         00:00:06.020 Guest up\n",
    );

    let log = fx.vm.get_vm_log().unwrap();
    assert!(log.contains("Process ID: 6128"));
}

#[test]
fn test_vm_log_failure_without_dump_propagates() {
    let fx = fixture(descriptor(), HostContext::default());
    fx.runner
        .fail_with("showvminfo", "VBoxManage: error: no such machine\n");
    assert!(fx.vm.get_vm_log().is_err());
}

#[test]
fn test_system_log_copied_and_tailed() {
    let fx = fixture(descriptor(), HostContext::default());
    let home = &fx.vm.environment.home_directory;
    fs::create_dir_all(home).unwrap();
    fs::write(home.join("VBoxSVC.log"), "service line one\nservice line two\n").unwrap();

    let log = fx.vm.get_system_log().unwrap();
    assert_eq!(log, "service line one\nservice line two\n");

    // The copy lands in the slot directory so it can be uploaded without
    // fighting the service's file locks.
    assert!(fx.vm.slot_dir().join("VBoxSVC.log").exists());
}

#[test]
fn test_system_log_missing_is_not_found() {
    let fx = fixture(descriptor(), HostContext::default());
    assert!(matches!(
        fx.vm.get_system_log(),
        Err(VboxError::NotFound(_))
    ));
}

#[test]
fn test_vm_process_id_recorded_from_log() {
    let mut fx = fixture(descriptor(), HostContext::default());
    fx.runner.succeed_with(
        "showvminfo",
        "VirtualBox 7.0.14 release log\n00:00:06.015 Process ID: 6128\n",
    );

    let pid = fx.vm.get_vm_process_id().unwrap();
    assert_eq!(pid, 6128);
    assert_eq!(
        fx.runner.rendered_calls(),
        vec![format!("showvminfo {} --log 0", VM_NAME)]
    );
}

#[test]
fn test_vm_process_id_missing_from_log() {
    let mut fx = fixture(descriptor(), HostContext::default());
    fx.runner
        .succeed_with("showvminfo", "VirtualBox 7.0.14 release log\n");
    assert!(matches!(
        fx.vm.get_vm_process_id(),
        Err(VboxError::NotFound(_))
    ));
}

#[test]
fn test_exit_code_requires_a_known_pid() {
    let fx = fixture(descriptor(), HostContext::default());
    assert!(matches!(
        fx.vm.get_vm_exit_code(),
        Err(VboxError::NotFound(_))
    ));
}

#[test]
fn test_floppy_requires_capability() {
    let fx = fixture(descriptor(), HostContext::default());
    assert!(fx.vm.read_floppy().is_err());
    assert!(fx.vm.write_floppy(b"message").is_err());
}

#[test]
fn test_floppy_round_trip_through_registration() {
    let mut desc = descriptor();
    desc.enable_floppyio = true;
    desc.floppy_image_filename = "floppy.img".into();
    let mut fx = fixture(desc, HostContext::default());

    fx.vm.register_vm().expect("registration creates the image");
    assert!(fx.vm.slot_dir().join("floppy.img").exists());

    let written = fx.vm.write_floppy(b"job parameters").unwrap();
    assert_eq!(written, 14);

    // Nothing from the guest yet.
    assert!(fx.vm.read_floppy().unwrap().is_empty());

    let calls = fx.runner.rendered_calls();
    assert!(calls
        .iter()
        .any(|call| call.contains("--name Floppy Controller --add floppy")));
    assert!(calls
        .iter()
        .any(|call| call.starts_with("storageattach")
            && call.contains("--storagectl Floppy Controller")));
}

#[test]
fn test_cpu_and_network_throttles() {
    let mut fx = fixture(descriptor(), HostContext::default());
    fx.vm.set_cpu_usage(60).unwrap();
    fx.vm.set_network_usage(2048).unwrap();

    assert_eq!(
        fx.runner.rendered_calls(),
        vec![
            format!("controlvm {} cpuexecutioncap 60", VM_NAME),
            format!("modifyvm {} --nicspeed1 2048", VM_NAME),
        ]
    );
}
