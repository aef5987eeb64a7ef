//! Checkpoint cycle and snapshot housekeeping.

mod common;

use std::time::Duration;

use common::{descriptor, fixture, vminfo_state, VM_NAME};
use vbox_supervisor::HostContext;

const LISTING: &str = "\
   Name: Snapshot 2 (UUID: 1751e9a6-49e7-4dcc-ab23-08428b665ddf)
      Name: Snapshot 3 (UUID: 92fa8b35-873a-4197-9d54-7b6b746b2c58)
         Name: Snapshot 4 (UUID: c049023a-5132-45d5-987d-a9cfadb09664) *
";

#[test]
fn test_checkpoint_cycle() {
    let mut fx = fixture(descriptor(), HostContext::default());
    fx.vm.online = true;
    fx.runner
        .succeed_with("showvminfo", &vminfo_state("running"));
    fx.runner
        .succeed_with(&format!("snapshot {} list", VM_NAME), LISTING);

    fx.vm.createsnapshot(3600.0).expect("checkpoint");

    let calls = fx.runner.rendered_calls();
    let expect_order = [
        format!("controlvm {} pause", VM_NAME),
        format!("snapshot {} take boinc_3600", VM_NAME),
        format!("controlvm {} resume", VM_NAME),
        format!("showvminfo {} --machinereadable", VM_NAME),
        format!("snapshot {} list", VM_NAME),
        format!("snapshot {} delete 1751e9a6-49e7-4dcc-ab23-08428b665ddf", VM_NAME),
        format!("snapshot {} delete 92fa8b35-873a-4197-9d54-7b6b746b2c58", VM_NAME),
    ];
    let mut last = None;
    for expected in &expect_order {
        let at = calls
            .iter()
            .position(|call| call == expected)
            .unwrap_or_else(|| panic!("missing call: {}", expected));
        if let Some(prev) = last {
            assert!(at > prev, "out of order: {}", expected);
        }
        last = Some(at);
    }

    // The active snapshot (marked *) survives the sweep.
    assert!(!calls
        .iter()
        .any(|call| call.contains("c049023a-5132-45d5-987d-a9cfadb09664")));
    assert!(!fx.vm.suspended);
}

#[test]
fn test_snapshot_take_carries_a_deadline() {
    let mut fx = fixture(descriptor(), HostContext::default());
    fx.vm.online = true;
    fx.runner
        .succeed_with("showvminfo", &vminfo_state("running"));
    fx.runner.succeed_with(
        &format!("snapshot {} list", VM_NAME),
        "This machine does not have any snapshots\n",
    );

    fx.vm.createsnapshot(100.0).unwrap();

    let take = fx
        .runner
        .calls()
        .into_iter()
        .find(|call| call.rendered.contains("take boinc_100"))
        .expect("take call");
    assert_eq!(take.timeout, Some(Duration::from_secs(600)));
}

#[test]
fn test_snapshot_name_truncates_to_whole_seconds() {
    let mut fx = fixture(descriptor(), HostContext::default());
    fx.vm.online = true;
    fx.runner
        .succeed_with("showvminfo", &vminfo_state("running"));
    fx.runner.succeed_with(
        &format!("snapshot {} list", VM_NAME),
        "This machine does not have any snapshots\n",
    );

    fx.vm.createsnapshot(3600.9).unwrap();
    assert!(fx
        .runner
        .rendered_calls()
        .iter()
        .any(|call| call == &format!("snapshot {} take boinc_3600", VM_NAME)));
}

#[test]
fn test_cleanup_without_snapshots_deletes_nothing() {
    let mut fx = fixture(descriptor(), HostContext::default());
    fx.runner.succeed_with(
        &format!("snapshot {} list", VM_NAME),
        "This machine does not have any snapshots\n",
    );

    fx.vm.cleanupsnapshots(false).unwrap();
    assert!(!fx
        .runner
        .rendered_calls()
        .iter()
        .any(|call| call.contains(" delete ")));
}

#[test]
fn test_cleanup_stops_at_active_snapshot() {
    let mut fx = fixture(descriptor(), HostContext::default());
    let listing = "   Name: boinc_900 (UUID: c049023a-5132-45d5-987d-a9cfadb09664) *\n";
    fx.runner
        .succeed_with(&format!("snapshot {} list", VM_NAME), listing);

    fx.vm.cleanupsnapshots(false).unwrap();
    assert!(!fx
        .runner
        .rendered_calls()
        .iter()
        .any(|call| call.contains(" delete ")));
}

#[test]
fn test_teardown_deletes_active_snapshot_too() {
    let mut fx = fixture(descriptor(), HostContext::default());
    fx.runner
        .succeed_with(&format!("snapshot {} list", VM_NAME), LISTING);

    fx.vm.cleanupsnapshots(true).unwrap();
    let deletes = fx
        .runner
        .rendered_calls()
        .into_iter()
        .filter(|call| call.contains(" delete "))
        .count();
    assert_eq!(deletes, 3);
}

#[test]
fn test_restore_propagates_failure() {
    let mut fx = fixture(descriptor(), HostContext::default());
    fx.runner.fail_with(
        &format!("snapshot {} restorecurrent", VM_NAME),
        "VBoxManage: error: Could not restore (0x80bb0005)\n",
    );

    assert!(fx.vm.restoresnapshot().is_err());
}
