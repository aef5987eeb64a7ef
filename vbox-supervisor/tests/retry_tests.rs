//! Session-lock contention and backoff behavior.

mod common;

use std::time::{Duration, Instant};

use common::{descriptor, fixture, vminfo_state, VM_NAME};
use vbox_core::error::{VboxError, E_SESSION_LOCKED};
use vbox_supervisor::HostContext;

const LOCKED_OUTPUT: &str = "VBoxManage: error: The machine is already locked for a session\n\
     VBoxManage: error: Details: code VBOX_E_INVALID_OBJECT_STATE (0x80bb0007)\n";

#[test]
fn test_lock_contention_recovers_with_backoff() {
    let mut fx = fixture(descriptor(), HostContext::default());
    fx.vm.online = true;

    let take = format!("snapshot {} take", VM_NAME);
    fx.runner.fail_with(&take, LOCKED_OUTPUT);
    fx.runner.fail_with(&take, LOCKED_OUTPUT);
    fx.runner.succeed_with(&take, "");
    fx.runner
        .succeed_with("showvminfo", &vminfo_state("running"));
    fx.runner.succeed_with(
        &format!("snapshot {} list", VM_NAME),
        "This machine does not have any snapshots\n",
    );

    let started = Instant::now();
    fx.vm.createsnapshot(3600.0).expect("checkpoint after retries");
    let elapsed = started.elapsed();

    // One initial-interval sleep plus one doubled sleep.
    assert!(
        elapsed >= Duration::from_millis(30),
        "expected backoff sleeps, finished in {:?}",
        elapsed
    );
    assert_eq!(fx.runner.calls_matching(&take).len(), 3);
    assert!(!fx.vm.suspended);
}

#[test]
fn test_persistent_lock_exhausts_the_attempt_budget() {
    let mut fx = fixture(descriptor(), HostContext::default());
    fx.vm.online = true;

    let take = format!("snapshot {} take", VM_NAME);
    fx.runner.fail_with(&take, LOCKED_OUTPUT);

    let err = fx.vm.createsnapshot(3600.0).unwrap_err();
    match err {
        VboxError::Hypervisor { code, .. } => assert_eq!(code, E_SESSION_LOCKED),
        other => panic!("expected session lock error, got {:?}", other),
    }
    assert_eq!(fx.runner.calls_matching(&take).len(), 5);
}

#[test]
fn test_probes_do_not_retry() {
    let fx = fixture(descriptor(), HostContext::default());
    fx.runner.fail_with("showvminfo", LOCKED_OUTPUT);

    assert!(!fx.vm.is_registered());
    assert_eq!(fx.runner.rendered_calls().len(), 1);
}
