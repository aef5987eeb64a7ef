//! VBoxManage invocation layer.
//!
//! The hypervisor's only control surface is the text output of its CLI, so
//! every operation in the supervisor is built from the same three pieces:
//! a [`command::VboxCommand`] describing the arguments, the retry policy that
//! absorbs transient session-lock contention, and the `(0x…)` error-code
//! extraction that turns CLI spew into a typed [`vbox_core::VboxError`].
//!
//! [`environment::bootstrap`] prepares the process environment (install
//! directory on `PATH`, per-instance `VBOX_USER_HOME`, the `VBoxSVC` daemon
//! for sandboxed Windows jobs) and hands back a ready [`VboxManage`].

pub mod command;
pub mod environment;
pub mod retry;

// When the `test-helpers` feature is enabled, include the scripted runner.
#[cfg(feature = "test-helpers")]
pub mod mock;

pub use command::{CommandRunner, RawOutput, SystemRunner, VboxCommand, VboxManage, VBOXMANAGE};
pub use environment::{bootstrap, Environment, ServiceDaemon};
pub use retry::RetryPolicy;
