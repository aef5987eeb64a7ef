//! Snapshot-based checkpointing.
//!
//! A checkpoint pauses the VM first so the hypervisor takes an offline
//! snapshot rather than a live one, trading a short guest stall for a
//! simpler crash model. Stale snapshots are deleted after each checkpoint so
//! only the current one accumulates.

use tracing::{info, warn};
use vbox_core::error::Result;

use crate::registry::extract_uuid;
use crate::VboxVm;

/// Budget for `snapshot take`/`delete`, which can be slow on loaded hosts.
const SNAPSHOT_TIMEOUT_SECS: u64 = 600;

impl VboxVm {
    /// Take a checkpoint named after the job's elapsed time.
    pub fn createsnapshot(&mut self, elapsed_time: f64) -> Result<()> {
        info!("Creating new snapshot for VM.");

        self.pause()?;

        // Two checkpoints in the same integer second collide on the name;
        // the hypervisor tolerates duplicates, so the collision is not worth
        // failing the job over.
        let name = format!("boinc_{}", elapsed_time as u64);
        self.manage
            .command("create new snapshot")
            .args(["snapshot", self.vm_name.as_str(), "take", name.as_str()])
            .timeout_secs(SNAPSHOT_TIMEOUT_SECS)
            .run()?;

        self.resume()?;

        // Refresh `suspended` before touching the stale snapshots.
        self.poll(false);

        self.cleanupsnapshots(false)?;

        info!("Checkpoint completed.");
        Ok(())
    }

    /// Delete stale snapshots one by one.
    ///
    /// The active snapshot is marked with a trailing `*` in the listing;
    /// unless `delete_active` is set, iteration stops there.
    pub fn cleanupsnapshots(&mut self, delete_active: bool) -> Result<()> {
        let output = self
            .manage
            .command("enumerate snapshot(s)")
            .args(["snapshot", self.vm_name.as_str(), "list"])
            .run()?;

        for line in output.lines() {
            if line.contains("does not have any snapshots") {
                break;
            }
            if !delete_active && line.contains('*') {
                break;
            }

            if let Some(uuid) = extract_uuid(line) {
                info!("Deleting stale snapshot.");
                let uuid = uuid.to_string();
                if let Err(err) = self
                    .manage
                    .command("delete stale snapshot")
                    .args(["snapshot", self.vm_name.as_str(), "delete", uuid.as_str()])
                    .no_retry()
                    .timeout_secs(SNAPSHOT_TIMEOUT_SECS)
                    .run()
                {
                    warn!("Failed to delete snapshot {}: {}", uuid, err);
                }
            }
        }

        Ok(())
    }

    /// Revert the guest to the current snapshot.
    pub fn restoresnapshot(&mut self) -> Result<()> {
        info!("Restore from previously saved snapshot.");
        self.manage
            .command("restore current snapshot")
            .args(["snapshot", self.vm_name.as_str(), "restorecurrent"])
            .run()?;
        info!("Restore completed.");
        Ok(())
    }
}
