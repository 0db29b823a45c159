//! Decides from local state alone whether a snapshot is already done.

use crate::layout::SnapshotLayout;
use crate::manifest::Manifest;

/// Result of [IdempotencyGuard::check].
#[derive(Debug, Clone, PartialEq)]
pub enum GuardOutcome {
    /// A succeeded or partial manifest exists; the remote must not be contacted.
    Complete(Manifest),
    /// No usable manifest; the snapshot has to be (re)run.
    Incomplete,
}

impl GuardOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}

/// Reads the snapshot directory and manifest, never the network, never writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdempotencyGuard;

impl IdempotencyGuard {
    pub fn check(&self, layout: &SnapshotLayout) -> GuardOutcome {
        if !layout.snapshot_dir().is_dir() {
            log::debug!(target: "engine::guard", "No snapshot directory at {}", layout.snapshot_dir().display());
            return GuardOutcome::Incomplete;
        }

        let path = layout.manifest_path();
        if !path.is_file() {
            log::info!(target: "engine::guard", "Snapshot at {} has no manifest, treating as interrupted", layout.snapshot_dir().display());
            return GuardOutcome::Incomplete;
        }

        match Manifest::read(&path) {
            Ok(manifest) if manifest.status.is_complete() => {
                log::info!(target: "engine::guard", "Snapshot {} already {}", manifest.snapshot_date, manifest.status);
                GuardOutcome::Complete(manifest)
            }
            Ok(manifest) => {
                log::info!(target: "engine::guard", "Previous run of {} ended {}, retrying", manifest.snapshot_date, manifest.status);
                GuardOutcome::Incomplete
            }
            Err(e) => {
                log::warn!(target: "engine::guard", "Ignoring unusable manifest {}: {e}", path.display());
                GuardOutcome::Incomplete
            }
        }
    }
}
