//! The persisted summary of a finished snapshot run.

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use derive_more::{Display, Error, From};

use crate::model::{FailureKind, ItemResult, ItemStatus, RunStatus, SnapshotRun};
use crate::util::atomic::write_atomic;

/// Version recorded in every manifest.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// One failure listed in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ManifestError {
    /// Absent when the failure is not tied to an item, e.g. the listing failed.
    pub item_id: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

/// Durable form of a terminal [SnapshotRun].
///
/// Nothing in here is read from the wall clock except `duration_seconds`; `as_of` is
/// the snapshot date.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Manifest {
    pub snapshot_date: NaiveDate,
    pub as_of: DateTime<Utc>,
    pub connector: String,
    pub account: String,
    pub content_type: String,
    pub status: RunStatus,
    pub item_count: usize,
    pub succeeded_count: usize,
    pub deduplicated_count: usize,
    pub failed_permanent_count: usize,
    pub failed_transient_count: usize,
    pub total_bytes: u64,
    pub errors: Vec<ManifestError>,
    pub items: Vec<ItemResult>,
    pub duration_seconds: f64,
    pub engine_version: String,
}

impl Manifest {
    /// Summarise a run that reached a terminal status.
    pub fn from_run(run: &SnapshotRun) -> Self {
        debug_assert!(run.status.is_terminal(), "manifest of a running snapshot");
        let request = &run.request;

        let mut errors: Vec<_> = run
            .results
            .iter()
            .filter_map(|result| {
                let error = result.error.as_ref()?;
                Some(ManifestError {
                    item_id: Some(result.item_id.clone()),
                    kind: error.kind,
                    message: error.message.clone(),
                })
            })
            .collect();
        if let Some(fatal) = &run.fatal {
            errors.push(ManifestError {
                item_id: fatal.item_id.clone(),
                kind: fatal.kind,
                message: fatal.message.clone(),
            });
        }

        Self {
            snapshot_date: request.snapshot_date(),
            as_of: request.as_of(),
            connector: request.connector().to_string(),
            account: request.account().to_string(),
            content_type: request.content_type().to_string(),
            status: run.status,
            item_count: run.item_count,
            succeeded_count: run.count(ItemStatus::Succeeded),
            deduplicated_count: run.results.iter().filter(|r| r.deduplicated).count(),
            failed_permanent_count: run.count(ItemStatus::FailedPermanent),
            failed_transient_count: run.count(ItemStatus::FailedTransientExhausted),
            total_bytes: run.results.iter().map(|r| r.bytes_written).sum(),
            errors,
            items: run.results.clone(),
            duration_seconds: run.started.elapsed().as_millis() as f64 / 1000.0,
            engine_version: ENGINE_VERSION.to_string(),
        }
    }

    pub fn failed_count(&self) -> usize {
        self.failed_permanent_count + self.failed_transient_count
    }

    /// Read and validate the manifest at `path`.
    pub fn read(path: &Path) -> Result<Self, ManifestReadError> {
        let content = fs::read(path)?;
        let manifest: Self = serde_json::from_slice(&content)?;
        Ok(manifest)
    }
}

/// Errors on persisting a [Manifest].
#[derive(Debug, Display, Error, From)]
pub enum ManifestWriteError {
    #[display("Serializing the manifest failed: {_0}")]
    Serialize(serde_json::Error),
    #[display("Writing the manifest failed: {_0}")]
    Io(io::Error),
}

/// Errors on loading a [Manifest].
#[derive(Debug, Display, Error, From)]
pub enum ManifestReadError {
    #[display("Reading the manifest failed: {_0}")]
    Io(io::Error),
    #[display("Manifest is not valid: {_0}")]
    Parse(serde_json::Error),
}

/// Writes manifests atomically next to the snapshot they describe.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestWriter;

impl ManifestWriter {
    /// Persist the manifest of `run` at `path`.
    ///
    /// The file is replaced through a rename, so `path` holds either the previous
    /// manifest or the new one, never a torn write.
    pub fn write(&self, run: &SnapshotRun, path: &Path) -> Result<Manifest, ManifestWriteError> {
        let manifest = Manifest::from_run(run);
        let mut content = serde_json::to_vec_pretty(&manifest)?;
        content.push(b'\n');
        write_atomic(path, &content)?;

        log::info!(
            target: "engine::manifest",
            "Wrote {} manifest to {} ({} of {} items succeeded)",
            manifest.status,
            path.display(),
            manifest.succeeded_count,
            manifest.item_count,
        );
        Ok(manifest)
    }
}
