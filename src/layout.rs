//! On-disk layout of snapshots.
//!
//! ```text
//! {output_root}/{connector}/{account}/
//!     download_archive.txt
//!     {content_type}/{snapshot_date}/
//!         .manifest.json
//!         .run.lock
//!         .metadata/<item file>.json
//!         <items>
//! ```

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::model::SnapshotRequest;

/// File name of the manifest inside a snapshot directory.
pub const MANIFEST_FILE: &str = ".manifest.json";

/// File name of the download archive inside an account directory.
pub const LEDGER_FILE: &str = "download_archive.txt";

/// Directory of per-item metadata inside a snapshot directory.
pub const METADATA_DIR: &str = ".metadata";

/// Lock file held for the duration of a run inside a snapshot directory.
pub const RUN_LOCK_FILE: &str = ".run.lock";

/// Resolved paths of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotLayout {
    account_dir: PathBuf,
    snapshot_dir: PathBuf,
}

impl SnapshotLayout {
    pub fn new(request: &SnapshotRequest) -> Self {
        let account_dir = request
            .output_root()
            .join(sanitize(request.connector()))
            .join(sanitize(request.account()));
        let snapshot_dir = account_dir
            .join(sanitize(request.content_type()))
            .join(request.snapshot_date().format("%Y-%m-%d").to_string());

        Self {
            account_dir,
            snapshot_dir,
        }
    }

    /// Directory shared by every snapshot of the `(connector, account)` pair.
    pub fn account_dir(&self) -> &Path {
        &self.account_dir
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.snapshot_dir.join(MANIFEST_FILE)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.account_dir.join(LEDGER_FILE)
    }

    /// Destination of an item named `name` (sanitised here).
    pub fn item_path(&self, name: &str) -> PathBuf {
        self.snapshot_dir.join(sanitize(name))
    }

    /// Fallback destination when `name` is taken by another item.
    pub fn disambiguated_item_path(&self, name: &str, id: &str) -> PathBuf {
        self.snapshot_dir
            .join(format!("{}~{}", sanitize(name), short_hash(id)))
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.snapshot_dir.join(METADATA_DIR)
    }

    pub fn run_lock_path(&self) -> PathBuf {
        self.snapshot_dir.join(RUN_LOCK_FILE)
    }

    /// `path` relative to the account directory, `/`-separated.
    pub fn relative(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.account_dir).ok()?;
        let parts = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join("/"))
    }

    /// Inverse of [`relative`](Self::relative).
    pub fn resolve(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .fold(self.account_dir.clone(), |path, part| path.join(part))
    }
}

/// Turn an arbitrary string into a single safe path component.
///
/// Characters outside `[A-Za-z0-9._-]` become `_` and a leading `.` becomes `_`, so
/// results never collide with hidden engine files. When anything was replaced a short
/// hash of the original is appended to keep distinct inputs apart.
pub fn sanitize(raw: &str) -> String {
    let mut clean: String = raw
        .chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect();
    if clean.starts_with('.') {
        clean.replace_range(..1, "_");
    }

    if clean == raw && !clean.is_empty() {
        return clean;
    }

    format!("{clean}~{}", short_hash(raw))
}

fn short_hash(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(&digest[..4])
}
