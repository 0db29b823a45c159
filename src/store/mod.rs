//! Deduplicating, crash-safe storage of downloaded items.
//!
//! [ContentAddressedStore::download] is the only way an item reaches its final name:
//!
//! 1. An id already in the [Ledger] whose recorded file still exists is reported as
//!    succeeded without touching the remote.
//! 2. Otherwise the item is fetched under the retry policy and streamed into a hidden
//!    temporary file while its SHA-256 is computed.
//! 3. Under the exclusive ledger lock the ledger is checked again, a file name no other
//!    id owns is picked, the temporary file is renamed to it and only then is the id
//!    appended.
//!
//! Step 3 makes the check-and-commit atomic across threads and processes, so each
//! `(connector, account, id)` is written at most once and never over another id's file.

pub mod ledger;
pub mod metadata;

pub use ledger::{Ledger, LedgerEntry, LedgerLock};
pub use metadata::ItemRecord;

use std::fmt::{self, Display};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::connector::{ErrorClass, ItemStream};
use crate::layout::SnapshotLayout;
use crate::model::{FailureKind, ItemError, ItemMetadata, ItemResult, ItemStatus, RunFailure};
use crate::retry::{RetryPolicy, RetryingTaskRunner};
use crate::util::atomic::StagedFile;

const COPY_BUFFER: usize = 64 * 1024;

/// Render a digest the way manifests and the ledger record it.
pub fn format_hash(digest: &[u8]) -> String {
    format!("sha256:{}", hex::encode(digest))
}

/// A fully written temporary file waiting to be committed.
#[derive(Debug)]
pub struct Staged {
    file: StagedFile,
    bytes: u64,
    content_hash: String,
}

/// Why staging an item failed.
#[derive(Debug)]
pub enum StageError<E> {
    /// The connector could not open the item.
    Fetch(E),
    /// Reading the item stream failed midway.
    Read(io::Error),
    /// Writing the local copy failed.
    Write(io::Error),
}

impl<E: Display> Display for StageError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fetch(e) => write!(f, "{e}"),
            Self::Read(e) => write!(f, "reading item stream failed: {e}"),
            Self::Write(e) => write!(f, "writing local copy failed: {e}"),
        }
    }
}

/// Stream `source` into a temporary sibling of `dest`, hashing on the way.
pub fn stage<E>(dest: &Path, mut source: impl Read) -> Result<Staged, StageError<E>> {
    let (file, mut out) = StagedFile::create(dest).map_err(StageError::Write)?;
    let mut hasher = Sha256::new();
    let mut bytes = 0u64;
    let mut buf = vec![0; COPY_BUFFER];

    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(StageError::Read(e)),
        };
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n]).map_err(StageError::Write)?;
        bytes += n as u64;
    }
    out.sync_all().map_err(StageError::Write)?;

    Ok(Staged {
        file,
        bytes,
        content_hash: format_hash(&hasher.finalize()),
    })
}

/// Item storage of one snapshot, backed by the account's download archive.
#[derive(Debug)]
pub struct ContentAddressedStore {
    layout: SnapshotLayout,
    ledger: Ledger,
}

impl ContentAddressedStore {
    /// Open the store; the account directory must already exist.
    pub fn open(layout: SnapshotLayout) -> io::Result<Self> {
        let ledger = Ledger::open(layout.ledger_path())?;
        Ok(Self { layout, ledger })
    }

    pub fn layout(&self) -> &SnapshotLayout {
        &self.layout
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The ledger entry of `id` if its file is still on disk.
    pub fn lookup(&self, id: &str) -> io::Result<Option<LedgerEntry>> {
        Ok(self
            .ledger
            .get(id)?
            .filter(|entry| self.layout.resolve(&entry.path).is_file()))
    }

    /// Store `item` under `name` in the snapshot directory.
    ///
    /// Non-fatal failures come back as a failed [ItemResult]; an `Err` means the run
    /// has to stop.
    pub fn download<F, E, C>(
        &self,
        item: &ItemMetadata,
        name: &str,
        runner: &RetryingTaskRunner,
        policy: &RetryPolicy,
        fetch: F,
        classify: C,
    ) -> Result<ItemResult, RunFailure>
    where
        F: Fn() -> Result<ItemStream, E> + Send + Sync + 'static,
        E: Display + Send + 'static,
        C: Fn(&E) -> ErrorClass,
    {
        let storage = |e: io::Error| RunFailure {
            item_id: Some(item.id.clone()),
            kind: FailureKind::Storage,
            message: e.to_string(),
        };

        if let Some(entry) = self.lookup(&item.id).map_err(storage)? {
            log::debug!(target: "engine::store", "Already archived, skipping: {}", item.id);
            return Ok(deduplicated(&item.id, entry));
        }

        let target = self.layout.item_path(name);
        let op = move || -> Result<Staged, StageError<E>> {
            let stream = fetch().map_err(StageError::Fetch)?;
            stage(&target, stream)
        };
        let classify_stage = |e: &StageError<E>| match e {
            StageError::Fetch(e) => classify(e),
            StageError::Read(_) => ErrorClass::Transient,
            StageError::Write(_) => ErrorClass::Fatal,
        };

        let staged = match runner.execute(&item.id, policy, op, classify_stage) {
            Ok(staged) => staged,
            Err(failure) if failure.is_fatal() => {
                let kind = match failure.error {
                    Some(StageError::Write(_)) => FailureKind::Storage,
                    _ => failure.kind,
                };
                return Err(RunFailure {
                    item_id: Some(item.id.clone()),
                    kind,
                    message: failure.message,
                });
            }
            Err(failure) => {
                log::warn!(target: "engine::store", "Item {} failed: {failure}", item.id);
                let status = failure.item_status();
                let error = ItemError {
                    kind: failure.kind,
                    message: failure.message,
                };
                return Ok(ItemResult::failed(&item.id, status, error));
            }
        };

        self.commit(&item.id, staged, name).map_err(storage)
    }

    fn commit(&self, id: &str, staged: Staged, name: &str) -> io::Result<ItemResult> {
        let mut lock = self.ledger.lock()?;

        if let Some(entry) = lock.get(id) {
            if self.layout.resolve(&entry.path).is_file() {
                log::debug!(target: "engine::store", "Archived concurrently, discarding download: {id}");
                return Ok(deduplicated(id, entry.clone()));
            }
        }

        let (dest, path) = self.destination(&lock, id, name)?;
        staged.file.persist(&dest)?;
        let entry = LedgerEntry {
            path: path.clone(),
            content_hash: staged.content_hash.clone(),
        };
        lock.append(id, entry)?;

        log::debug!(target: "engine::store", "Stored {id} at {} ({} bytes)", dest.display(), staged.bytes);
        Ok(ItemResult {
            item_id: id.to_string(),
            status: ItemStatus::Succeeded,
            error: None,
            bytes_written: staged.bytes,
            content_hash: Some(staged.content_hash),
            path: Some(path),
            deduplicated: false,
        })
    }

    /// Where `id` may be stored: its preferred name unless the ledger assigns that file
    /// to another id, then the name with a hash of `id` appended.
    fn destination(&self, lock: &LedgerLock<'_>, id: &str, name: &str) -> io::Result<(PathBuf, String)> {
        let candidates = [
            self.layout.item_path(name),
            self.layout.disambiguated_item_path(name, id),
        ];
        for dest in candidates {
            let path = self.layout.relative(&dest).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is outside the account directory", dest.display()),
                )
            })?;
            match lock.owner(&path) {
                Some(owner) if owner != id => {
                    log::warn!(target: "engine::store", "{} belongs to {owner}, not storing {id} there", dest.display());
                }
                _ => return Ok((dest, path)),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free file name for {id} in {}", self.layout.snapshot_dir().display()),
        ))
    }

    /// Write the metadata file of a successfully stored item.
    ///
    /// Items archived by an earlier snapshot date keep the metadata written back then;
    /// a deduplicated item of this snapshot only gets one if it is missing.
    pub fn record_metadata(
        &self,
        item: &ItemMetadata,
        result: &ItemResult,
        as_of: DateTime<Utc>,
    ) -> io::Result<()> {
        let Some(rel) = result.path.as_deref().filter(|_| result.is_success()) else {
            return Ok(());
        };
        let file = self.layout.resolve(rel);
        if file.parent() != Some(self.layout.snapshot_dir()) {
            return Ok(());
        }
        let Some(path) = metadata::record_path(&file) else {
            return Ok(());
        };
        if result.deduplicated && path.is_file() {
            return Ok(());
        }

        ItemRecord::new(item, result, as_of).write(&path)?;
        log::trace!(target: "engine::store", "Wrote metadata of {} to {}", item.id, path.display());
        Ok(())
    }
}

fn deduplicated(id: &str, entry: LedgerEntry) -> ItemResult {
    ItemResult {
        item_id: id.to_string(),
        status: ItemStatus::Succeeded,
        error: None,
        bytes_written: 0,
        content_hash: Some(entry.content_hash),
        path: Some(entry.path),
        deduplicated: true,
    }
}
