//! Runs one snapshot of one connector account from start to manifest.
//!
//! ```text
//! NotStarted -> Listing -> Processing -> Finalizing -> Succeeded | Partial | Failed
//!                  \-------------------------------------------------------^
//! ```
//!
//! A complete snapshot short-circuits before `Listing`. A run holds the snapshot's run
//! lock from before `Listing` until its manifest is written, and starts by removing
//! temporary files an interrupted run left behind. A failed listing goes straight
//! to `Failed`. A fatal item error ends `Processing` early. Every terminal state writes
//! exactly one manifest; cancellation and errors before the snapshot directory exists
//! write none.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{DateTime, Utc};
use derive_more::{Display, Error};

use crate::config::EngineConfig;
use crate::connector::Connector;
use crate::guard::{GuardOutcome, IdempotencyGuard};
use crate::layout::SnapshotLayout;
use crate::manifest::{Manifest, ManifestWriteError, ManifestWriter};
use crate::model::{
    FailureKind, ItemMetadata, ItemResult, RunFailure, RunStatus, SnapshotRequest, SnapshotRun,
};
use crate::order::{apply_filters, deterministic_order};
use crate::retry::RetryingTaskRunner;
use crate::store::ContentAddressedStore;
use crate::util::atomic::sweep_partials;

/// Cooperative cancellation shared between a caller and a running snapshot.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the run to stop before its next item.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Phase of a snapshot run.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Listing,
    Processing,
    Finalizing,
    Succeeded,
    Partial,
    Failed,
}

impl RunState {
    fn can_advance_to(self, next: Self) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (NotStarted, Listing)
                | (Listing, Processing)
                | (Listing, Failed)
                | (Processing, Finalizing)
                | (Finalizing, Succeeded | Partial | Failed)
        )
    }
}

impl From<RunStatus> for RunState {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Running => Self::Finalizing,
            RunStatus::Succeeded => Self::Succeeded,
            RunStatus::Partial => Self::Partial,
            RunStatus::Failed => Self::Failed,
        }
    }
}

/// Errors that leave no manifest behind.
#[derive(Debug, Display, Error)]
pub enum RunError {
    /// The snapshot directory can't be created.
    #[display("Creating snapshot directory {} failed: {source}", path.display())]
    Layout { path: PathBuf, source: io::Error },
    /// The run lock of the snapshot can't be taken.
    #[display("Locking snapshot {} failed: {source}", path.display())]
    RunLock { path: PathBuf, source: io::Error },
    /// The download archive can't be opened.
    #[display("Opening the download archive failed: {_0}")]
    Ledger(io::Error),
    /// The connector is logged into a different account than requested.
    #[display("Connector account {actual:?} does not match requested account {expected:?}")]
    AccountMismatch { expected: String, actual: String },
    /// The caller cancelled the run.
    #[display("Snapshot run was cancelled")]
    Cancelled,
    /// The manifest of a finished run could not be persisted.
    #[display("{_0}")]
    Manifest(ManifestWriteError),
}

/// Drives a [Connector] through one snapshot.
pub struct SnapshotOrchestrator<C> {
    connector: Arc<C>,
    config: EngineConfig,
    runner: RetryingTaskRunner,
    guard: IdempotencyGuard,
    writer: ManifestWriter,
    cancel: CancelToken,
}

struct Tracker {
    state: RunState,
}

impl Tracker {
    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {next}",
            self.state
        );
        log::debug!(target: "engine::orchestrator", "{} -> {next}", self.state);
        self.state = next;
    }
}

impl<C: Connector> SnapshotOrchestrator<C> {
    pub fn new(connector: C, config: EngineConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            config,
            runner: RetryingTaskRunner::new(),
            guard: IdempotencyGuard,
            writer: ManifestWriter,
            cancel: CancelToken::new(),
        }
    }

    /// Use `token` to cancel runs of this orchestrator.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Execute `request`, or return the existing manifest if it is already complete.
    ///
    /// Partial success is a normal outcome: inspect [`Manifest::status`].
    pub fn run(&self, request: &SnapshotRequest) -> Result<Manifest, RunError> {
        let layout = SnapshotLayout::new(request);
        let mut tracker = Tracker {
            state: RunState::NotStarted,
        };

        if let GuardOutcome::Complete(manifest) = self.guard.check(&layout) {
            return Ok(manifest);
        }
        if self.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let actual = self.connector.account_identity();
        if actual != request.account() {
            return Err(RunError::AccountMismatch {
                expected: request.account().to_string(),
                actual,
            });
        }

        fs::create_dir_all(layout.snapshot_dir()).map_err(|source| RunError::Layout {
            path: layout.snapshot_dir().to_path_buf(),
            source,
        })?;
        let _run_lock = lock_run(&layout.run_lock_path())?;
        if let GuardOutcome::Complete(manifest) = self.guard.check(&layout) {
            log::debug!(target: "engine::orchestrator", "Snapshot completed while waiting for its lock");
            return Ok(manifest);
        }
        sweep(layout.snapshot_dir());
        sweep(&layout.metadata_dir());

        let store = ContentAddressedStore::open(layout.clone()).map_err(RunError::Ledger)?;

        log::info!(
            target: "engine::orchestrator",
            "Starting snapshot {} of {}/{} ({})",
            request.snapshot_date(),
            request.connector(),
            request.account(),
            request.content_type(),
        );
        let mut run = SnapshotRun::start(request.clone());

        tracker.advance(RunState::Listing);
        match self.list(request) {
            Ok(items) => {
                run.item_count = items.len();
                tracker.advance(RunState::Processing);
                self.process(&store, &items, &mut run)?;
                tracker.advance(RunState::Finalizing);
            }
            Err(failure) => {
                log::error!(target: "engine::orchestrator", "Listing failed: {}", failure.message);
                run.fatal = Some(failure);
            }
        }

        let status = run.finish();
        tracker.advance(status.into());
        log::info!(
            target: "engine::orchestrator",
            "Snapshot {} finished {status} after {:.1}s",
            request.snapshot_date(),
            run.started.elapsed().as_secs_f64(),
        );

        self.writer
            .write(&run, &layout.manifest_path())
            .map_err(RunError::Manifest)
    }

    fn list(&self, request: &SnapshotRequest) -> Result<Vec<ItemMetadata>, RunFailure> {
        let connector = Arc::clone(&self.connector);
        let filters = request.filters().clone();
        let op = move || connector.list_items(&filters);

        let items = self
            .runner
            .execute("list", &self.config.listing, op, |e| self.connector.classify(e))
            .map_err(|failure| RunFailure {
                item_id: None,
                kind: failure.kind,
                message: format!("listing failed: {}", failure.message),
            })?;

        let listed = items.len();
        let items = apply_filters(deterministic_order(items), request.filters());
        log::info!(target: "engine::orchestrator", "Listed {listed} items, processing {}", items.len());
        Ok(items)
    }

    fn process_item(
        &self,
        store: &ContentAddressedStore,
        item: &ItemMetadata,
        as_of: DateTime<Utc>,
    ) -> Result<ItemResult, RunFailure> {
        let connector = Arc::clone(&self.connector);
        let owned = item.clone();
        let fetch = move || connector.fetch_item(&owned);
        let name = self.connector.file_name(item);

        let result = store.download(
            item,
            &name,
            &self.runner,
            &self.config.fetch,
            fetch,
            |e| self.connector.classify(e),
        )?;
        store
            .record_metadata(item, &result, as_of)
            .map_err(|e| RunFailure {
                item_id: Some(item.id.clone()),
                kind: FailureKind::Storage,
                message: format!("writing metadata failed: {e}"),
            })?;
        log::debug!(target: "engine::orchestrator", "{}: {}", item.id, result.status);
        Ok(result)
    }

    fn process(
        &self,
        store: &ContentAddressedStore,
        items: &[ItemMetadata],
        run: &mut SnapshotRun,
    ) -> Result<(), RunError> {
        let as_of = run.request.as_of();
        if self.config.workers <= 1 {
            for item in items {
                if self.cancel.is_cancelled() {
                    return Err(RunError::Cancelled);
                }
                match self.process_item(store, item, as_of) {
                    Ok(result) => run.results.push(result),
                    Err(failure) => {
                        log::error!(target: "engine::orchestrator", "Aborting run, {}: {}", failure.kind, failure.message);
                        run.fatal = Some(failure);
                        break;
                    }
                }
            }
            return Ok(());
        }

        self.process_pooled(store, items, as_of, run)
    }

    fn process_pooled(
        &self,
        store: &ContentAddressedStore,
        items: &[ItemMetadata],
        as_of: DateTime<Utc>,
        run: &mut SnapshotRun,
    ) -> Result<(), RunError> {
        let next = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let results = Mutex::new(Vec::with_capacity(items.len()));
        let fatal: Mutex<Option<(usize, RunFailure)>> = Mutex::new(None);

        let workers = self.config.workers.min(items.len()).max(1);
        log::debug!(target: "engine::orchestrator", "Processing with {workers} workers");

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if abort.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
                        break;
                    }
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(item) = items.get(index) else {
                        break;
                    };

                    match self.process_item(store, item, as_of) {
                        Ok(result) => lock(&results).push((index, result)),
                        Err(failure) => {
                            abort.store(true, Ordering::SeqCst);
                            log::error!(target: "engine::orchestrator", "Aborting run, {}: {}", failure.kind, failure.message);
                            let mut fatal = lock(&fatal);
                            if fatal.as_ref().is_none_or(|(first, _)| index < *first) {
                                *fatal = Some((index, failure));
                            }
                        }
                    }
                });
            }
        });

        let fatal = fatal.into_inner().unwrap_or_else(|p| p.into_inner());
        if fatal.is_none() && self.cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let mut results = results.into_inner().unwrap_or_else(|p| p.into_inner());
        results.sort_by_key(|(index, _)| *index);
        run.results = results.into_iter().map(|(_, result)| result).collect();
        run.fatal = fatal.map(|(_, failure)| failure);
        Ok(())
    }
}

/// Take the exclusive run lock of a snapshot, waiting for a concurrent run to finish.
fn lock_run(path: &Path) -> Result<File, RunError> {
    let locked = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .and_then(|file| file.lock().map(|()| file));
    locked.map_err(|source| RunError::RunLock {
        path: path.to_path_buf(),
        source,
    })
}

fn sweep(dir: &Path) {
    match sweep_partials(dir) {
        Ok(0) => {}
        Ok(n) => log::info!(target: "engine::orchestrator", "Removed {n} stale temporary files from {}", dir.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!(target: "engine::orchestrator", "Could not clean up {}: {e}", dir.display()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
