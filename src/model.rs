//! Data model shared by every stage of a snapshot run.

use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use derive_more::Display;

/// Optional narrowing of what a connector lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilters {
    /// Only items modified at or after this instant.
    pub modified_after: Option<DateTime<Utc>>,
    /// Upper bound on the number of items processed.
    pub max_items: Option<usize>,
}

/// One dated backup request for a `(connector, account)` pair.
///
/// The request is immutable once built; everything a re-run must reproduce derives
/// from it rather than from the wall clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    connector: String,
    account: String,
    content_type: String,
    snapshot_date: NaiveDate,
    filters: ListFilters,
    output_root: PathBuf,
}

impl SnapshotRequest {
    /// Create a request with no filters.
    pub fn new(
        connector: impl Into<String>,
        account: impl Into<String>,
        content_type: impl Into<String>,
        snapshot_date: NaiveDate,
        output_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            connector: connector.into(),
            account: account.into(),
            content_type: content_type.into(),
            snapshot_date,
            filters: ListFilters::default(),
            output_root: output_root.into(),
        }
    }

    /// Same request with the given filters.
    pub fn with_filters(mut self, filters: ListFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn connector(&self) -> &str {
        &self.connector
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn snapshot_date(&self) -> NaiveDate {
        self.snapshot_date
    }

    pub fn filters(&self) -> &ListFilters {
        &self.filters
    }

    pub fn output_root(&self) -> &std::path::Path {
        &self.output_root
    }

    /// The snapshot date at midnight UTC; the only "timestamp" a manifest records.
    pub fn as_of(&self) -> DateTime<Utc> {
        self.snapshot_date.and_time(chrono::NaiveTime::MIN).and_utc()
    }
}

/// Metadata of one remote item as reported by a connector.
///
/// The engine only looks at [`id`](Self::id) and [`last_modified`](Self::last_modified);
/// `payload` belongs to the connector.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemMetadata {
    /// Identifier unique within the `(connector, account)` scope.
    pub id: String,
    pub last_modified: Option<DateTime<Utc>>,
    pub size: Option<u64>,
    pub payload: serde_json::Value,
}

impl ItemMetadata {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            last_modified: None,
            size: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    pub fn sized(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Final state of a single item.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[display("succeeded")]
    Succeeded,
    #[display("failed_permanent")]
    FailedPermanent,
    #[display("failed_transient_exhausted")]
    FailedTransientExhausted,
}

/// Kind of failure as recorded in a manifest.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    #[display("rate_limited")]
    RateLimited,
    #[display("transient")]
    Transient,
    #[display("timeout")]
    Timeout,
    #[display("permanent")]
    Permanent,
    #[display("fatal")]
    Fatal,
    #[display("storage")]
    Storage,
}

/// Error attached to a failed item.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ItemError {
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of processing one [`ItemMetadata`].
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ItemResult {
    pub item_id: String,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemError>,
    pub bytes_written: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// Path of the stored file relative to the account directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub deduplicated: bool,
}

impl ItemResult {
    pub fn failed(item_id: impl Into<String>, status: ItemStatus, error: ItemError) -> Self {
        debug_assert_ne!(status, ItemStatus::Succeeded);
        Self {
            item_id: item_id.into(),
            status,
            error: Some(error),
            bytes_written: 0,
            content_hash: None,
            path: None,
            deduplicated: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Succeeded
    }
}

/// Status of a [`SnapshotRun`] and of the manifest it produces.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[display("running")]
    Running,
    #[display("succeeded")]
    Succeeded,
    #[display("partial")]
    Partial,
    #[display("failed")]
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Whether a manifest with this status marks the snapshot as done.
    pub fn is_complete(self) -> bool {
        matches!(self, Self::Succeeded | Self::Partial)
    }
}

/// A failure that is not tied to a processed item result, e.g. the listing failing
/// or the fatal error that aborted the run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunFailure {
    pub item_id: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

/// In-memory record of one execution; discarded once its manifest is written.
#[derive(Debug)]
pub struct SnapshotRun {
    pub request: SnapshotRequest,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub started: std::time::Instant,
    /// Number of items the run set out to process.
    pub item_count: usize,
    /// Results in deterministic item order.
    pub results: Vec<ItemResult>,
    pub fatal: Option<RunFailure>,
}

impl SnapshotRun {
    pub fn start(request: SnapshotRequest) -> Self {
        Self {
            request,
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            started: std::time::Instant::now(),
            item_count: 0,
            results: Vec::new(),
            fatal: None,
        }
    }

    /// Settle the terminal status from the collected results.
    pub fn finish(&mut self) -> RunStatus {
        self.status = if self.fatal.is_some() {
            RunStatus::Failed
        } else if self.results.iter().all(ItemResult::is_success) {
            RunStatus::Succeeded
        } else {
            RunStatus::Partial
        };
        self.ended_at = Some(Utc::now());
        self.status
    }

    pub fn count(&self, status: ItemStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}
