#![allow(dead_code)]

use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::NaiveDate;
use snap_backup_lib::config::EngineConfig;
use snap_backup_lib::connector::{Connector, ErrorClass, ItemStream};
use snap_backup_lib::model::{ItemMetadata, ListFilters, SnapshotRequest};
use snap_backup_lib::orchestrator::CancelToken;
use snap_backup_lib::retry::RetryPolicy;

pub const ACCOUNT: &str = "octocat";

#[derive(Debug, Clone, PartialEq)]
pub enum FakeError {
    NotFound,
    Unavailable,
    Throttled,
    AuthRevoked,
}

impl fmt::Display for FakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::NotFound => "404 not found",
            Self::Unavailable => "503 service unavailable",
            Self::Throttled => "429 too many requests",
            Self::AuthRevoked => "401 token revoked",
        };
        f.write_str(msg)
    }
}

/// In-memory connector with scripted failures.
#[derive(Default)]
pub struct Scripted {
    items: Vec<ItemMetadata>,
    list_failures: Mutex<Vec<FakeError>>,
    /// Errors returned by successive fetches of an id before it succeeds.
    fetch_failures: Mutex<HashMap<String, Vec<FakeError>>>,
    cancel_after: Option<(String, CancelToken)>,
    fetch_delay: Option<Duration>,
    pub list_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub identity_calls: AtomicUsize,
    /// Fetches that ran to completion, including ones the engine stopped waiting for.
    pub fetches_done: AtomicUsize,
    fetched: Mutex<Vec<String>>,
}

impl Scripted {
    pub fn new(items: Vec<ItemMetadata>) -> Self {
        Self {
            items,
            ..Default::default()
        }
    }

    /// Items `item-1` .. `item-n` without timestamps.
    pub fn numbered(n: usize) -> Self {
        Self::new(
            (1..=n)
                .map(|i| ItemMetadata::new(format!("item-{i}")))
                .collect(),
        )
    }

    pub fn failing_list(self, errors: Vec<FakeError>) -> Self {
        *self.list_failures.lock().unwrap() = errors;
        self
    }

    pub fn failing_fetch(self, id: &str, errors: Vec<FakeError>) -> Self {
        self.fetch_failures
            .lock()
            .unwrap()
            .insert(id.to_string(), errors);
        self
    }

    /// Cancel `token` once `id` has been fetched.
    pub fn cancelling_after(mut self, id: &str, token: CancelToken) -> Self {
        self.cancel_after = Some((id.to_string(), token));
        self
    }

    /// Make every fetch take `delay`.
    pub fn slow_fetch(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
            + self.fetch_calls.load(Ordering::SeqCst)
            + self.identity_calls.load(Ordering::SeqCst)
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

struct Done<'a>(&'a AtomicUsize);

impl Drop for Done<'_> {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn body(id: &str) -> Vec<u8> {
    format!("content of {id}\n").into_bytes()
}

impl Connector for Scripted {
    type Error = FakeError;

    fn list_items(&self, _filters: &ListFilters) -> Result<Vec<ItemMetadata>, FakeError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut failures = self.list_failures.lock().unwrap();
        if !failures.is_empty() {
            return Err(failures.remove(0));
        }
        Ok(self.items.clone())
    }

    fn fetch_item(&self, item: &ItemMetadata) -> Result<ItemStream, FakeError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            std::thread::sleep(delay);
        }
        let _done = Done(&self.fetches_done);
        if let Some(errors) = self.fetch_failures.lock().unwrap().get_mut(&item.id) {
            if !errors.is_empty() {
                return Err(errors.remove(0));
            }
        }

        self.fetched.lock().unwrap().push(item.id.clone());
        if let Some((id, token)) = &self.cancel_after {
            if *id == item.id {
                token.cancel();
            }
        }
        Ok(Box::new(Cursor::new(body(&item.id))))
    }

    fn classify(&self, error: &FakeError) -> ErrorClass {
        match error {
            FakeError::NotFound => ErrorClass::Permanent,
            FakeError::Unavailable => ErrorClass::Transient,
            FakeError::Throttled => ErrorClass::RateLimited {
                retry_after: Some(Duration::from_millis(5)),
            },
            FakeError::AuthRevoked => ErrorClass::Fatal,
        }
    }

    fn account_identity(&self) -> String {
        self.identity_calls.fetch_add(1, Ordering::SeqCst);
        ACCOUNT.to_string()
    }
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        rate_limit_attempts: 3,
        base_delay_ms: 1,
        multiplier: 2.0,
        jitter: 0.0,
        max_delay_ms: 20,
        timeout_ms: Some(5_000),
    }
}

pub fn engine(workers: usize) -> EngineConfig {
    EngineConfig {
        workers,
        fetch: fast_policy(),
        listing: fast_policy(),
    }
}

pub fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, day).unwrap()
}

pub fn request(root: &Path, day: u32) -> SnapshotRequest {
    SnapshotRequest::new("github", ACCOUNT, "repos", date(day), root)
}
