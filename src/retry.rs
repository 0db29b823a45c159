//! Retry, backoff and timeout policy for remote operations.
//!
//! Every remote call (listing, fetching, downloading) goes through a
//! [RetryingTaskRunner]. The connector classifies each error into an [ErrorClass] and
//! the runner enforces the policy for that class:
//!
//! - [`ErrorClass::RateLimited`]: retried after the server's `retry_after` (capped at
//!   `max_delay_ms`) or with backoff. Counts against `rate_limit_attempts` only.
//! - [`ErrorClass::Transient`] and attempt timeouts: retried with exponential backoff and
//!   jitter until `max_attempts` is spent.
//! - [`ErrorClass::Permanent`] and [`ErrorClass::Fatal`]: returned immediately.

use std::fmt::{self, Display};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::Rng;

use crate::connector::ErrorClass;
use crate::model::{FailureKind, ItemStatus};

/// Retry parameters for one class of operation.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts allowed for transient failures and timeouts.
    pub max_attempts: u32,
    /// Attempts allowed while the remote keeps rate limiting.
    pub rate_limit_attempts: u32,
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Factor applied to the delay after every retry.
    pub multiplier: f64,
    /// Random spread of each delay as a fraction of it (`0.1` = ±10%).
    pub jitter: f64,
    /// Upper bound on any single delay, including server supplied ones.
    pub max_delay_ms: u64,
    /// Hard limit on the wall-clock time of one attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl RetryPolicy {
    /// Policy for short operations like fetching a single item.
    pub fn short() -> Self {
        Self {
            max_attempts: 3,
            rate_limit_attempts: 5,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.1,
            max_delay_ms: 60_000,
            timeout_ms: Some(300_000),
        }
    }

    /// Policy for long sweeps like a full enumeration.
    pub fn long() -> Self {
        Self {
            max_attempts: 3,
            rate_limit_attempts: 5,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            jitter: 0.1,
            max_delay_ms: 120_000,
            timeout_ms: Some(3_600_000),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    fn cap(&self, delay: Duration) -> Duration {
        delay.min(Duration::from_millis(self.max_delay_ms))
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(64) as i32;
        let millis = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        self.cap(Duration::from_millis(millis.min(u64::MAX as f64) as u64))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = self.jitter.min(1.0);
        let factor = 1.0 + rand::rng().random_range(-spread..=spread);
        self.cap(delay.mul_f64(factor.max(0.0)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::short()
    }
}

/// An operation that ran out of retries or must not be retried.
#[derive(Debug)]
pub struct TaskFailure<E> {
    /// Kind of the last failure.
    pub kind: FailureKind,
    pub attempts: u32,
    /// The last error, absent for timeouts and crashed attempts.
    pub error: Option<E>,
    pub message: String,
}

impl<E: Display> TaskFailure<E> {
    fn from_error(kind: FailureKind, attempts: u32, error: E) -> Self {
        Self {
            kind,
            attempts,
            message: error.to_string(),
            error: Some(error),
        }
    }
}

impl<E> TaskFailure<E> {
    fn without_error(kind: FailureKind, attempts: u32, message: String) -> Self {
        Self {
            kind,
            attempts,
            error: None,
            message,
        }
    }

    /// Whether the failure must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, FailureKind::Fatal | FailureKind::Storage)
    }

    /// Item status recorded for a non-fatal failure.
    pub fn item_status(&self) -> ItemStatus {
        match self.kind {
            FailureKind::Permanent => ItemStatus::FailedPermanent,
            _ => ItemStatus::FailedTransientExhausted,
        }
    }
}

impl<E> Display for TaskFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} attempt(s): {}",
            self.kind, self.attempts, self.message
        )
    }
}

enum Attempt<T, E> {
    Done(Result<T, E>),
    TimedOut(Duration, JoinHandle<()>),
    Crashed(String),
}

/// Executes remote operations under a [RetryPolicy].
#[derive(Debug, Clone, Default)]
pub struct RetryingTaskRunner;

impl RetryingTaskRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run `op` until it succeeds or the policy gives up.
    ///
    /// With a timeout configured, each attempt runs on its own thread. An attempt that
    /// overruns is abandoned and the next one starts; its result is dropped. Abandoned
    /// attempts are joined before this returns, so no call outlives `execute`.
    pub fn execute<T, E, F, C>(
        &self,
        label: &str,
        policy: &RetryPolicy,
        op: F,
        classify: C,
    ) -> Result<T, TaskFailure<E>>
    where
        T: Send + 'static,
        E: Display + Send + 'static,
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        C: Fn(&E) -> ErrorClass,
    {
        let mut abandoned = Vec::new();
        let result = Self::retry(label, policy, op, classify, &mut abandoned);

        if !abandoned.is_empty() {
            log::debug!(target: "engine::retry", "{label}: waiting for {} abandoned attempt(s)", abandoned.len());
        }
        for handle in abandoned {
            if handle.join().is_err() {
                log::warn!(target: "engine::retry", "{label}: abandoned attempt panicked");
            }
        }
        result
    }

    fn retry<T, E, F, C>(
        label: &str,
        policy: &RetryPolicy,
        op: F,
        classify: C,
        abandoned: &mut Vec<JoinHandle<()>>,
    ) -> Result<T, TaskFailure<E>>
    where
        T: Send + 'static,
        E: Display + Send + 'static,
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        C: Fn(&E) -> ErrorClass,
    {
        let op = Arc::new(op);
        let mut attempts = 0;
        let mut transient = 0;
        let mut rate_limited = 0;

        loop {
            attempts += 1;
            log::trace!(target: "engine::retry", "{label}: attempt {attempts}");

            let (kind, message, delay) = match Self::attempt(&op, policy.timeout()) {
                Attempt::Done(Ok(value)) => return Ok(value),
                Attempt::Done(Err(error)) => match classify(&error) {
                    ErrorClass::Permanent => {
                        return Err(TaskFailure::from_error(
                            FailureKind::Permanent,
                            attempts,
                            error,
                        ))
                    }
                    ErrorClass::Fatal => {
                        return Err(TaskFailure::from_error(FailureKind::Fatal, attempts, error))
                    }
                    ErrorClass::Transient => {
                        transient += 1;
                        if transient >= policy.max_attempts {
                            return Err(TaskFailure::from_error(
                                FailureKind::Transient,
                                attempts,
                                error,
                            ));
                        }
                        let delay = policy.jittered(policy.backoff(transient));
                        (FailureKind::Transient, error.to_string(), delay)
                    }
                    ErrorClass::RateLimited { retry_after } => {
                        rate_limited += 1;
                        if rate_limited >= policy.rate_limit_attempts {
                            return Err(TaskFailure::from_error(
                                FailureKind::RateLimited,
                                attempts,
                                error,
                            ));
                        }
                        let delay = match retry_after {
                            Some(after) => policy.cap(after),
                            None => policy.jittered(policy.backoff(rate_limited)),
                        };
                        (FailureKind::RateLimited, error.to_string(), delay)
                    }
                },
                Attempt::TimedOut(limit, handle) => {
                    abandoned.push(handle);
                    transient += 1;
                    let message = format!("timed out after {limit:?}");
                    if transient >= policy.max_attempts {
                        return Err(TaskFailure::without_error(
                            FailureKind::Timeout,
                            attempts,
                            message,
                        ));
                    }
                    let delay = policy.jittered(policy.backoff(transient));
                    (FailureKind::Timeout, message, delay)
                }
                Attempt::Crashed(message) => {
                    return Err(TaskFailure::without_error(
                        FailureKind::Permanent,
                        attempts,
                        message,
                    ))
                }
            };

            log::warn!(
                target: "engine::retry",
                "{label}: {kind} failure on attempt {attempts}, retrying in {delay:?}: {message}"
            );
            thread::sleep(delay);
        }
    }

    fn attempt<T, E, F>(op: &Arc<F>, timeout: Option<Duration>) -> Attempt<T, E>
    where
        T: Send + 'static,
        E: Send + 'static,
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
    {
        let Some(limit) = timeout else {
            return Attempt::Done(op());
        };

        let (tx, rx) = mpsc::sync_channel(1);
        let op = Arc::clone(op);
        let spawned = thread::Builder::new()
            .name("snap-attempt".into())
            .spawn(move || {
                // The receiver is gone when the attempt was abandoned.
                let _ = tx.send(op());
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => return Attempt::Crashed(format!("unable to spawn attempt thread: {e}")),
        };

        match rx.recv_timeout(limit) {
            Ok(result) => {
                let _ = handle.join();
                Attempt::Done(result)
            }
            Err(RecvTimeoutError::Timeout) => Attempt::TimedOut(limit, handle),
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                Attempt::Crashed("operation panicked".into())
            }
        }
    }
}
