//! Bounded retrier for dependency-propagation races.
//!
//! Creating an object that references a freshly created role races the
//! control plane's own propagation. Only errors matching a known signature
//! are retried, with exponential backoff, until the deadline. After the
//! deadline exactly one more unconditional attempt is made and its result
//! is returned as is.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ConvergeError, RemoteError, Result};
use crate::remote::ResourceId;
use crate::waiter::{deadline_after, sleep_or_cancel};

// =============================================================================
// Classification
// =============================================================================

/// Decides whether an error means "dependency not visible yet".
pub trait TransientClassifier: Send + Sync {
    fn is_transient(&self, err: &RemoteError) -> bool;
}

impl<F> TransientClassifier for F
where
    F: Fn(&RemoteError) -> bool + Send + Sync,
{
    fn is_transient(&self, err: &RemoteError) -> bool {
        self(err)
    }
}

/// Error code plus optional message fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSignature {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_contains: Option<String>,
}

impl ErrorSignature {
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message_contains: None,
        }
    }

    pub fn message(code: impl Into<String>, fragment: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message_contains: Some(fragment.into()),
        }
    }

    pub fn matches(&self, err: &RemoteError) -> bool {
        if err.code() != Some(self.code.as_str()) {
            return false;
        }
        match &self.message_contains {
            Some(fragment) => err.message().contains(fragment.as_str()),
            None => true,
        }
    }

    /// Signatures the API returns while a new role is still propagating.
    ///
    /// Each entry names the exact message fragment of one create call, so a
    /// genuine authorization or validation failure is never retried.
    pub fn role_propagation() -> Vec<Self> {
        vec![
            // CreateActivation
            Self::message("ValidationException", "Nonexistent role"),
            // RegisterTaskWithMaintenanceWindow
            Self::message("ValidationException", "Not existing role"),
            // CreateFunction
            Self::message(
                "InvalidParameterValueException",
                "The role defined for the function cannot be assumed",
            ),
            // GrantPermissions
            Self::message("InvalidInputException", "Invalid principal"),
        ]
    }
}

/// Matches errors against a list of signatures.
#[derive(Debug, Clone, Default)]
pub struct SignatureClassifier {
    signatures: Vec<ErrorSignature>,
}

impl SignatureClassifier {
    pub fn new(signatures: Vec<ErrorSignature>) -> Self {
        Self { signatures }
    }
}

impl TransientClassifier for SignatureClassifier {
    fn is_transient(&self, err: &RemoteError) -> bool {
        self.signatures.iter().any(|s| s.matches(err))
    }
}

// =============================================================================
// Retry loop
// =============================================================================

/// Deadline and backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            min_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// deadline passes. On deadline a final attempt decides the outcome.
pub async fn with_retry<T, C, F, Fut>(
    policy: &RetryPolicy,
    classifier: &C,
    cancel: &CancellationToken,
    op: F,
) -> Result<T>
where
    C: TransientClassifier + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, RemoteError>>,
{
    match retry_until(policy, cancel, |e: &RemoteError| classifier.is_transient(e), op).await {
        Ok(value) => Ok(value),
        Err(Failure::Exhausted { attempts, last }) => Err(ConvergeError::TransientDependency {
            attempts,
            source: last,
        }),
        Err(Failure::Fatal(e)) => Err(ConvergeError::Remote(e)),
        Err(Failure::Cancelled) => Err(ConvergeError::Cancelled),
    }
}

/// Re-read a just-created object while the API still reports it absent.
pub async fn retry_when_new_not_found<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    id: &ResourceId,
    mut read: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<Option<T>, RemoteError>>,
{
    let outcome = retry_until(
        policy,
        cancel,
        |miss: &ReadMiss| matches!(miss, ReadMiss::Absent),
        || {
            let fut = read();
            async move {
                match fut.await {
                    Ok(Some(value)) => Ok(value),
                    Ok(None) => Err(ReadMiss::Absent),
                    Err(e) => Err(ReadMiss::Remote(e)),
                }
            }
        },
    )
    .await;

    match outcome {
        Ok(value) => Ok(value),
        Err(Failure::Exhausted { .. }) | Err(Failure::Fatal(ReadMiss::Absent)) => {
            Err(ConvergeError::NotFound { id: id.clone() })
        }
        Err(Failure::Fatal(ReadMiss::Remote(e))) => Err(ConvergeError::Remote(e)),
        Err(Failure::Cancelled) => Err(ConvergeError::Cancelled),
    }
}

enum ReadMiss {
    Absent,
    Remote(RemoteError),
}

enum Failure<E> {
    /// Still retryable after the final attempt.
    Exhausted { attempts: u32, last: E },
    Fatal(E),
    Cancelled,
}

async fn retry_until<T, E, R, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    retryable: R,
    mut op: F,
) -> std::result::Result<T, Failure<E>>
where
    R: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let deadline = deadline_after(Instant::now(), policy.timeout);
    let mut backoff = policy.min_backoff;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Failure::Cancelled),
            result = op() => result,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if retryable(&e) => {}
            Err(e) => return Err(Failure::Fatal(e)),
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let pause = backoff.min(deadline - now);
        debug!(attempt = attempts, backoff = ?pause, "Dependency not ready, retrying");
        if sleep_or_cancel(pause, cancel).await.is_err() {
            return Err(Failure::Cancelled);
        }
        backoff = backoff.saturating_mul(2).min(policy.max_backoff);

        if Instant::now() >= deadline {
            break;
        }
    }

    attempts += 1;
    debug!(attempt = attempts, "Retry deadline passed, final attempt");
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Failure::Cancelled),
        result = op() => result,
    };
    match result {
        Ok(value) => Ok(value),
        Err(e) if retryable(&e) => Err(Failure::Exhausted { attempts, last: e }),
        Err(e) => Err(Failure::Fatal(e)),
    }
}
