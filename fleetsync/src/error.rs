//! Error types for the convergence engine.

use std::time::Duration;

use thiserror::Error;

use crate::permissions::BatchPhase;
use crate::remote::{RemoteObject, ResourceId};
use crate::status::Status;

/// Errors reported by the remote control plane.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The API rejected the request with a code and message.
    #[error("{code}: {message}")]
    Api { code: String, message: String },

    /// The API asked us to slow down.
    #[error("throttled: {message}")]
    Throttled { message: String },

    /// The request never reached the API or the response was lost.
    #[error("transport: {0}")]
    Transport(String),
}

impl RemoteError {
    /// Shorthand for an API error.
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError::Api {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Error code, if the API returned one.
    pub fn code(&self) -> Option<&str> {
        match self {
            RemoteError::Api { code, .. } => Some(code),
            RemoteError::Throttled { .. } => Some("ThrottlingException"),
            RemoteError::Transport(_) => None,
        }
    }

    /// Human readable message.
    pub fn message(&self) -> &str {
        match self {
            RemoteError::Api { message, .. } | RemoteError::Throttled { message } => message,
            RemoteError::Transport(message) => message,
        }
    }
}

/// Invalid engine or wait configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A status appears in both the pending and the target set.
    #[error("status {0} is both pending and target")]
    OverlappingStates(Status),

    /// The target set is empty.
    #[error("wait target set is empty")]
    EmptyTarget,

    /// A value is out of range.
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// The default baseline name pattern does not compile.
    #[error("invalid name pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    /// The configuration file could not be read or parsed.
    #[error("load {path}: {reason}")]
    Load { path: String, reason: String },
}

/// Errors returned by the waiter, retrier, reconciler and resolver.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// The remote object is confirmed absent.
    #[error("not found: {id}")]
    NotFound { id: ResourceId },

    /// A dependency was still not visible after the retry deadline and the final attempt.
    #[error("dependency not yet propagated after {attempts} attempts: {source}")]
    TransientDependency {
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    /// The object reached a status outside the pending and target sets.
    #[error("{id} reached unexpected status {status} (expected one of {expected:?}){}", reason_suffix(.reason))]
    ConvergenceFailed {
        id: ResourceId,
        status: Status,
        expected: Vec<Status>,
        reason: Option<String>,
        object: Option<Box<RemoteObject>>,
    },

    /// The object was still pending when the wait deadline passed.
    #[error("timeout after {timeout:?} waiting for {id} to reach {expected:?} (last status: {status}){}", reason_suffix(.reason))]
    ConvergenceTimedOut {
        id: ResourceId,
        status: Status,
        expected: Vec<Status>,
        timeout: Duration,
        reason: Option<String>,
        object: Option<Box<RemoteObject>>,
    },

    /// A singleton lookup matched nothing.
    #[error("empty result for {filter}")]
    EmptyResult { filter: String },

    /// A singleton lookup matched more than one candidate.
    #[error("too many results for {filter}: wanted 1, got {count}")]
    TooManyResults { filter: String, count: usize },

    /// A permission batch failed partway through a reconciliation.
    #[error("{phase} batch failed for {resource} ({applied} applied, {unapplied} not applied): {source}")]
    BatchOperationFailed {
        resource: String,
        phase: BatchPhase,
        applied: usize,
        unapplied: usize,
        #[source]
        source: RemoteError,
    },

    /// Listing kept returning page tokens past the configured limit.
    #[error("listing did not finish within {pages} pages")]
    PageLimitExceeded { pages: usize },

    /// The caller cancelled the operation.
    #[error("cancelled")]
    Cancelled,

    /// Non-retryable remote error.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ConvergeError {
    /// True if the remote object is gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ConvergeError::NotFound { .. })
    }

    /// True if a deadline passed without reaching the target.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ConvergeError::ConvergenceTimedOut { .. } | ConvergeError::TransientDependency { .. }
        )
    }

    /// True for the singleton ambiguity classifications.
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            ConvergeError::EmptyResult { .. } | ConvergeError::TooManyResults { .. }
        )
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(r) if !r.is_empty() => format!(": {}", r),
        _ => String::new(),
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;
