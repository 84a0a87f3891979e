//! Engine configuration.
//!
//! Every section has defaults matching the remote API's documented limits,
//! so an empty JSON object is a valid configuration.

use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::{ErrorSignature, RetryPolicy};
use crate::status::Status;
use crate::waiter::WaitSpec;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub wait: WaitConfig,
    pub retry: RetryConfig,
    pub permissions: PermissionsConfig,
    pub defaults: DefaultsConfig,
}

impl EngineConfig {
    /// Load and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let load_err = |reason: String| ConfigError::Load {
            path: path.display().to_string(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| load_err(e.to_string()))?;
        let config: EngineConfig =
            serde_json::from_str(&raw).map_err(|e| load_err(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges and compile the name pattern.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wait.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "wait.poll_interval_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.retry.min_backoff_ms == 0 || self.retry.min_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid {
                field: "retry.min_backoff_ms",
                reason: format!(
                    "must be in 1..={} (max_backoff_ms)",
                    self.retry.max_backoff_ms
                ),
            });
        }
        if let Some(sig) = self
            .retry
            .transient_signatures
            .iter()
            .find(|s| s.code.is_empty())
        {
            return Err(ConfigError::Invalid {
                field: "retry.transient_signatures",
                reason: format!("signature {:?} has an empty code", sig.message_contains),
            });
        }
        self.permissions.batch_limit()?;
        self.defaults.name_regex()?;
        if self.defaults.max_pages == 0 {
            return Err(ConfigError::Invalid {
                field: "defaults.max_pages",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Sections
// =============================================================================

/// Convergence waiter defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
    pub not_found_checks: u32,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            timeout_secs: 600,
            not_found_checks: 20,
        }
    }
}

impl WaitConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Build a [`WaitSpec`] using the configured timing.
    pub fn spec<P, T>(&self, pending: P, target: T) -> Result<WaitSpec, ConfigError>
    where
        P: IntoIterator,
        P::Item: Into<Status>,
        T: IntoIterator,
        T::Item: Into<Status>,
    {
        Ok(WaitSpec::new(pending, target, self.timeout())?
            .poll_interval(self.poll_interval())?
            .not_found_checks(self.not_found_checks))
    }
}

/// Bounded retrier defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub timeout_secs: u64,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub transient_signatures: Vec<ErrorSignature>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            min_backoff_ms: 500,
            max_backoff_ms: 10_000,
            transient_signatures: ErrorSignature::role_propagation(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(self.timeout_secs),
            min_backoff: Duration::from_millis(self.min_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Permission reconciler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Maximum grantees per add/remove call.
    pub batch_limit: usize,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self { batch_limit: 20 }
    }
}

impl PermissionsConfig {
    pub fn batch_limit(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.batch_limit).ok_or(ConfigError::Invalid {
            field: "permissions.batch_limit",
            reason: "must be greater than zero".to_string(),
        })
    }
}

/// What to do when the platform default cannot be resolved unambiguously on restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestorePolicy {
    /// Skip the restore and report a warning.
    #[default]
    Warn,
    /// Fail the enclosing operation.
    Strict,
}

/// Singleton resolver settings for platform-owned defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    pub platform_owner: String,
    pub name_pattern: String,
    pub restore_policy: RestorePolicy,
    pub max_pages: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            platform_owner: "AWS".to_string(),
            name_pattern: r"^AWS-[A-Za-z0-9]*DefaultPatchBaseline$".to_string(),
            restore_policy: RestorePolicy::Warn,
            max_pages: 100,
        }
    }
}

impl DefaultsConfig {
    pub fn name_regex(&self) -> Result<Regex, ConfigError> {
        Regex::new(&self.name_pattern).map_err(|e| ConfigError::Pattern {
            pattern: self.name_pattern.clone(),
            reason: e.to_string(),
        })
    }
}
