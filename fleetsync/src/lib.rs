//! fleetsync convergence library
//!
//! Drives eventually-consistent fleet-management resources to a desired
//! state: waits for objects to reach a status, retries through role
//! propagation races, reconciles shared-resource grantees in batches and
//! resolves platform-owned singletons.
//!
//! # Example
//! ```ignore
//! use fleetsync::{Engine, EngineConfig, GranteeSet};
//!
//! let engine = Engine::new(Arc::new(client), EngineConfig::default())?;
//! let id = engine.with_retry(|| client.create_activation(&role)).await?;
//! let spec = engine.wait_spec(["Pending"], ["Active"])?;
//! engine.wait_for(&id, &spec).await?;
//! engine.reconcile_permissions("my-doc", &previous, &desired).await?;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod permissions;
pub mod remote;
pub mod retry;
pub mod singleton;
pub mod status;
pub mod waiter;

// Re-export commonly used types at crate root
pub use config::{DefaultsConfig, EngineConfig, PermissionsConfig, RestorePolicy, RetryConfig, WaitConfig};
pub use engine::Engine;
pub use error::{ConfigError, ConvergeError, RemoteError, Result};
pub use permissions::{BatchPhase, GranteeSet, PermissionDelta, PermissionReconciler, ReconcileReport};
pub use remote::{
    Candidate, CandidateSource, ControlPlane, DefaultRegistry, Describe, GranteeId, ListFilter, Page,
    PageToken, PermissionApi, PermissionKind, RemoteObject, ResourceId,
};
pub use retry::{ErrorSignature, RetryPolicy, SignatureClassifier, TransientClassifier};
pub use singleton::{CandidateFilter, RestoreReport, RestoreWarning, RestoreWarningKind};
pub use status::{DescribeProber, FieldProber, Probe, Status, StatusProber};
pub use waiter::{Converged, WaitSpec};
