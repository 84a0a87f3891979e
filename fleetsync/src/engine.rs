//! Engine façade.
//!
//! Bundles the client handle, configuration, transient-error classifier and
//! cancellation token so resource controllers call one object instead of
//! threading those through every component.

use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{RemoteError, Result};
use crate::permissions::{GranteeSet, PermissionReconciler, ReconcileReport};
use crate::remote::{Candidate, ControlPlane, PermissionKind, ResourceId};
use crate::retry::{self, RetryPolicy, SignatureClassifier, TransientClassifier};
use crate::singleton::{self, CandidateFilter, RestoreReport};
use crate::status::{DescribeProber, Status, StatusProber};
use crate::waiter::{self, Converged, WaitSpec};

/// Convergence engine bound to one control-plane client.
pub struct Engine<C: ?Sized> {
    api: Arc<C>,
    config: EngineConfig,
    batch_limit: NonZeroUsize,
    classifier: Arc<dyn TransientClassifier>,
    cancel: CancellationToken,
}

impl<C: ?Sized> Clone for Engine<C> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            config: self.config.clone(),
            batch_limit: self.batch_limit,
            classifier: Arc::clone(&self.classifier),
            cancel: self.cancel.clone(),
        }
    }
}

impl<C: ControlPlane + ?Sized> Engine<C> {
    /// Validate `config` and build an engine around `api`.
    ///
    /// Transient errors are classified by the configured signatures.
    pub fn new(api: Arc<C>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let batch_limit = config.permissions.batch_limit()?;
        let classifier = Arc::new(SignatureClassifier::new(
            config.retry.transient_signatures.clone(),
        ));
        Ok(Self {
            api,
            config,
            batch_limit,
            classifier,
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the transient-error classifier.
    pub fn with_classifier(mut self, classifier: impl TransientClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Engine sharing everything but with a child token: cancelling the
    /// child leaves this engine running, cancelling this engine stops both.
    pub fn child(&self) -> Self {
        let mut child = self.clone();
        child.cancel = self.cancel.child_token();
        child
    }

    pub fn api(&self) -> &C {
        &self.api
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    // =========================================================================
    // Waiting
    // =========================================================================

    /// Wait spec using the configured poll interval, timeout and not-found budget.
    pub fn wait_spec<P, T>(&self, pending: P, target: T) -> Result<WaitSpec>
    where
        P: IntoIterator,
        P::Item: Into<Status>,
        T: IntoIterator,
        T::Item: Into<Status>,
    {
        Ok(self.config.wait.spec(pending, target)?)
    }

    /// Wait on the object's own status field.
    pub async fn wait_for(&self, id: &ResourceId, spec: &WaitSpec) -> Result<Converged> {
        let prober = DescribeProber::new(&*self.api);
        waiter::wait_for(&prober, id, spec, &self.cancel).await
    }

    /// Wait using a custom prober, e.g. a [`FieldProber`](crate::status::FieldProber).
    pub async fn wait_with<P>(&self, prober: &P, id: &ResourceId, spec: &WaitSpec) -> Result<Converged>
    where
        P: StatusProber + ?Sized,
    {
        waiter::wait_for(prober, id, spec, &self.cancel).await
    }

    // =========================================================================
    // Retrying
    // =========================================================================

    /// Retry `op` through dependency-propagation errors with the configured policy.
    pub async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteError>>,
    {
        let policy = self.config.retry.policy();
        retry::with_retry(&policy, self.classifier.as_ref(), &self.cancel, op).await
    }

    /// Like [`Engine::with_retry`] with a caller-chosen deadline.
    pub async fn with_retry_for<T, F, Fut>(&self, timeout: Duration, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, RemoteError>>,
    {
        let policy = RetryPolicy {
            timeout,
            ..self.config.retry.policy()
        };
        retry::with_retry(&policy, self.classifier.as_ref(), &self.cancel, op).await
    }

    /// Read a just-created object, tolerating "not found" until the retry deadline.
    pub async fn read_after_create<T, F, Fut>(&self, id: &ResourceId, read: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<Option<T>, RemoteError>>,
    {
        let policy = self.config.retry.policy();
        retry::retry_when_new_not_found(&policy, &self.cancel, id, read).await
    }

    // =========================================================================
    // Permissions and defaults
    // =========================================================================

    /// Share `resource` with exactly `desired`, given the last applied set.
    pub async fn reconcile_permissions(
        &self,
        resource: &str,
        previous: &GranteeSet,
        desired: &GranteeSet,
    ) -> Result<ReconcileReport> {
        PermissionReconciler::new(&*self.api, self.batch_limit)
            .reconcile(resource, PermissionKind::Share, previous, desired)
            .await
    }

    pub async fn resolve_one(&self, filter: &CandidateFilter) -> Result<Candidate> {
        singleton::resolve_one(&*self.api, filter, self.config.defaults.max_pages).await
    }

    pub async fn resolve_default(&self, filter: &CandidateFilter) -> Result<ResourceId> {
        singleton::resolve_default_id(&*self.api, filter, self.config.defaults.max_pages).await
    }

    /// Re-point the default for `category` at the platform-owned object.
    pub async fn restore_default(&self, category: &str) -> Result<RestoreReport> {
        singleton::restore_default(&*self.api, category, &self.config.defaults).await
    }

    pub async fn register_default(&self, category: &str, id: &ResourceId) -> Result<()> {
        Ok(self.api.register_default(category, id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConvergeError;
    use crate::memory::MemoryControlPlane;
    use crate::remote::RemoteObject;

    fn engine() -> Engine<MemoryControlPlane> {
        Engine::new(Arc::new(MemoryControlPlane::new()), EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.permissions.batch_limit = 0;
        let err = Engine::new(Arc::new(MemoryControlPlane::new()), config).err();
        assert!(matches!(err, Some(ConvergeError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_uses_configured_timing() {
        let engine = engine();
        let id = engine
            .api()
            .insert_object(RemoteObject::new("doc-1", "document", "Creating"))
            .await;
        engine
            .api()
            .script_statuses(&id, ["Creating", "Creating", "Active"])
            .await;

        let spec = engine.wait_spec(["Creating"], ["Active"]).unwrap();
        let converged = engine.wait_for(&id, &spec).await.unwrap();
        assert_eq!(converged.status, Status::from("Active"));
        assert_eq!(converged.polls, 3);
        assert_eq!(converged.elapsed, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_classifier() {
        let engine = engine().with_classifier(|e: &RemoteError| matches!(e, RemoteError::Throttled { .. }));
        let mut calls = 0;
        let value = engine
            .with_retry(|| {
                calls += 1;
                let n = calls;
                async move {
                    if n == 1 {
                        Err(RemoteError::Throttled {
                            message: "rate exceeded".into(),
                        })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_child_cancellation_is_scoped() {
        let engine = engine();
        let child = engine.child();
        child.cancel();
        assert!(child.cancellation_token().is_cancelled());
        assert!(!engine.cancellation_token().is_cancelled());

        let grandchild = engine.child();
        engine.cancel();
        assert!(grandchild.cancellation_token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_engine_aborts_wait() {
        let engine = engine();
        let id = engine
            .api()
            .insert_object(RemoteObject::new("doc-1", "document", "Creating"))
            .await;
        let spec = engine.wait_spec(["Creating"], ["Active"]).unwrap();

        let trigger = engine.cancellation_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            trigger.cancel();
        });
        let err = engine.wait_for(&id, &spec).await.unwrap_err();
        assert!(matches!(err, ConvergeError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_maximal_timeouts_do_not_panic() {
        let mut config = EngineConfig::default();
        config.wait.timeout_secs = u64::MAX;
        config.retry.timeout_secs = u64::MAX;
        config.retry.max_backoff_ms = u64::MAX;
        let engine = Engine::new(Arc::new(MemoryControlPlane::new()), config).unwrap();

        let mut calls = 0;
        let value = engine
            .with_retry(|| {
                calls += 1;
                let n = calls;
                async move {
                    if n < 4 {
                        Err(RemoteError::api("ValidationException", "Nonexistent role"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 4);

        let id = engine
            .api()
            .insert_object(RemoteObject::new("doc-1", "document", "Creating"))
            .await;
        engine.api().script_statuses(&id, ["Creating", "Active"]).await;
        let spec = engine.wait_spec(["Creating"], ["Active"]).unwrap();
        let converged = engine.wait_for(&id, &spec).await.unwrap();
        assert_eq!(converged.polls, 2);
    }
}
