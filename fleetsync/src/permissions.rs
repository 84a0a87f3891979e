//! Permission set reconciler.
//!
//! Computes the grantees to add and remove between the last applied set and
//! the desired set, then applies each side in size-bounded batches. Batches
//! are issued strictly one after another, additions first. A failing batch
//! aborts the reconciliation; nothing is rolled back.

use std::collections::BTreeSet;
use std::fmt;
use std::num::NonZeroUsize;

use tracing::{debug, info};

use crate::error::{ConvergeError, Result};
use crate::remote::{GranteeId, PermissionApi, PermissionKind};

/// Set of grantees on a shared resource, ordered by ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GranteeSet(BTreeSet<GranteeId>);

impl GranteeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: impl Into<GranteeId>) -> bool {
        self.0.insert(id.into())
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.0.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GranteeId> {
        self.0.iter()
    }

    /// Apply a delta in place.
    pub fn apply(&mut self, delta: &PermissionDelta) {
        for id in &delta.to_remove {
            self.0.remove(id);
        }
        self.0.extend(delta.to_add.iter().cloned());
    }
}

impl<S: Into<GranteeId>> FromIterator<S> for GranteeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Grantees to add and remove. The two sides never share an ID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionDelta {
    pub to_add: Vec<GranteeId>,
    pub to_remove: Vec<GranteeId>,
}

impl PermissionDelta {
    /// `to_add = desired - previous`, `to_remove = previous - desired`.
    pub fn between(previous: &GranteeSet, desired: &GranteeSet) -> Self {
        Self {
            to_add: desired.0.difference(&previous.0).cloned().collect(),
            to_remove: previous.0.difference(&desired.0).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    pub fn len(&self) -> usize {
        self.to_add.len() + self.to_remove.len()
    }
}

/// Split `items` into consecutive batches of at most `limit` entries.
pub fn batches<T>(items: &[T], limit: NonZeroUsize) -> std::slice::Chunks<'_, T> {
    items.chunks(limit.get())
}

/// Which side of the delta a batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchPhase {
    Add,
    Remove,
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchPhase::Add => f.write_str("add"),
            BatchPhase::Remove => f.write_str("remove"),
        }
    }
}

/// What a successful reconciliation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: usize,
    pub removed: usize,
    pub batches: usize,
}

impl ReconcileReport {
    fn applied(&self) -> usize {
        self.added + self.removed
    }
}

/// Applies grantee deltas through a [`PermissionApi`].
pub struct PermissionReconciler<'a, A: ?Sized> {
    api: &'a A,
    batch_limit: NonZeroUsize,
}

impl<'a, A: PermissionApi + ?Sized> PermissionReconciler<'a, A> {
    pub fn new(api: &'a A, batch_limit: NonZeroUsize) -> Self {
        Self { api, batch_limit }
    }

    /// Bring `resource` from `previous` to `desired`.
    ///
    /// An empty `desired` set removes every previously granted ID.
    pub async fn reconcile(
        &self,
        resource: &str,
        kind: PermissionKind,
        previous: &GranteeSet,
        desired: &GranteeSet,
    ) -> Result<ReconcileReport> {
        let delta = PermissionDelta::between(previous, desired);
        let mut report = ReconcileReport::default();

        if delta.is_empty() {
            debug!(resource = %resource, "Permissions already converged");
            return Ok(report);
        }

        let total = delta.len();
        self.apply(resource, kind, BatchPhase::Add, &delta.to_add, total, &mut report)
            .await?;
        self.apply(resource, kind, BatchPhase::Remove, &delta.to_remove, total, &mut report)
            .await?;

        debug!(
            resource = %resource,
            added = report.added,
            removed = report.removed,
            batches = report.batches,
            "Permissions reconciled"
        );
        Ok(report)
    }

    async fn apply(
        &self,
        resource: &str,
        kind: PermissionKind,
        phase: BatchPhase,
        ids: &[GranteeId],
        total: usize,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        for batch in batches(ids, self.batch_limit) {
            let result = match phase {
                BatchPhase::Add => self.api.add_grantees(resource, kind, batch).await,
                BatchPhase::Remove => self.api.remove_grantees(resource, kind, batch).await,
            };

            if let Err(source) = result {
                let applied = report.applied();
                return Err(ConvergeError::BatchOperationFailed {
                    resource: resource.to_string(),
                    phase,
                    applied,
                    unapplied: total - applied,
                    source,
                });
            }

            info!(resource = %resource, %phase, count = batch.len(), "Applied grantee batch");
            match phase {
                BatchPhase::Add => report.added += batch.len(),
                BatchPhase::Remove => report.removed += batch.len(),
            }
            report.batches += 1;
        }
        Ok(())
    }
}
