//! In-memory control plane.
//!
//! Behaves like the remote API closely enough to drive the engine end to end:
//! objects walk through scripted status sequences, new roles take a number of
//! attempts to become visible, listings are paginated and grantee calls
//! enforce the batch limit. Used by the tests and the simulator.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::RemoteError;
use crate::permissions::{BatchPhase, GranteeSet};
use crate::remote::{
    Candidate, CandidateSource, DefaultRegistry, Describe, GranteeId, ListFilter, Page, PageToken,
    PermissionApi, PermissionKind, RemoteObject, ResourceId,
};
use crate::status::Status;

const DEFAULT_PAGE_SIZE: usize = 50;
const DEFAULT_BATCH_LIMIT: usize = 20;

/// A successful grantee mutation as seen by the API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionCall {
    pub phase: BatchPhase,
    pub resource: String,
    pub ids: Vec<GranteeId>,
}

struct Entry {
    object: RemoteObject,
    /// Statuses reported by the next describes, one per call.
    script: VecDeque<Status>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ResourceId, Entry>,
    candidates: Vec<Candidate>,
    grantees: HashMap<String, GranteeSet>,
    defaults: HashMap<String, ResourceId>,
    /// Role name -> create attempts that still fail before it is visible.
    roles: HashMap<String, u32>,
    permission_log: Vec<PermissionCall>,
    permission_attempts: usize,
    permission_faults: BTreeMap<usize, RemoteError>,
    describe_faults: VecDeque<RemoteError>,
    list_faults: VecDeque<RemoteError>,
    next_id: u64,
}

pub struct MemoryControlPlane {
    inner: Mutex<Inner>,
    page_size: usize,
    batch_limit: usize,
    describe_calls: AtomicUsize,
    list_calls: AtomicUsize,
    add_calls: AtomicUsize,
    remove_calls: AtomicUsize,
}

impl Default for MemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            page_size: DEFAULT_PAGE_SIZE,
            batch_limit: DEFAULT_BATCH_LIMIT,
            describe_calls: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            add_calls: AtomicUsize::new(0),
            remove_calls: AtomicUsize::new(0),
        }
    }

    /// Candidates returned per listing page. Zero is treated as one.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Largest grantee batch the API accepts.
    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    // =========================================================================
    // Objects
    // =========================================================================

    pub async fn insert_object(&self, object: RemoteObject) -> ResourceId {
        let id = object.id.clone();
        self.inner.lock().await.objects.insert(
            id.clone(),
            Entry {
                object,
                script: VecDeque::new(),
            },
        );
        id
    }

    /// Queue statuses for the next describes of `id`. Once the script runs
    /// out the last status sticks. [`Status::not_found`] removes the object.
    pub async fn script_statuses<I>(&self, id: &ResourceId, statuses: I)
    where
        I: IntoIterator,
        I::Item: Into<Status>,
    {
        if let Some(entry) = self.inner.lock().await.objects.get_mut(id) {
            entry.script.extend(statuses.into_iter().map(Into::into));
        }
    }

    pub async fn remove_object(&self, id: &ResourceId) -> Option<RemoteObject> {
        self.inner.lock().await.objects.remove(id).map(|e| e.object)
    }

    /// Register a role that fails the first `invisible_for` create attempts
    /// referencing it.
    pub async fn create_role(&self, name: impl Into<String>, invisible_for: u32) {
        self.inner.lock().await.roles.insert(name.into(), invisible_for);
    }

    /// Create an object that references `role`.
    ///
    /// Fails with the propagation signature while the role is not visible.
    /// The object starts in the first status of `lifecycle` and walks
    /// through the rest on subsequent describes.
    pub async fn create_with_role<I>(
        &self,
        kind: &str,
        role: &str,
        lifecycle: I,
    ) -> Result<ResourceId, RemoteError>
    where
        I: IntoIterator,
        I::Item: Into<Status>,
    {
        let mut inner = self.inner.lock().await;
        match inner.roles.get_mut(role) {
            Some(0) => {}
            Some(remaining) => {
                *remaining -= 1;
                debug!(role = %role, remaining = *remaining, "Role not visible yet");
                return Err(nonexistent_role(role));
            }
            None => return Err(nonexistent_role(role)),
        }

        inner.next_id += 1;
        let id = ResourceId::new(format!("{}-{:04}", kind, inner.next_id));
        let mut script: VecDeque<Status> = lifecycle.into_iter().map(Into::into).collect();
        let initial = script.pop_front().unwrap_or_else(|| Status::from("Active"));
        let object = RemoteObject::new(id.clone(), kind, initial).with_attribute("iam_role", role);
        inner.objects.insert(id.clone(), Entry { object, script });
        Ok(id)
    }

    /// Start deleting `id`: it reports `Deleting` for `polls` describes and
    /// is gone afterwards.
    pub async fn begin_delete(&self, id: &ResourceId, polls: usize) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .objects
            .get_mut(id)
            .ok_or_else(|| RemoteError::api("ResourceNotFoundException", format!("{} not found", id)))?;
        entry.object.status = Status::from("Deleting");
        entry.script = std::iter::repeat_n(Status::from("Deleting"), polls)
            .chain(std::iter::once(Status::not_found()))
            .collect();
        Ok(())
    }

    // =========================================================================
    // Candidates, grantees, defaults
    // =========================================================================

    pub async fn insert_candidate(&self, candidate: Candidate) {
        self.inner.lock().await.candidates.push(candidate);
    }

    pub async fn set_grantees(&self, resource: &str, grantees: GranteeSet) {
        self.inner
            .lock()
            .await
            .grantees
            .insert(resource.to_string(), grantees);
    }

    pub async fn grantees(&self, resource: &str) -> GranteeSet {
        self.inner
            .lock()
            .await
            .grantees
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    /// Successful grantee calls in the order they were made.
    pub async fn permission_calls(&self) -> Vec<PermissionCall> {
        self.inner.lock().await.permission_log.clone()
    }

    // =========================================================================
    // Fault injection and counters
    // =========================================================================

    pub async fn fail_next_describe(&self, err: RemoteError) {
        self.inner.lock().await.describe_faults.push_back(err);
    }

    pub async fn fail_next_list(&self, err: RemoteError) {
        self.inner.lock().await.list_faults.push_back(err);
    }

    /// Fail the `nth` grantee call (add or remove) from now, counting from 1.
    pub async fn fail_permission_call(&self, nth: usize, err: RemoteError) {
        let mut inner = self.inner.lock().await;
        let at = inner.permission_attempts + nth;
        inner.permission_faults.insert(at, err);
    }

    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn add_calls(&self) -> usize {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn remove_calls(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    async fn mutate_grantees(
        &self,
        phase: BatchPhase,
        resource: &str,
        kind: PermissionKind,
        ids: &[GranteeId],
    ) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock().await;
        inner.permission_attempts += 1;
        let attempt = inner.permission_attempts;
        if let Some(err) = inner.permission_faults.remove(&attempt) {
            return Err(err);
        }
        if ids.is_empty() {
            return Err(RemoteError::api(
                "InvalidParameterValue",
                "account ID list must not be empty",
            ));
        }
        if ids.len() > self.batch_limit {
            return Err(RemoteError::api(
                "InvalidParameterValue",
                format!(
                    "{} account IDs exceed the limit of {} per call",
                    ids.len(),
                    self.batch_limit
                ),
            ));
        }

        let set = inner.grantees.entry(resource.to_string()).or_default();
        for id in ids {
            match phase {
                BatchPhase::Add => {
                    set.insert(id.clone());
                }
                BatchPhase::Remove => {
                    set.remove(id);
                }
            }
        }
        debug!(resource = %resource, %kind, %phase, count = ids.len(), "Grantees updated");
        inner.permission_log.push(PermissionCall {
            phase,
            resource: resource.to_string(),
            ids: ids.to_vec(),
        });
        Ok(())
    }
}

fn nonexistent_role(role: &str) -> RemoteError {
    RemoteError::api("ValidationException", format!("Nonexistent role or missing permissions: {}", role))
}

// =============================================================================
// API implementations
// =============================================================================

#[async_trait]
impl Describe for MemoryControlPlane {
    async fn describe(&self, id: &ResourceId) -> Result<Option<RemoteObject>, RemoteError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().await;
        if let Some(err) = inner.describe_faults.pop_front() {
            return Err(err);
        }

        let Some(entry) = inner.objects.get_mut(id) else {
            return Ok(None);
        };
        if let Some(next) = entry.script.pop_front() {
            if next.is_not_found() {
                inner.objects.remove(id);
                return Ok(None);
            }
            entry.object.status = next;
        }
        Ok(Some(entry.object.clone()))
    }
}

#[async_trait]
impl CandidateSource for MemoryControlPlane {
    async fn list_page(
        &self,
        filter: &ListFilter,
        token: Option<&PageToken>,
    ) -> Result<Page<Candidate>, RemoteError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock().await;
        if let Some(err) = inner.list_faults.pop_front() {
            return Err(err);
        }

        let offset = match token {
            Some(PageToken(raw)) => raw
                .parse::<usize>()
                .map_err(|_| RemoteError::api("InvalidNextToken", format!("bad token {:?}", raw)))?,
            None => 0,
        };

        let matching: Vec<&Candidate> = inner
            .candidates
            .iter()
            .filter(|c| filter.owner.as_ref().is_none_or(|o| *o == c.owner))
            .filter(|c| filter.category.as_ref().is_none_or(|cat| *cat == c.category))
            .collect();
        let end = (offset + self.page_size).min(matching.len());
        let items = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|c| (*c).clone())
            .collect();
        let next = (end < matching.len()).then(|| PageToken(end.to_string()));
        Ok(Page { items, next })
    }
}

#[async_trait]
impl PermissionApi for MemoryControlPlane {
    async fn add_grantees(
        &self,
        resource: &str,
        kind: PermissionKind,
        ids: &[GranteeId],
    ) -> Result<(), RemoteError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        self.mutate_grantees(BatchPhase::Add, resource, kind, ids).await
    }

    async fn remove_grantees(
        &self,
        resource: &str,
        kind: PermissionKind,
        ids: &[GranteeId],
    ) -> Result<(), RemoteError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        self.mutate_grantees(BatchPhase::Remove, resource, kind, ids).await
    }
}

#[async_trait]
impl DefaultRegistry for MemoryControlPlane {
    async fn get_default(&self, category: &str) -> Result<Option<ResourceId>, RemoteError> {
        Ok(self.inner.lock().await.defaults.get(category).cloned())
    }

    async fn register_default(&self, category: &str, id: &ResourceId) -> Result<(), RemoteError> {
        self.inner
            .lock()
            .await
            .defaults
            .insert(category.to_string(), id.clone());
        Ok(())
    }
}
