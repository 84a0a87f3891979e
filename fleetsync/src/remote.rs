//! Remote control-plane API seams.
//!
//! These traits abstract the fleet-management API so that the engine works
//! with domain objects instead of request/response shapes. Request
//! construction and transport belong to the implementor.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::status::Status;

// =============================================================================
// Identifiers and objects
// =============================================================================

/// Opaque identifier (ID or ARN) of a remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A remote object as returned by a describe call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub id: ResourceId,
    pub kind: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl RemoteObject {
    pub fn new(id: impl Into<ResourceId>, kind: impl Into<String>, status: impl Into<Status>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            status: status.into(),
            status_message: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_status_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }
}

// =============================================================================
// Listing
// =============================================================================

/// Candidate for a singleton lookup (e.g. a patch baseline).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: ResourceId,
    pub name: String,
    pub owner: String,
    pub category: String,
}

impl Candidate {
    pub fn new(
        id: impl Into<ResourceId>,
        name: impl Into<String>,
        owner: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            owner: owner.into(),
            category: category.into(),
        }
    }
}

/// Filters the API applies server-side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub owner: Option<String>,
    pub category: Option<String>,
}

impl fmt::Display for ListFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(owner) = &self.owner {
            parts.push(format!("owner={}", owner));
        }
        if let Some(category) = &self.category {
            parts.push(format!("category={}", category));
        }
        if parts.is_empty() {
            f.write_str("all")
        } else {
            f.write_str(&parts.join(","))
        }
    }
}

/// Continuation token for paginated listings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageToken(pub String);

/// One page of a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<PageToken>,
}

// =============================================================================
// Permissions
// =============================================================================

/// Grantee identifier (e.g. an account ID, or `"All"` for public sharing).
pub type GranteeId = String;

/// Permission type understood by the grantee API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionKind {
    Share,
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionKind::Share => f.write_str("Share"),
        }
    }
}

// =============================================================================
// API traits
// =============================================================================

/// Reads a single object.
#[async_trait]
pub trait Describe: Send + Sync {
    /// Returns `None` when the object is confirmed absent.
    async fn describe(&self, id: &ResourceId) -> Result<Option<RemoteObject>, RemoteError>;
}

/// Paginated, filtered listing of singleton candidates.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn list_page(
        &self,
        filter: &ListFilter,
        token: Option<&PageToken>,
    ) -> Result<Page<Candidate>, RemoteError>;
}

/// Bulk grantee mutation, limited in batch size by the API.
#[async_trait]
pub trait PermissionApi: Send + Sync {
    async fn add_grantees(
        &self,
        resource: &str,
        kind: PermissionKind,
        ids: &[GranteeId],
    ) -> Result<(), RemoteError>;

    async fn remove_grantees(
        &self,
        resource: &str,
        kind: PermissionKind,
        ids: &[GranteeId],
    ) -> Result<(), RemoteError>;
}

/// Per-category "default object" pointer.
#[async_trait]
pub trait DefaultRegistry: Send + Sync {
    async fn get_default(&self, category: &str) -> Result<Option<ResourceId>, RemoteError>;

    async fn register_default(&self, category: &str, id: &ResourceId) -> Result<(), RemoteError>;
}

/// Everything the engine needs from the control plane.
pub trait ControlPlane: Describe + CandidateSource + PermissionApi + DefaultRegistry {}

impl<T> ControlPlane for T where T: Describe + CandidateSource + PermissionApi + DefaultRegistry {}
