//! Status observation.
//!
//! A [`StatusProber`] turns a single remote read into a [`Probe`]: the
//! observed status plus the raw object. Confirmed absence is not an error,
//! it is reported as the [`Status::not_found`] sentinel so that delete
//! waits can target it. Every other error is returned unchanged.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;
use crate::remote::{Describe, RemoteObject, ResourceId};

const NOT_FOUND: &str = "DoesNotExist";

/// Status string reported by the remote API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(String);

impl Status {
    pub fn new(status: impl Into<String>) -> Self {
        Self(status.into())
    }

    /// Sentinel for an object the API confirmed absent.
    pub fn not_found() -> Self {
        Self(NOT_FOUND.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        self.0 == NOT_FOUND
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Status {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Status {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Result of one probe.
#[derive(Debug, Clone, PartialEq)]
pub struct Probe {
    pub status: Status,
    pub object: Option<RemoteObject>,
}

impl Probe {
    pub fn found(object: RemoteObject) -> Self {
        Self {
            status: object.status.clone(),
            object: Some(object),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: Status::not_found(),
            object: None,
        }
    }

    /// Status message carried by the object, if any.
    pub fn reason(&self) -> Option<String> {
        self.object.as_ref().and_then(|o| o.status_message.clone())
    }
}

/// Fetches the current status of a remote object.
#[async_trait]
pub trait StatusProber: Send + Sync {
    async fn probe(&self, id: &ResourceId) -> Result<Probe, RemoteError>;
}

/// Probes the object's own status field.
pub struct DescribeProber<'a, D: ?Sized> {
    api: &'a D,
}

impl<'a, D: Describe + ?Sized> DescribeProber<'a, D> {
    pub fn new(api: &'a D) -> Self {
        Self { api }
    }
}

#[async_trait]
impl<'a, D: Describe + ?Sized> StatusProber for DescribeProber<'a, D> {
    async fn probe(&self, id: &ResourceId) -> Result<Probe, RemoteError> {
        Ok(match self.api.describe(id).await? {
            Some(object) => Probe::found(object),
            None => Probe::not_found(),
        })
    }
}

/// Probes a named attribute instead of the status field.
///
/// Used to wait for a value to propagate, e.g. an attribute flipping to
/// `"true"`. A missing attribute reads as the empty status.
pub struct FieldProber<'a, D: ?Sized> {
    api: &'a D,
    field: String,
}

impl<'a, D: Describe + ?Sized> FieldProber<'a, D> {
    pub fn new(api: &'a D, field: impl Into<String>) -> Self {
        Self {
            api,
            field: field.into(),
        }
    }
}

#[async_trait]
impl<'a, D: Describe + ?Sized> StatusProber for FieldProber<'a, D> {
    async fn probe(&self, id: &ResourceId) -> Result<Probe, RemoteError> {
        Ok(match self.api.describe(id).await? {
            Some(object) => {
                let value = field_value(&object.attributes, &self.field);
                Probe {
                    status: Status::new(value),
                    object: Some(object),
                }
            }
            None => Probe::not_found(),
        })
    }
}

fn field_value(attributes: &BTreeMap<String, String>, field: &str) -> String {
    attributes.get(field).cloned().unwrap_or_default()
}
