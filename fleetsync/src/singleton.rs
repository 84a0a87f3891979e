//! Singleton resolver.
//!
//! Resolves "exactly one object matching a filter" over a paginated listing,
//! and re-points a category's default at the platform-owned object when a
//! user override goes away.

use std::fmt;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::config::{DefaultsConfig, RestorePolicy};
use crate::error::{ConfigError, ConvergeError, Result};
use crate::remote::{Candidate, CandidateSource, DefaultRegistry, ListFilter, PageToken, ResourceId};

/// Filter for a singleton lookup.
///
/// `owner` and `category` are sent to the API. The name pattern has no
/// server-side counterpart and is applied to each listed candidate.
#[derive(Debug, Clone, Default)]
pub struct CandidateFilter {
    pub owner: Option<String>,
    pub category: Option<String>,
    pub name_pattern: Option<Regex>,
}

impl CandidateFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn name_pattern(mut self, pattern: Regex) -> Self {
        self.name_pattern = Some(pattern);
        self
    }

    /// Filter selecting the platform-owned default for `category`.
    pub fn platform_default(
        config: &DefaultsConfig,
        category: &str,
    ) -> std::result::Result<Self, ConfigError> {
        Ok(Self::new()
            .owner(config.platform_owner.clone())
            .category(category)
            .name_pattern(config.name_regex()?))
    }

    /// The server-side part of the filter.
    pub fn list_filter(&self) -> ListFilter {
        ListFilter {
            owner: self.owner.clone(),
            category: self.category.clone(),
        }
    }

    /// Client-side check. Server-side fields are checked again in case the
    /// API ignored them.
    pub fn matches(&self, candidate: &Candidate) -> bool {
        if self.owner.as_ref().is_some_and(|o| *o != candidate.owner) {
            return false;
        }
        if self.category.as_ref().is_some_and(|c| *c != candidate.category) {
            return false;
        }
        self.name_pattern
            .as_ref()
            .is_none_or(|re| re.is_match(&candidate.name))
    }
}

impl fmt::Display for CandidateFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.list_filter())?;
        if let Some(re) = &self.name_pattern {
            write!(f, ",name~{}", re.as_str())?;
        }
        Ok(())
    }
}

/// List every page matching `filter` and return the single match.
///
/// All pages are drained before classifying: a second match on a later page
/// turns a would-be success into `TooManyResults`.
pub async fn resolve_one<S>(source: &S, filter: &CandidateFilter, max_pages: usize) -> Result<Candidate>
where
    S: CandidateSource + ?Sized,
{
    let list_filter = filter.list_filter();
    let mut matches = Vec::new();
    let mut token: Option<PageToken> = None;
    let mut pages = 0;

    loop {
        if pages >= max_pages {
            warn!(filter = %filter, pages, "Listing did not terminate");
            return Err(ConvergeError::PageLimitExceeded { pages });
        }
        let page = source.list_page(&list_filter, token.as_ref()).await?;
        pages += 1;
        matches.extend(page.items.into_iter().filter(|c| filter.matches(c)));
        match page.next {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    debug!(filter = %filter, pages, matches = matches.len(), "Candidates listed");

    if matches.len() > 1 {
        return Err(ConvergeError::TooManyResults {
            filter: filter.to_string(),
            count: matches.len(),
        });
    }
    matches.pop().ok_or_else(|| ConvergeError::EmptyResult {
        filter: filter.to_string(),
    })
}

/// Like [`resolve_one`], returning only the ID.
pub async fn resolve_default_id<S>(
    source: &S,
    filter: &CandidateFilter,
    max_pages: usize,
) -> Result<ResourceId>
where
    S: CandidateSource + ?Sized,
{
    Ok(resolve_one(source, filter, max_pages).await?.id)
}

// =============================================================================
// Restore on delete
// =============================================================================

/// Why a default was not restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreWarningKind {
    NoPlatformDefault,
    AmbiguousPlatformDefault { count: usize },
}

/// Non-fatal outcome of a skipped restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreWarning {
    pub category: String,
    pub kind: RestoreWarningKind,
}

impl fmt::Display for RestoreWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RestoreWarningKind::NoPlatformDefault => write!(
                f,
                "no platform default found for {}; default left unchanged",
                self.category
            ),
            RestoreWarningKind::AmbiguousPlatformDefault { count } => write!(
                f,
                "{} platform defaults found for {}; default left unchanged",
                count, self.category
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// The platform default the pointer now references.
    pub restored: Option<ResourceId>,
    pub warnings: Vec<RestoreWarning>,
}

/// Point the default for `category` back at the platform-owned object.
///
/// With [`RestorePolicy::Warn`] a missing or ambiguous platform default is
/// reported in the returned warnings and the pointer is left alone. Any
/// other error, including transport failures, is returned.
pub async fn restore_default<A>(api: &A, category: &str, config: &DefaultsConfig) -> Result<RestoreReport>
where
    A: CandidateSource + DefaultRegistry + ?Sized,
{
    let filter = CandidateFilter::platform_default(config, category)?;

    let err = match resolve_default_id(api, &filter, config.max_pages).await {
        Ok(id) => {
            api.register_default(category, &id).await?;
            info!(category = %category, id = %id, "Restored platform default");
            return Ok(RestoreReport {
                restored: Some(id),
                warnings: Vec::new(),
            });
        }
        Err(err) => err,
    };

    let kind = match (&err, config.restore_policy) {
        (ConvergeError::EmptyResult { .. }, RestorePolicy::Warn) => RestoreWarningKind::NoPlatformDefault,
        (ConvergeError::TooManyResults { count, .. }, RestorePolicy::Warn) => {
            RestoreWarningKind::AmbiguousPlatformDefault { count: *count }
        }
        _ => return Err(err),
    };

    let warning = RestoreWarning {
        category: category.to_string(),
        kind,
    };
    warn!(category = %category, "{}", warning);
    Ok(RestoreReport {
        restored: None,
        warnings: vec![warning],
    })
}
