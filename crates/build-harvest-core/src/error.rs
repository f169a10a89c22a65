//! Structured error taxonomy for the ingestion pipeline.
//!
//! Every error carries the identifiers needed to attribute it (guide id,
//! planner id, upstream status) so callers can decide retry policy without
//! parsing messages.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable classification of a [`HarvestError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UpstreamRateLimited,
    UpstreamUnavailable,
    MalformedContent,
    CatalogValidation,
    CacheWrite,
    GuideNotFound,
    SyncInProgress,
    Cancelled,
    Storage,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UpstreamRateLimited => "upstream_rate_limited",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::MalformedContent => "malformed_content",
            ErrorKind::CatalogValidation => "catalog_validation",
            ErrorKind::CacheWrite => "cache_write",
            ErrorKind::GuideNotFound => "guide_not_found",
            ErrorKind::SyncInProgress => "sync_in_progress",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Storage => "storage",
            ErrorKind::Config => "config",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        const ALL: [ErrorKind; 10] = [
            ErrorKind::UpstreamRateLimited,
            ErrorKind::UpstreamUnavailable,
            ErrorKind::MalformedContent,
            ErrorKind::CatalogValidation,
            ErrorKind::CacheWrite,
            ErrorKind::GuideNotFound,
            ErrorKind::SyncInProgress,
            ErrorKind::Cancelled,
            ErrorKind::Storage,
            ErrorKind::Config,
        ];
        ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HarvestError {
    /// The upstream kept answering HTTP 429 until the retry bound was hit.
    #[error(
        "rate limited by {url} after {attempts} attempts (HTTP {status}){}",
        attribution(.guide_id, .planner_id)
    )]
    UpstreamRateLimited {
        guide_id: Option<String>,
        planner_id: Option<String>,
        url: String,
        status: u16,
        attempts: u32,
    },

    /// Network or HTTP failure other than rate limiting.
    #[error(
        "upstream {url} unavailable after {attempts} attempts{}: {message}{}",
        status_suffix(.status),
        attribution(.guide_id, .planner_id)
    )]
    UpstreamUnavailable {
        guide_id: Option<String>,
        planner_id: Option<String>,
        url: String,
        status: Option<u16>,
        attempts: u32,
        /// False for client errors (4xx other than 429), which will not
        /// change on retry.
        retryable: bool,
        message: String,
    },

    /// Guide or payload content did not have the expected structure.
    #[error("malformed content{}: {detail}", attribution(.guide_id, .planner_id))]
    MalformedContent {
        guide_id: Option<String>,
        planner_id: Option<String>,
        detail: String,
    },

    /// A catalog entry was missing required fields.
    #[error(
        "catalog entry #{index} ({}) missing {}",
        .item_id.as_deref().unwrap_or("no id"),
        .missing.join(", ")
    )]
    CatalogValidation {
        index: usize,
        item_id: Option<String>,
        missing: Vec<String>,
    },

    #[error("failed to write cache entry {}: {message}", .path.display())]
    CacheWrite { path: PathBuf, message: String },

    #[error("guide not found: {0}")]
    GuideNotFound(String),

    /// A slug matched more than one listed guide; only a URL can pick one.
    #[error("guide '{reference}' is ambiguous, use a URL: {}", .urls.join(", "))]
    AmbiguousGuide { reference: String, urls: Vec<String> },

    #[error("sync already in progress for source '{0}'")]
    SyncInProgress(String),

    #[error("sync cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

fn attribution(guide_id: &Option<String>, planner_id: &Option<String>) -> String {
    match (guide_id, planner_id) {
        (Some(g), Some(p)) => format!(" [guide {}, planner {}]", g, p),
        (Some(g), None) => format!(" [guide {}]", g),
        (None, Some(p)) => format!(" [planner {}]", p),
        (None, None) => String::new(),
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default()
}

impl HarvestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarvestError::UpstreamRateLimited { .. } => ErrorKind::UpstreamRateLimited,
            HarvestError::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            HarvestError::MalformedContent { .. } => ErrorKind::MalformedContent,
            HarvestError::CatalogValidation { .. } => ErrorKind::CatalogValidation,
            HarvestError::CacheWrite { .. } => ErrorKind::CacheWrite,
            HarvestError::GuideNotFound(_) | HarvestError::AmbiguousGuide { .. } => {
                ErrorKind::GuideNotFound
            }
            HarvestError::SyncInProgress(_) => ErrorKind::SyncInProgress,
            HarvestError::Cancelled => ErrorKind::Cancelled,
            HarvestError::Storage(_) => ErrorKind::Storage,
            HarvestError::Config(_) => ErrorKind::Config,
        }
    }

    pub fn guide_id(&self) -> Option<&str> {
        match self {
            HarvestError::UpstreamRateLimited { guide_id, .. }
            | HarvestError::UpstreamUnavailable { guide_id, .. }
            | HarvestError::MalformedContent { guide_id, .. } => guide_id.as_deref(),
            HarvestError::GuideNotFound(id) => Some(id),
            _ => None,
        }
    }

    pub fn planner_id(&self) -> Option<&str> {
        match self {
            HarvestError::UpstreamRateLimited { planner_id, .. }
            | HarvestError::UpstreamUnavailable { planner_id, .. }
            | HarvestError::MalformedContent { planner_id, .. } => planner_id.as_deref(),
            _ => None,
        }
    }

    /// Last HTTP status observed from the upstream, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            HarvestError::UpstreamRateLimited { status, .. } => Some(*status),
            HarvestError::UpstreamUnavailable { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether running the same operation again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            HarvestError::UpstreamRateLimited { .. } => true,
            HarvestError::UpstreamUnavailable { retryable, .. } => *retryable,
            HarvestError::SyncInProgress(_) | HarvestError::Storage(_) => true,
            HarvestError::CacheWrite { .. } => true,
            HarvestError::MalformedContent { .. }
            | HarvestError::CatalogValidation { .. }
            | HarvestError::GuideNotFound(_)
            | HarvestError::AmbiguousGuide { .. }
            | HarvestError::Cancelled
            | HarvestError::Config(_) => false,
        }
    }

    /// Attach a guide id to an upstream or content error that lacks one.
    pub fn with_guide(mut self, id: &str) -> Self {
        match &mut self {
            HarvestError::UpstreamRateLimited { guide_id, .. }
            | HarvestError::UpstreamUnavailable { guide_id, .. }
            | HarvestError::MalformedContent { guide_id, .. } => {
                if guide_id.is_none() {
                    *guide_id = Some(id.to_string());
                }
            }
            _ => {}
        }
        self
    }
}
