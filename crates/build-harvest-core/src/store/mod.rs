//! Storage abstraction for Build Harvest.
//!
//! The [`UsageStore`] trait is the downstream collaborator the orchestrator
//! hands its results to. Implementations are responsible for applying the
//! item-usage uniqueness invariant at write time, so replaying a sync never
//! produces duplicate rows.
//!
//! Guide existence and build extraction are written through separate
//! operations: a failed guide updates its status row via
//! [`record_guide`](UsageStore::record_guide) without touching builds that
//! an earlier successful run persisted.
//!
//! Implementations must be `Send + Sync` to be shared across sync workers.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ErrorKind;
use crate::models::{EnrichedUsage, Guide, ItemUsage, Profile};

/// Last known sync status of a guide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GuideStatus {
    Persisted,
    Failed { kind: ErrorKind, message: String },
}

impl GuideStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuideStatus::Persisted => "persisted",
            GuideStatus::Failed { .. } => "failed",
        }
    }
}

/// A guide row as stored, with its last sync status.
#[derive(Debug, Clone, Serialize)]
pub struct GuideRecord {
    pub guide: Guide,
    pub source: String,
    pub status: GuideStatus,
    pub last_attempt_at: DateTime<Utc>,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Counts reported by [`UsageStore::replace_builds`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildWriteStats {
    pub profiles_written: usize,
    pub usages_written: usize,
    /// Usages dropped by the uniqueness constraint.
    pub usages_ignored: usize,
}

/// Abstract sink for guide, profile, and item-usage records.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`record_guide`](UsageStore::record_guide) | Upsert a guide row and its last sync status |
/// | [`replace_builds`](UsageStore::replace_builds) | Replace a guide's profiles and usages |
/// | [`usages_for_guide`](UsageStore::usages_for_guide) | Read back a guide's usages |
/// | [`all_usages`](UsageStore::all_usages) | Read back every usage |
/// | [`guides`](UsageStore::guides) | List stored guides |
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Insert or update the guide row and its last sync status.
    async fn record_guide(&self, source: &str, guide: &Guide, status: &GuideStatus) -> Result<()>;

    /// Replace every profile and usage previously stored for this guide.
    ///
    /// Duplicate usage quadruples in `usages` are stored once.
    async fn replace_builds(
        &self,
        guide: &Guide,
        profiles: &[Profile],
        usages: &[EnrichedUsage],
    ) -> Result<BuildWriteStats>;

    /// All usages stored for the guide with this canonical URL.
    async fn usages_for_guide(&self, guide_url: &str) -> Result<Vec<ItemUsage>>;

    /// Every stored usage, sorted.
    async fn all_usages(&self) -> Result<Vec<ItemUsage>>;

    /// Every stored guide, sorted by URL.
    async fn guides(&self) -> Result<Vec<GuideRecord>>;
}
