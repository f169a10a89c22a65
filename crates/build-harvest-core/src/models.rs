//! Core data models used throughout Build Harvest.
//!
//! These types represent the guides, planner payloads, profiles, and item
//! usages that flow through the ingestion pipeline, plus the per-guide and
//! per-run results the orchestrator reports back to its caller.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ErrorKind, HarvestError};

/// A published build guide, as returned by a guide lister.
///
/// Identity is the canonical [`url`](Guide::url); `id` is the URL slug and
/// is only used for display and `sync --guide` lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guide {
    pub id: String,
    pub title: String,
    pub url: String,
}

/// Opaque identifier of a single planner document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlannerId(String);

impl PlannerId {
    /// Normalize a raw identifier scraped from guide markup.
    ///
    /// Trims whitespace and drops any `#fragment` (embeds use it to select a
    /// profile inside the planner). Returns `None` for empty ids or ids that
    /// still contain whitespace or quotes.
    pub fn parse(raw: &str) -> Option<Self> {
        let id = raw.trim();
        let id = id.split('#').next().unwrap_or("").trim();
        if id.is_empty() || id.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
            return None;
        }
        Some(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlannerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw body of one planner document, before parsing.
#[derive(Debug, Clone)]
pub struct PlannerPayload {
    pub planner_id: PlannerId,
    pub body: String,
    /// Whether the body came from the planner cache rather than the network.
    pub from_cache: bool,
}

/// Identity of a profile: the guide it was found in, the planner document
/// it came from, and its name inside that document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProfileKey {
    pub guide_url: String,
    pub planner_id: PlannerId,
    pub name: String,
}

/// A named build variant inside a planner document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub guide_id: String,
    pub guide_url: String,
    pub planner_id: PlannerId,
    pub name: String,
    pub class: String,
}

impl Profile {
    pub fn key(&self) -> ProfileKey {
        ProfileKey {
            guide_url: self.guide_url.clone(),
            planner_id: self.planner_id.clone(),
            name: self.name.clone(),
        }
    }
}

/// Where an item is equipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UsageContext {
    #[serde(rename = "main")]
    Main,
    #[serde(rename = "follower")]
    Follower,
    #[serde(rename = "kanai-cube")]
    KanaiCube,
}

impl UsageContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            UsageContext::Main => "main",
            UsageContext::Follower => "follower",
            UsageContext::KanaiCube => "kanai-cube",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "main" => Some(UsageContext::Main),
            "follower" => Some(UsageContext::Follower),
            "kanai-cube" => Some(UsageContext::KanaiCube),
            _ => None,
        }
    }
}

impl fmt::Display for UsageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One item occupying one slot of one profile.
///
/// `(profile, item_id, slot, context)` is unique within a parse pass.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemUsage {
    pub profile: ProfileKey,
    pub item_id: String,
    pub slot: String,
    pub context: UsageContext,
}

impl ItemUsage {
    /// Stable hash of the uniqueness quadruple, used as a storage row id.
    pub fn dedup_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            self.profile.guide_url.as_str(),
            self.profile.planner_id.as_str(),
            self.profile.name.as_str(),
            self.item_id.as_str(),
            self.slot.as_str(),
            self.context.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}

/// Master catalog entry for an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemMeta {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub quality: String,
}

/// An item usage together with its catalog entry, if the item is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedUsage {
    #[serde(flatten)]
    pub usage: ItemUsage,
    pub meta: Option<ItemMeta>,
}

impl EnrichedUsage {
    pub fn is_known(&self) -> bool {
        self.meta.is_some()
    }
}

/// Output of parsing every payload resolved for one guide.
#[derive(Debug, Clone, Default)]
pub struct ParsedBuilds {
    pub profiles: Vec<Profile>,
    pub usages: Vec<ItemUsage>,
    /// Profiles that were skipped, with the reason.
    pub warnings: Vec<String>,
}

/// Stage of the per-guide state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuideStage {
    Pending,
    ResolvingPlannerIds,
    FetchingPayloads,
    Parsing,
    Enriching,
    Persisting,
}

impl GuideStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuideStage::Pending => "pending",
            GuideStage::ResolvingPlannerIds => "resolving-planner-ids",
            GuideStage::FetchingPayloads => "fetching-payloads",
            GuideStage::Parsing => "parsing",
            GuideStage::Enriching => "enriching",
            GuideStage::Persisting => "persisting",
        }
    }
}

impl fmt::Display for GuideStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attributable record of a guide that reached the failed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuideFailure {
    pub guide_id: String,
    pub guide_url: String,
    pub stage: GuideStage,
    pub planner_id: Option<String>,
    pub kind: ErrorKind,
    pub status: Option<u16>,
    pub retryable: bool,
    pub message: String,
}

impl GuideFailure {
    pub fn from_error(guide: &Guide, stage: GuideStage, err: &HarvestError) -> Self {
        Self {
            guide_id: guide.id.clone(),
            guide_url: guide.url.clone(),
            stage,
            planner_id: err.planner_id().map(str::to_string),
            kind: err.kind(),
            status: err.status(),
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

/// Terminal state of one guide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum GuideOutcome {
    Persisted,
    Failed(GuideFailure),
}

/// Result of running one guide through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct GuideSyncResult {
    pub guide: Guide,
    pub outcome: GuideOutcome,
    pub planner_ids: Vec<PlannerId>,
    pub profiles: Vec<Profile>,
    pub usages: Vec<EnrichedUsage>,
    pub unknown_items: usize,
    pub warnings: Vec<String>,
}

impl GuideSyncResult {
    pub fn pending(guide: Guide) -> Self {
        Self {
            guide,
            outcome: GuideOutcome::Persisted,
            planner_ids: Vec::new(),
            profiles: Vec::new(),
            usages: Vec::new(),
            unknown_items: 0,
            warnings: Vec::new(),
        }
    }

    pub fn failed(mut self, stage: GuideStage, err: &HarvestError) -> Self {
        self.outcome = GuideOutcome::Failed(GuideFailure::from_error(&self.guide, stage, err));
        self
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self.outcome, GuideOutcome::Persisted)
    }

    pub fn failure(&self) -> Option<&GuideFailure> {
        match &self.outcome {
            GuideOutcome::Failed(f) => Some(f),
            GuideOutcome::Persisted => None,
        }
    }
}

/// Per-run summary returned by `sync_all`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub guides_attempted: usize,
    pub guides_succeeded: usize,
    pub failed: Vec<GuideFailure>,
    /// Guides never started because the run was cancelled.
    pub guides_skipped: usize,
    pub cancelled: bool,
    pub profiles_produced: usize,
    pub item_usages_produced: usize,
    pub unknown_items: usize,
    pub catalog_items: usize,
    pub catalog_rejected: usize,
}

impl RunSummary {
    pub fn guides_failed(&self) -> usize {
        self.failed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(slot: &str, context: UsageContext) -> ItemUsage {
        ItemUsage {
            profile: ProfileKey {
                guide_url: "https://example.com/guides/ww".to_string(),
                planner_id: PlannerId::parse("abc").unwrap(),
                name: "Speed".to_string(),
            },
            item_id: "Unique_Sword_001".to_string(),
            slot: slot.to_string(),
            context,
        }
    }

    #[test]
    fn planner_id_normalization() {
        assert_eq!(PlannerId::parse("  abc123 ").unwrap().as_str(), "abc123");
        assert_eq!(PlannerId::parse("abc123#2").unwrap().as_str(), "abc123");
        assert!(PlannerId::parse("").is_none());
        assert!(PlannerId::parse("#3").is_none());
        assert!(PlannerId::parse("ab c").is_none());
    }

    #[test]
    fn usage_context_strings() {
        assert_eq!(UsageContext::KanaiCube.as_str(), "kanai-cube");
        assert_eq!(
            serde_json::to_string(&UsageContext::KanaiCube).unwrap(),
            "\"kanai-cube\""
        );
        assert_eq!(UsageContext::parse("follower"), Some(UsageContext::Follower));
        assert_eq!(UsageContext::parse("cube"), None);
    }

    #[test]
    fn dedup_hash_depends_on_every_field() {
        let a = usage("mainhand", UsageContext::Main);
        let b = usage("mainhand", UsageContext::KanaiCube);
        let c = usage("offhand", UsageContext::Main);
        assert_eq!(a.dedup_hash(), a.clone().dedup_hash());
        assert_ne!(a.dedup_hash(), b.dedup_hash());
        assert_ne!(a.dedup_hash(), c.dedup_hash());
    }

    #[test]
    fn failed_result_carries_attribution() {
        let guide = Guide {
            id: "ww".to_string(),
            title: "Ww".to_string(),
            url: "https://example.com/guides/ww".to_string(),
        };
        let err = HarvestError::UpstreamRateLimited {
            guide_id: Some("ww".to_string()),
            planner_id: Some("abc".to_string()),
            url: "https://planner.example.com/abc".to_string(),
            status: 429,
            attempts: 3,
        };
        let result =
            GuideSyncResult::pending(guide).failed(GuideStage::FetchingPayloads, &err);
        let failure = result.failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::UpstreamRateLimited);
        assert_eq!(failure.planner_id.as_deref(), Some("abc"));
        assert_eq!(failure.status, Some(429));
        assert!(failure.retryable);
        assert!(!result.is_persisted());
    }
}
