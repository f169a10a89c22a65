//! In-memory [`UsageStore`] implementation for tests and dry runs.
//!
//! Uses `BTreeMap`/`BTreeSet` behind `std::sync::RwLock`. Usages are kept
//! in a set keyed by the full uniqueness quadruple, so the invariant holds
//! by construction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::models::{EnrichedUsage, Guide, ItemUsage, Profile};

use super::{BuildWriteStats, GuideRecord, GuideStatus, UsageStore};

struct StoredBuilds {
    profiles: Vec<Profile>,
    usages: BTreeSet<ItemUsage>,
}

/// In-memory store keyed by canonical guide URL.
pub struct InMemoryStore {
    guides: RwLock<BTreeMap<String, GuideRecord>>,
    builds: RwLock<BTreeMap<String, StoredBuilds>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            guides: RwLock::new(BTreeMap::new()),
            builds: RwLock::new(BTreeMap::new()),
        }
    }

    /// Profiles stored for a guide.
    pub fn profiles_for_guide(&self, guide_url: &str) -> Vec<Profile> {
        self.builds
            .read()
            .map(|b| {
                b.get(guide_url)
                    .map(|s| s.profiles.clone())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl UsageStore for InMemoryStore {
    async fn record_guide(&self, source: &str, guide: &Guide, status: &GuideStatus) -> Result<()> {
        let now = Utc::now();
        let mut guides = self.guides.write().map_err(poisoned)?;
        let previous_success = guides.get(&guide.url).and_then(|r| r.last_success_at);
        let last_success_at = match status {
            GuideStatus::Persisted => Some(now),
            GuideStatus::Failed { .. } => previous_success,
        };
        guides.insert(
            guide.url.clone(),
            GuideRecord {
                guide: guide.clone(),
                source: source.to_string(),
                status: status.clone(),
                last_attempt_at: now,
                last_success_at,
            },
        );
        Ok(())
    }

    async fn replace_builds(
        &self,
        guide: &Guide,
        profiles: &[Profile],
        usages: &[EnrichedUsage],
    ) -> Result<BuildWriteStats> {
        let mut stored = BTreeSet::new();
        let mut ignored = 0;
        for enriched in usages {
            if !stored.insert(enriched.usage.clone()) {
                ignored += 1;
            }
        }

        let mut seen = BTreeSet::new();
        let profiles: Vec<Profile> = profiles
            .iter()
            .filter(|p| seen.insert(p.key()))
            .cloned()
            .collect();

        let stats = BuildWriteStats {
            profiles_written: profiles.len(),
            usages_written: stored.len(),
            usages_ignored: ignored,
        };

        let mut builds = self.builds.write().map_err(poisoned)?;
        builds.insert(
            guide.url.clone(),
            StoredBuilds {
                profiles,
                usages: stored,
            },
        );
        Ok(stats)
    }

    async fn usages_for_guide(&self, guide_url: &str) -> Result<Vec<ItemUsage>> {
        let builds = self.builds.read().map_err(poisoned)?;
        Ok(builds
            .get(guide_url)
            .map(|b| b.usages.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn all_usages(&self) -> Result<Vec<ItemUsage>> {
        let builds = self.builds.read().map_err(poisoned)?;
        let mut all: Vec<ItemUsage> = builds
            .values()
            .flat_map(|b| b.usages.iter().cloned())
            .collect();
        all.sort();
        Ok(all)
    }

    async fn guides(&self) -> Result<Vec<GuideRecord>> {
        let guides = self.guides.read().map_err(poisoned)?;
        Ok(guides.values().cloned().collect())
    }
}
