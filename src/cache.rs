//! File-backed TTL caches.
//!
//! Each cache entry is one JSON file holding `{ fetched_at, payload }`.
//! An entry is valid while `now - fetched_at <= ttl`; expired, missing, or
//! unreadable entries all read as absent. Writes go to a temporary file in
//! the same directory which is then renamed over the target, so a reader
//! never observes a partially written entry.
//!
//! Layout under `cache.dir`:
//!
//! ```text
//! guides/<source>-<query hash>.json     guide listings (owned by the lister)
//! planners/<source>/<id hash>.json      raw planner payloads
//! catalog/<source hash>.json            downloaded item catalogs
//! ```

use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use build_harvest_core::models::{Guide, PlannerId};
use build_harvest_core::HarvestError;
use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::CacheConfig;

/// A cached payload with the time it was fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub fetched_at: DateTime<Utc>,
    pub payload: T,
}

#[derive(Serialize)]
struct CacheEntryRef<'a, T> {
    fetched_at: DateTime<Utc>,
    payload: &'a T,
}

/// Whether an entry fetched at `fetched_at` is past its TTL at `now`.
pub fn is_expired(fetched_at: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    match chrono::Duration::from_std(ttl) {
        Ok(ttl) => now.signed_duration_since(fetched_at) > ttl,
        Err(_) => false,
    }
}

/// A single-file cache slot for a serializable payload.
pub struct FileCache<T> {
    path: PathBuf,
    ttl: Duration,
    _payload: PhantomData<fn() -> T>,
}

impl<T> FileCache<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: PathBuf, ttl: Duration) -> Self {
        Self {
            path,
            ttl,
            _payload: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// The payload, if a valid entry exists.
    pub fn load(&self) -> Option<T> {
        self.load_at(Utc::now())
    }

    pub fn load_at(&self, now: DateTime<Utc>) -> Option<T> {
        let entry = self.load_entry()?;
        if is_expired(entry.fetched_at, now, self.ttl) {
            debug!(
                path = %self.path.display(),
                fetched_at = %entry.fetched_at,
                "cache entry expired"
            );
            return None;
        }
        Some(entry.payload)
    }

    /// The raw entry regardless of age.
    pub fn load_entry(&self) -> Option<CacheEntry<T>> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&text) {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "ignoring unreadable cache entry");
                None
            }
        }
    }

    pub fn save(&self, payload: &T) -> Result<(), HarvestError> {
        self.save_at(payload, Utc::now())
    }

    /// Atomically replace the entry.
    pub fn save_at(&self, payload: &T, fetched_at: DateTime<Utc>) -> Result<(), HarvestError> {
        let entry = CacheEntryRef {
            fetched_at,
            payload,
        };
        let json = serde_json::to_vec(&entry).map_err(|e| self.write_error(e))?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| self.write_error(e))?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| self.write_error(e))?;
        tmp.write_all(&json).map_err(|e| self.write_error(e))?;
        tmp.flush().map_err(|e| self.write_error(e))?;
        tmp.persist(&self.path).map_err(|e| self.write_error(e.error))?;
        Ok(())
    }

    fn write_error(&self, e: impl std::fmt::Display) -> HarvestError {
        HarvestError::CacheWrite {
            path: self.path.clone(),
            message: e.to_string(),
        }
    }
}

fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..16].to_string()
}

/// Make a source name safe to use as a file name component.
fn file_component(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Cached guide listing for one source and query.
pub struct GuideCache {
    inner: FileCache<Vec<Guide>>,
}

impl GuideCache {
    pub fn new(dir: &Path, source: &str, query: &str, ttl: Duration) -> Self {
        let file = format!("{}-{}.json", file_component(source), short_hash(query.trim()));
        Self {
            inner: FileCache::new(dir.join("guides").join(file), ttl),
        }
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    pub fn load(&self) -> Option<Vec<Guide>> {
        self.inner.load()
    }

    pub fn load_at(&self, now: DateTime<Utc>) -> Option<Vec<Guide>> {
        self.inner.load_at(now)
    }

    pub fn save(&self, guides: &[Guide]) -> Result<(), HarvestError> {
        self.inner.save(&guides.to_vec())
    }

    pub fn save_at(&self, guides: &[Guide], fetched_at: DateTime<Utc>) -> Result<(), HarvestError> {
        self.inner.save_at(&guides.to_vec(), fetched_at)
    }
}

/// Cached raw planner payloads for one source, one file per planner id.
pub struct PlannerCache {
    dir: PathBuf,
    ttl: Duration,
}

impl PlannerCache {
    pub fn new(dir: &Path, source: &str, ttl: Duration) -> Self {
        Self {
            dir: dir.join("planners").join(file_component(source)),
            ttl,
        }
    }

    pub fn entry(&self, id: &PlannerId) -> FileCache<String> {
        let file = format!("{}.json", short_hash(id.as_str()));
        FileCache::new(self.dir.join(file), self.ttl)
    }
}

/// Cache slot for a downloaded item catalog.
pub fn catalog_cache(dir: &Path, source: &str, ttl: Duration) -> FileCache<String> {
    let file = format!("{}.json", short_hash(source));
    FileCache::new(dir.join("catalog").join(file), ttl)
}

// ═══════════════════════════════════════════════════════════════════════
// Maintenance
// ═══════════════════════════════════════════════════════════════════════

/// Entry counts for one cache area.
#[derive(Debug, Clone, Serialize)]
pub struct CacheAreaStatus {
    pub area: String,
    pub entries: usize,
    pub expired: usize,
    pub unreadable: usize,
    pub bytes: u64,
    pub oldest: Option<DateTime<Utc>>,
}

/// Files removed by [`prune_expired`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    pub removed: usize,
    pub bytes: u64,
}

fn areas(cache: &CacheConfig) -> Vec<(&'static str, PathBuf, Duration)> {
    vec![
        (
            "guides",
            cache.dir.join("guides"),
            Duration::from_secs(cache.guide_ttl_secs),
        ),
        (
            "planners",
            cache.dir.join("planners"),
            Duration::from_secs(cache.planner_ttl_secs),
        ),
        (
            "catalog",
            cache.dir.join("catalog"),
            Duration::from_secs(cache.catalog_ttl_secs),
        ),
    ]
}

enum EntryAge {
    Fresh(DateTime<Utc>),
    Expired(DateTime<Utc>),
    Unreadable,
}

fn inspect(path: &Path, now: DateTime<Utc>, ttl: Duration) -> EntryAge {
    let Ok(text) = std::fs::read_to_string(path) else {
        return EntryAge::Unreadable;
    };
    match serde_json::from_str::<CacheEntry<IgnoredAny>>(&text) {
        Ok(entry) if is_expired(entry.fetched_at, now, ttl) => EntryAge::Expired(entry.fetched_at),
        Ok(entry) => EntryAge::Fresh(entry.fetched_at),
        Err(_) => EntryAge::Unreadable,
    }
}

fn entry_files(root: &Path) -> impl Iterator<Item = walkdir::DirEntry> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("json"))
}

/// Summarize every cache area.
pub fn cache_status(cache: &CacheConfig, now: DateTime<Utc>) -> Vec<CacheAreaStatus> {
    areas(cache)
        .into_iter()
        .map(|(area, root, ttl)| {
            let mut status = CacheAreaStatus {
                area: area.to_string(),
                entries: 0,
                expired: 0,
                unreadable: 0,
                bytes: 0,
                oldest: None,
            };
            for file in entry_files(&root) {
                status.entries += 1;
                status.bytes += file.metadata().map(|m| m.len()).unwrap_or(0);
                let fetched_at = match inspect(file.path(), now, ttl) {
                    EntryAge::Fresh(at) => Some(at),
                    EntryAge::Expired(at) => {
                        status.expired += 1;
                        Some(at)
                    }
                    EntryAge::Unreadable => {
                        status.unreadable += 1;
                        None
                    }
                };
                if let Some(at) = fetched_at {
                    status.oldest = Some(status.oldest.map_or(at, |o| o.min(at)));
                }
            }
            status
        })
        .collect()
}

/// Delete expired and unreadable planner and catalog entries.
///
/// Guide listings are left to the lister, which replaces them on refresh.
pub fn prune_expired(cache: &CacheConfig, now: DateTime<Utc>) -> Result<PruneReport> {
    let mut report = PruneReport::default();
    for (area, root, ttl) in areas(cache) {
        if area == "guides" {
            continue;
        }
        for file in entry_files(&root) {
            if matches!(
                inspect(file.path(), now, ttl),
                EntryAge::Expired(_) | EntryAge::Unreadable
            ) {
                let bytes = file.metadata().map(|m| m.len()).unwrap_or(0);
                std::fs::remove_file(file.path())?;
                debug!(path = %file.path().display(), "pruned cache entry");
                report.removed += 1;
                report.bytes += bytes;
            }
        }
    }
    Ok(report)
}

// ═══════════════════════════════════════════════════════════════════════
// CLI entry points
// ═══════════════════════════════════════════════════════════════════════

/// `harvest cache status`
pub fn run_cache_status(cache: &CacheConfig, json: bool) -> Result<()> {
    let statuses = cache_status(cache, Utc::now());
    if json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    println!("cache {}", cache.dir.display());
    println!(
        "  {:<10} {:>8} {:>8} {:>10} {:>10}   {}",
        "AREA", "ENTRIES", "EXPIRED", "UNREADABLE", "BYTES", "OLDEST"
    );
    for s in &statuses {
        let oldest = s
            .oldest
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<10} {:>8} {:>8} {:>10} {:>10}   {}",
            s.area, s.entries, s.expired, s.unreadable, s.bytes, oldest
        );
    }
    Ok(())
}

/// `harvest cache prune`
pub fn run_cache_prune(cache: &CacheConfig) -> Result<()> {
    let report = prune_expired(cache, Utc::now())?;
    println!(
        "pruned {} cache entr{} ({} bytes)",
        report.removed,
        if report.removed == 1 { "y" } else { "ies" },
        report.bytes
    );
    Ok(())
}
