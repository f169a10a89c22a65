//! Item catalog loader.
//!
//! The master item catalog maps item ids to display metadata. It is loaded
//! once per run from a local JSON file or an `http(s)` URL and used to
//! enrich item usages. Accepted formats:
//!
//! ```json
//! { "version": "2.7.4", "items": [ { "id": "Unique_Ring_101", "name": "Stone of Jordan",
//!                                   "type": "Ring", "quality": "legendary" } ] }
//! ```
//!
//! or a bare array of entries. Entries missing a required field are left
//! out and reported; they never abort the load.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use build_harvest_core::models::{EnrichedUsage, ItemMeta, ItemUsage};
use build_harvest_core::HarvestError;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::cache::catalog_cache;
use crate::config::Config;
use crate::http::HttpFetcher;

const REQUIRED_FIELDS: [&str; 4] = ["id", "name", "type", "quality"];

/// Where the catalog comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogSource {
    File(PathBuf),
    Url(String),
}

impl CatalogSource {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            CatalogSource::Url(raw.to_string())
        } else {
            CatalogSource::File(PathBuf::from(raw))
        }
    }

    pub fn describe(&self) -> String {
        match self {
            CatalogSource::File(path) => path.display().to_string(),
            CatalogSource::Url(url) => url.clone(),
        }
    }
}

/// Validated item metadata, keyed by item id.
#[derive(Debug, Clone, Default)]
pub struct ItemCatalog {
    items: HashMap<String, ItemMeta>,
    version: Option<String>,
}

/// A loaded catalog plus the entries that failed validation.
#[derive(Debug, Clone)]
pub struct CatalogLoad {
    pub catalog: ItemCatalog,
    /// One `CatalogValidation` error per rejected entry.
    pub rejected: Vec<HarvestError>,
    pub duplicates: usize,
}

impl ItemCatalog {
    /// A catalog with no entries; every usage enriches as unknown.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn lookup(&self, id: &str) -> Option<&ItemMeta> {
        self.items.get(id)
    }

    /// Attach catalog metadata to each usage. Unknown items are kept with
    /// `meta: None` and counted.
    pub fn enrich(&self, usages: &[ItemUsage]) -> (Vec<EnrichedUsage>, usize) {
        let mut unknown = 0;
        let enriched = usages
            .iter()
            .map(|usage| {
                let meta = self.lookup(&usage.item_id).cloned();
                if meta.is_none() {
                    unknown += 1;
                }
                EnrichedUsage {
                    usage: usage.clone(),
                    meta,
                }
            })
            .collect();
        (enriched, unknown)
    }

    /// Validate and index catalog JSON.
    ///
    /// Fails only if the document itself is unusable; bad entries are
    /// collected in [`CatalogLoad::rejected`].
    pub fn from_json(text: &str) -> Result<CatalogLoad, HarvestError> {
        let root: Value = serde_json::from_str(text).map_err(|e| HarvestError::MalformedContent {
            guide_id: None,
            planner_id: None,
            detail: format!("item catalog is not valid JSON: {}", e),
        })?;

        let (version, entries) = match &root {
            Value::Array(entries) => (None, entries),
            Value::Object(map) => {
                let entries = map.get("items").and_then(Value::as_array).ok_or_else(|| {
                    HarvestError::MalformedContent {
                        guide_id: None,
                        planner_id: None,
                        detail: "item catalog has no items array".to_string(),
                    }
                })?;
                let version = match map.get("version") {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Null) | None => None,
                    Some(other) => Some(other.to_string()),
                };
                (version, entries)
            }
            _ => {
                return Err(HarvestError::MalformedContent {
                    guide_id: None,
                    planner_id: None,
                    detail: "item catalog must be an object or an array".to_string(),
                })
            }
        };

        let mut items = HashMap::with_capacity(entries.len());
        let mut rejected = Vec::new();
        let mut duplicates = 0;

        for (index, entry) in entries.iter().enumerate() {
            match validate_entry(index, entry) {
                Ok(meta) => {
                    if items.contains_key(&meta.id) {
                        duplicates += 1;
                        debug!(
                            item_id = %meta.id,
                            index,
                            "duplicate catalog id; keeping first entry"
                        );
                        continue;
                    }
                    items.insert(meta.id.clone(), meta);
                }
                Err(e) => rejected.push(e),
            }
        }

        Ok(CatalogLoad {
            catalog: ItemCatalog { items, version },
            rejected,
            duplicates,
        })
    }

    /// Load from a file, or from a URL through the catalog cache.
    pub async fn load(
        source: &CatalogSource,
        fetcher: &HttpFetcher,
        cache_dir: &Path,
        ttl: Duration,
    ) -> Result<CatalogLoad, HarvestError> {
        let load = match source {
            CatalogSource::File(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    HarvestError::Config(format!(
                        "cannot read item catalog {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Self::from_json(&text)?
            }
            CatalogSource::Url(url) => {
                let cache = catalog_cache(cache_dir, url, ttl);
                match cache.load() {
                    Some(text) => {
                        debug!(url = %url, "item catalog served from cache");
                        Self::from_json(&text)?
                    }
                    None => {
                        let text = fetcher.get(url, &[]).await.into_body(url, None, None)?;
                        let load = Self::from_json(&text)?;
                        if let Err(e) = cache.save(&text) {
                            warn!(url = %url, error = %e, "failed to cache item catalog");
                        }
                        load
                    }
                }
            }
        };

        info!(
            source = %source.describe(),
            items = load.catalog.len(),
            rejected = load.rejected.len(),
            duplicates = load.duplicates,
            "item catalog loaded"
        );
        for err in load.rejected.iter().take(10) {
            warn!(error = %err, "rejected catalog entry");
        }
        Ok(load)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// CLI entry point
// ═══════════════════════════════════════════════════════════════════════

/// `harvest catalog check`: load the configured catalog and report every
/// rejected entry.
pub async fn run_catalog_check(config: &Config) -> anyhow::Result<()> {
    let Some(raw) = config.catalog.source.as_deref() else {
        anyhow::bail!("no [catalog] source configured");
    };
    let source = CatalogSource::parse(raw);
    let fetcher = HttpFetcher::new(&config.http)?;
    let load = ItemCatalog::load(
        &source,
        &fetcher,
        &config.cache.dir,
        Duration::from_secs(config.cache.catalog_ttl_secs),
    )
    .await?;

    println!("catalog {}", source.describe());
    if let Some(version) = load.catalog.version() {
        println!("  version: {}", version);
    }
    println!("  items: {}", load.catalog.len());
    println!("  duplicates: {}", load.duplicates);
    println!("  rejected: {}", load.rejected.len());
    for err in &load.rejected {
        println!("    {}", err);
    }
    println!("ok");
    Ok(())
}

fn field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn validate_entry(index: usize, entry: &Value) -> Result<ItemMeta, HarvestError> {
    let Some(obj) = entry.as_object() else {
        return Err(HarvestError::CatalogValidation {
            index,
            item_id: None,
            missing: REQUIRED_FIELDS.iter().map(|f| f.to_string()).collect(),
        });
    };

    let missing: Vec<String> = REQUIRED_FIELDS
        .iter()
        .filter(|f| field(obj, f).is_none())
        .map(|f| f.to_string())
        .collect();

    match (field(obj, "id"), field(obj, "name"), field(obj, "type"), field(obj, "quality")) {
        (Some(id), Some(name), Some(item_type), Some(quality)) => Ok(ItemMeta {
            id: id.to_string(),
            name: name.to_string(),
            item_type: item_type.to_string(),
            quality: quality.to_string(),
        }),
        (id, ..) => Err(HarvestError::CatalogValidation {
            index,
            item_id: id.map(str::to_string),
            missing,
        }),
    }
}
