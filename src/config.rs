//! Configuration parsing and validation.
//!
//! Build Harvest is configured via a TOML file (default `config/harvest.toml`).
//! The file is read once by the CLI; every pipeline component receives the
//! plain typed values it needs through its constructor.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/harvest.sqlite"
//!
//! [cache]
//! dir = "./data/cache"
//! guide_ttl_secs = 21600
//! planner_ttl_secs = 604800
//!
//! [http]
//! max_retries = 5
//! base_delay_ms = 1000
//! requests_per_second = 2.0
//!
//! [sync]
//! workers = 4
//!
//! [catalog]
//! source = "./data/items.json"
//!
//! [sources.web.maxroll]
//! search_url = "https://search.example.com/d3/guides"
//! planner_url = "https://planners.example.com/profiles/d3"
//! guide_url_globs = ["https://maxroll.gg/d3/guides/*"]
//! page_size = 20
//! max_pages = 50
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use globset::Glob;
use regex::Regex;
use serde::Deserialize;

use crate::http::MIN_REQUESTS_PER_SECOND;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_guide_ttl")]
    pub guide_ttl_secs: u64,
    #[serde(default = "default_planner_ttl")]
    pub planner_ttl_secs: u64,
    #[serde(default = "default_catalog_ttl")]
    pub catalog_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            guide_ttl_secs: default_guide_ttl(),
            planner_ttl_secs: default_planner_ttl(),
            catalog_ttl_secs: default_catalog_ttl(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./data/cache")
}
fn default_guide_ttl() -> u64 {
    6 * 60 * 60
}
fn default_planner_ttl() -> u64 {
    7 * 24 * 60 * 60
}
fn default_catalog_ttl() -> u64 {
    24 * 60 * 60
}

/// HTTP client, retry, and rate-limit settings shared by every source.
#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Total number of requests issued for one fetch before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound applied to server-provided `Retry-After` hints.
    #[serde(default = "default_retry_after_cap_secs")]
    pub retry_after_cap_secs: u64,
    /// Planner endpoint request budget. `0` disables spacing.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retry_after_cap_secs: default_retry_after_cap_secs(),
            requests_per_second: default_requests_per_second(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    format!("build-harvest/{}", env!("CARGO_PKG_VERSION"))
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_retry_after_cap_secs() -> u64 {
    300
}
fn default_requests_per_second() -> f64 {
    2.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Search query used when `--query` is not given.
    #[serde(default)]
    pub default_query: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            default_query: None,
        }
    }
}

fn default_workers() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CatalogConfig {
    /// Local JSON file or `http(s)` URL. Without it, usages are not enriched.
    #[serde(default)]
    pub source: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub web: BTreeMap<String, WebSourceConfig>,
}

/// One guide site reached over HTTP.
#[derive(Debug, Deserialize, Clone)]
pub struct WebSourceConfig {
    pub search_url: String,
    pub planner_url: String,
    #[serde(default)]
    pub guide_url_globs: Vec<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_hits_field")]
    pub hits_field: String,
    #[serde(default = "default_url_field")]
    pub url_field: String,
    #[serde(default = "default_title_field")]
    pub title_field: String,
    #[serde(default = "default_planner_id_attributes")]
    pub planner_id_attributes: Vec<String>,
    /// Regex with one capture group for planner links. `""` disables link scanning.
    #[serde(default = "default_planner_link_pattern")]
    pub planner_link_pattern: String,
}

impl WebSourceConfig {
    /// The planner link regex source, or `None` when link scanning is off.
    pub fn planner_link_pattern(&self) -> Option<&str> {
        Some(self.planner_link_pattern.trim()).filter(|p| !p.is_empty())
    }
}

fn default_page_size() -> usize {
    20
}
fn default_max_pages() -> usize {
    50
}
fn default_hits_field() -> String {
    "hits".to_string()
}
fn default_url_field() -> String {
    "url".to_string()
}
fn default_title_field() -> String {
    "title".to_string()
}
fn default_planner_id_attributes() -> Vec<String> {
    vec!["data-d3planner-id".to_string()]
}
fn default_planner_link_pattern() -> String {
    r"/d3/planner/([A-Za-z0-9_-]+)".to_string()
}

impl Config {
    /// A config with only a database path and defaults everywhere else.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/harvest.sqlite"),
            },
            cache: CacheConfig::default(),
            http: HttpConfig::default(),
            sync: SyncConfig::default(),
            catalog: CatalogConfig::default(),
            sources: SourcesConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

/// Check value ranges and patterns that serde cannot express.
pub fn validate(config: &Config) -> Result<()> {
    if config.http.max_retries == 0 {
        bail!("http.max_retries must be >= 1");
    }
    if config.http.base_delay_ms > config.http.max_delay_ms {
        bail!("http.base_delay_ms must be <= http.max_delay_ms");
    }
    let rps = config.http.requests_per_second;
    if !(rps == 0.0 || (rps >= MIN_REQUESTS_PER_SECOND && rps.is_finite())) {
        bail!(
            "http.requests_per_second must be 0 (no limit) or a finite rate of at least \
             one request per hour, got {}",
            rps
        );
    }
    if config.http.timeout_secs == 0 {
        bail!("http.timeout_secs must be > 0");
    }
    if config.sync.workers == 0 {
        bail!("sync.workers must be >= 1");
    }

    for (name, source) in &config.sources.web {
        if source.page_size == 0 {
            bail!("sources.web.{}.page_size must be >= 1", name);
        }
        if source.max_pages == 0 {
            bail!("sources.web.{}.max_pages must be >= 1", name);
        }
        for (field, value) in [
            ("search_url", &source.search_url),
            ("planner_url", &source.planner_url),
        ] {
            let parsed = url::Url::parse(value)
                .with_context(|| format!("sources.web.{}.{} is not a valid URL", name, field))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                bail!("sources.web.{}.{} must be an http(s) URL", name, field);
            }
        }
        for glob in &source.guide_url_globs {
            Glob::new(glob).with_context(|| {
                format!("sources.web.{}: invalid guide_url_glob '{}'", name, glob)
            })?;
        }
        if let Some(pattern) = source.planner_link_pattern() {
            let re = Regex::new(pattern).with_context(|| {
                format!("sources.web.{}: invalid planner_link_pattern", name)
            })?;
            if re.captures_len() < 2 {
                bail!(
                    "sources.web.{}.planner_link_pattern needs a capture group for the planner id",
                    name
                );
            }
        }
    }

    Ok(())
}
