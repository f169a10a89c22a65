//! `harvest sources` and `harvest guides`.
//!
//! Reports every configured guide source with its health, and lists the
//! guides a source currently publishes (served from the guide cache when
//! it is still fresh).

use anyhow::Result;
use chrono::Utc;

use crate::cache::GuideCache;
use crate::config::Config;
use crate::connector_web::WebGuideSource;
use crate::traits::SourceRegistry;

/// Health of one configured source, without touching the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceStatus {
    pub label: String,
    pub status: String,
    pub healthy: bool,
    /// Guides in a fresh cache entry for the default query.
    pub cached_guides: Option<usize>,
}

/// Inspect every `[sources.web.<name>]` block.
pub fn source_statuses(config: &Config) -> Vec<SourceStatus> {
    let query = config.sync.default_query.as_deref().unwrap_or("").trim();
    let ttl = std::time::Duration::from_secs(config.cache.guide_ttl_secs);
    let now = Utc::now();

    config
        .sources
        .web
        .iter()
        .map(|(name, cfg)| {
            let label = format!("web:{}", name);
            let (status, healthy) =
                match WebGuideSource::new(name, cfg, &config.cache, &config.http) {
                    Ok(_) => ("OK".to_string(), true),
                    Err(e) => (format!("INVALID ({})", e), false),
                };
            let cached_guides = GuideCache::new(&config.cache.dir, &label, query, ttl)
                .load_at(now)
                .map(|guides| guides.len());
            SourceStatus {
                label,
                status,
                healthy,
                cached_guides,
            }
        })
        .collect()
}

pub fn list_sources(config: &Config) -> Result<()> {
    let statuses = source_statuses(config);

    println!("{:<24} {:<12} {:<8} CACHED", "SOURCE", "STATUS", "HEALTHY");
    if statuses.is_empty() {
        println!("(no sources configured; add a [sources.web.<name>] block)");
        return Ok(());
    }
    for s in &statuses {
        let cached = match s.cached_guides {
            Some(n) => format!("{} guides", n),
            None => "-".to_string(),
        };
        println!("{:<24} {:<12} {:<8} {}", s.label, s.status, s.healthy, cached);
    }

    Ok(())
}

/// List a source's guides: one `id  url` line each, or JSON.
pub async fn list_guides(
    config: &Config,
    source_spec: &str,
    query: Option<&str>,
    force_refresh: bool,
    json: bool,
) -> Result<()> {
    let registry = SourceRegistry::from_config(config)?;
    let query = query.or(config.sync.default_query.as_deref());

    for source in registry.select(source_spec)? {
        let guides = source.list_guides(query, force_refresh).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&guides)?);
            continue;
        }
        println!("{} ({} guides)", source.source_label(), guides.len());
        for guide in &guides {
            println!("  {:<40} {}", guide.id, guide.url);
        }
    }

    Ok(())
}
