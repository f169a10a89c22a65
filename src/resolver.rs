//! Profile resolver: guide page → planner ids → raw planner payloads.
//!
//! A guide page is treated as opaque markup. Planner ids are collected from
//! elements carrying a planner-id attribute (parsed with `scraper`) and from
//! planner links matched by a configurable regex. Payloads are fetched from
//! the planner endpoint through the retrying [`HttpFetcher`], which shares a
//! [`RateLimiter`](crate::http::RateLimiter) across every worker of a source.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use build_harvest_core::models::{Guide, PlannerId, PlannerPayload};
use build_harvest_core::HarvestError;
use regex::Regex;
use scraper::{Html, Selector};
use serde::de::IgnoredAny;
use tracing::{debug, warn};
use url::Url;

use crate::cache::PlannerCache;
use crate::config::{CacheConfig, WebSourceConfig};
use crate::http::HttpFetcher;

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub planner_url: Url,
    pub planner_id_attributes: Vec<String>,
    pub planner_link_pattern: Option<Regex>,
    pub cache_dir: PathBuf,
    pub ttl: Duration,
}

impl ResolverSettings {
    pub fn from_config(
        source: &WebSourceConfig,
        cache: &CacheConfig,
    ) -> Result<Self, HarvestError> {
        let planner_url = Url::parse(&source.planner_url)
            .map_err(|e| HarvestError::Config(format!("invalid planner_url: {}", e)))?;
        if planner_url.cannot_be_a_base() {
            return Err(HarvestError::Config(format!(
                "planner_url cannot be used as a base: {}",
                planner_url
            )));
        }
        let planner_link_pattern = source
            .planner_link_pattern()
            .map(Regex::new)
            .transpose()
            .map_err(|e| HarvestError::Config(format!("invalid planner_link_pattern: {}", e)))?;
        Ok(Self {
            planner_url,
            planner_id_attributes: source.planner_id_attributes.clone(),
            planner_link_pattern,
            cache_dir: cache.dir.clone(),
            ttl: Duration::from_secs(cache.planner_ttl_secs),
        })
    }
}

/// Scans guide markup for planner ids.
pub struct PlannerIdExtractor {
    attributes: Vec<(String, Selector)>,
    link_pattern: Option<Regex>,
}

impl PlannerIdExtractor {
    pub fn new(attributes: &[String], link_pattern: Option<Regex>) -> Result<Self, HarvestError> {
        let attributes = attributes
            .iter()
            .map(|attr| {
                Selector::parse(&format!("[{}]", attr))
                    .map(|sel| (attr.clone(), sel))
                    .map_err(|e| {
                        HarvestError::Config(format!(
                            "invalid planner id attribute '{}': {:?}",
                            attr, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            attributes,
            link_pattern,
        })
    }

    /// Every distinct planner id referenced by the page, in sorted order.
    pub fn extract(&self, html: &str) -> BTreeSet<PlannerId> {
        let mut ids = BTreeSet::new();

        let document = Html::parse_document(html);
        for (attr, selector) in &self.attributes {
            for element in document.select(selector) {
                if let Some(id) = element.value().attr(attr).and_then(PlannerId::parse) {
                    ids.insert(id);
                }
            }
        }

        if let Some(re) = &self.link_pattern {
            for caps in re.captures_iter(html) {
                if let Some(id) = caps.get(1).and_then(|m| PlannerId::parse(m.as_str())) {
                    ids.insert(id);
                }
            }
        }

        ids
    }
}

pub struct ProfileResolver {
    planner_url: Url,
    extractor: PlannerIdExtractor,
    cache: PlannerCache,
    page_fetcher: HttpFetcher,
    planner_fetcher: HttpFetcher,
}

impl ProfileResolver {
    /// `planner_fetcher` should carry the source's shared rate limiter.
    pub fn new(
        source: &str,
        settings: ResolverSettings,
        page_fetcher: HttpFetcher,
        planner_fetcher: HttpFetcher,
    ) -> Result<Self, HarvestError> {
        let extractor = PlannerIdExtractor::new(
            &settings.planner_id_attributes,
            settings.planner_link_pattern,
        )?;
        Ok(Self {
            planner_url: settings.planner_url,
            extractor,
            cache: PlannerCache::new(&settings.cache_dir, source, settings.ttl),
            page_fetcher,
            planner_fetcher,
        })
    }

    /// Fetch the guide page and collect its planner ids. Zero ids is not an error.
    pub async fn resolve_planner_ids(
        &self,
        guide: &Guide,
    ) -> Result<BTreeSet<PlannerId>, HarvestError> {
        let html = self
            .page_fetcher
            .get(&guide.url, &[])
            .await
            .into_body(&guide.url, Some(&guide.id), None)?;
        let ids = self.extractor.extract(&html);
        debug!(guide = %guide.id, planner_ids = ids.len(), "resolved planner ids");
        Ok(ids)
    }

    pub fn planner_url_for(&self, id: &PlannerId) -> Result<Url, HarvestError> {
        let mut url = self.planner_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                HarvestError::Config(format!(
                    "planner_url cannot be used as a base: {}",
                    self.planner_url
                ))
            })?
            .pop_if_empty()
            .push(id.as_str());
        Ok(url)
    }

    /// Raw planner payload, from cache when fresh, otherwise from the network.
    ///
    /// Bodies that are not valid JSON fail with `MalformedContent` and are
    /// never cached.
    pub async fn fetch_planner_payload(
        &self,
        guide: &Guide,
        id: &PlannerId,
    ) -> Result<PlannerPayload, HarvestError> {
        let entry = self.cache.entry(id);
        if let Some(body) = entry.load() {
            debug!(guide = %guide.id, planner_id = %id, "planner payload served from cache");
            return Ok(PlannerPayload {
                planner_id: id.clone(),
                body,
                from_cache: true,
            });
        }

        let url = self.planner_url_for(id)?;
        let body = self
            .planner_fetcher
            .get(url.as_str(), &[])
            .await
            .into_body(url.as_str(), Some(&guide.id), Some(id.as_str()))?;

        if let Err(e) = serde_json::from_str::<IgnoredAny>(&body) {
            return Err(HarvestError::MalformedContent {
                guide_id: Some(guide.id.clone()),
                planner_id: Some(id.to_string()),
                detail: format!("planner payload is not valid JSON: {}", e),
            });
        }

        if let Err(e) = entry.save(&body) {
            warn!(
                guide = %guide.id,
                planner_id = %id,
                error = %e,
                "failed to cache planner payload"
            );
        }

        Ok(PlannerPayload {
            planner_id: id.clone(),
            body,
            from_cache: false,
        })
    }
}
