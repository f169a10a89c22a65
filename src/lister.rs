//! Guide lister: paginate the guide-search API into a normalized guide list.
//!
//! Pages through `GET {search_url}?q=&limit=&offset=` until a short page or
//! the `max_pages` bound, normalizes every hit into a [`Guide`] keyed by its
//! canonical URL, and caches the complete list in a [`GuideCache`].
//!
//! A listing is all-or-nothing: if any page fails, the refresh is aborted,
//! the cache is left as it was, and the caller gets a retryable error.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use build_harvest_core::models::Guide;
use build_harvest_core::HarvestError;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::GuideCache;
use crate::config::{CacheConfig, WebSourceConfig};
use crate::http::{snippet, HttpFetcher};

/// Typed lister parameters, resolved from a `[sources.web.<name>]` block.
#[derive(Debug, Clone)]
pub struct ListerSettings {
    pub search_url: Url,
    pub page_size: usize,
    pub max_pages: usize,
    pub hits_field: String,
    pub url_field: String,
    pub title_field: String,
    pub guide_url_globs: Vec<String>,
    pub cache_dir: PathBuf,
    pub ttl: Duration,
}

impl ListerSettings {
    pub fn from_config(
        source: &WebSourceConfig,
        cache: &CacheConfig,
    ) -> Result<Self, HarvestError> {
        let search_url = Url::parse(&source.search_url)
            .map_err(|e| HarvestError::Config(format!("invalid search_url: {}", e)))?;
        Ok(Self {
            search_url,
            page_size: source.page_size.max(1),
            max_pages: source.max_pages.max(1),
            hits_field: source.hits_field.clone(),
            url_field: source.url_field.clone(),
            title_field: source.title_field.clone(),
            guide_url_globs: source.guide_url_globs.clone(),
            cache_dir: cache.dir.clone(),
            ttl: Duration::from_secs(cache.guide_ttl_secs),
        })
    }
}

pub struct GuideLister {
    source: String,
    settings: ListerSettings,
    globs: Option<GlobSet>,
    fetcher: HttpFetcher,
}

impl GuideLister {
    pub fn new(
        source: &str,
        settings: ListerSettings,
        fetcher: HttpFetcher,
    ) -> Result<Self, HarvestError> {
        let globs = if settings.guide_url_globs.is_empty() {
            None
        } else {
            Some(build_globset(&settings.guide_url_globs)?)
        };
        Ok(Self {
            source: source.to_string(),
            settings,
            globs,
            fetcher,
        })
    }

    pub fn cache_for(&self, query: &str) -> GuideCache {
        GuideCache::new(&self.settings.cache_dir, &self.source, query, self.settings.ttl)
    }

    /// List guides, serving a valid cache entry unless `force_refresh` is set.
    pub async fn list_guides(
        &self,
        query: Option<&str>,
        force_refresh: bool,
    ) -> Result<Vec<Guide>, HarvestError> {
        let query = query.unwrap_or("").trim();
        let cache = self.cache_for(query);

        if !force_refresh {
            if let Some(guides) = cache.load() {
                debug!(source = %self.source, count = guides.len(), "guide list served from cache");
                return Ok(guides);
            }
        }

        let guides = self.fetch_all(query).await?;

        if let Err(e) = cache.save(&guides) {
            warn!(source = %self.source, error = %e, "failed to cache guide list");
        }
        Ok(guides)
    }

    async fn fetch_all(&self, query: &str) -> Result<Vec<Guide>, HarvestError> {
        let s = &self.settings;
        let base = origin_of(&s.search_url);
        let mut guides = Vec::new();
        let mut seen = HashSet::new();
        let mut pages = 0;
        let mut filtered = 0;

        loop {
            let offset = pages * s.page_size;
            let params = [
                ("q", query.to_string()),
                ("limit", s.page_size.to_string()),
                ("offset", offset.to_string()),
            ];
            let url = s.search_url.as_str();
            let body = self.fetcher.get(url, &params).await.into_body(url, None, None)?;
            pages += 1;

            let page: Value = serde_json::from_str(&body)
                .map_err(|e| unparseable_page(url, offset, &e.to_string()))?;
            let hits = extract_hits(&page, &s.hits_field)
                .ok_or_else(|| unparseable_page(url, offset, "no hit array in response"))?;

            for hit in hits {
                match guide_from_hit(hit, &base, &s.url_field, &s.title_field) {
                    Ok(guide) => {
                        if !self.accepts(&guide.url) {
                            filtered += 1;
                            continue;
                        }
                        if seen.insert(guide.url.clone()) {
                            guides.push(guide);
                        }
                    }
                    Err(reason) => {
                        let raw = serde_json::to_string(hit).unwrap_or_default();
                        warn!(
                            source = %self.source,
                            reason,
                            hit = %snippet(&raw, 120),
                            "skipping malformed search hit"
                        );
                    }
                }
            }

            if hits.len() < s.page_size {
                break;
            }
            if pages >= s.max_pages {
                warn!(
                    source = %self.source,
                    max_pages = s.max_pages,
                    "stopped listing at max_pages; results may be incomplete"
                );
                break;
            }
        }

        info!(
            source = %self.source,
            pages,
            guides = guides.len(),
            filtered,
            "guide listing fetched"
        );
        Ok(guides)
    }

    fn accepts(&self, url: &str) -> bool {
        match &self.globs {
            Some(set) => set.is_match(url),
            None => true,
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, HarvestError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            HarvestError::Config(format!("invalid guide_url_glob '{}': {}", pattern, e))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| HarvestError::Config(format!("invalid guide_url_globs: {}", e)))
}

fn unparseable_page(url: &str, offset: usize, detail: &str) -> HarvestError {
    HarvestError::UpstreamUnavailable {
        guide_id: None,
        planner_id: None,
        url: url.to_string(),
        status: None,
        attempts: 1,
        retryable: true,
        message: format!("unparseable search page at offset {}: {}", offset, detail),
    }
}

fn origin_of(url: &Url) -> Url {
    let mut origin = url.clone();
    origin.set_path("/");
    origin.set_query(None);
    origin.set_fragment(None);
    origin
}

/// The hit array of a search page: a named field of an object, or the page itself.
fn extract_hits<'a>(page: &'a Value, hits_field: &str) -> Option<&'a Vec<Value>> {
    match page {
        Value::Array(hits) => Some(hits),
        Value::Object(map) => map.get(hits_field).and_then(Value::as_array),
        _ => None,
    }
}

fn guide_from_hit(
    hit: &Value,
    base: &Url,
    url_field: &str,
    title_field: &str,
) -> Result<Guide, &'static str> {
    let raw_url = hit
        .get(url_field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or("missing url")?;
    let url = canonicalize_url(raw_url, base).ok_or("unusable url")?;
    let id = guide_id_from_url(&url).ok_or("url has no slug")?;
    let title = hit
        .get(title_field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| title_from_slug(&id));

    Ok(Guide {
        id,
        title,
        url: url.to_string(),
    })
}

/// Canonical form of a guide URL.
///
/// Lowercase scheme and host, no default port, no query or fragment, and no
/// trailing slash except on the root path. Relative URLs resolve against `base`.
pub fn canonicalize_url(raw: &str, base: &Url) -> Option<Url> {
    let mut url = base.join(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_query(None);
    url.set_fragment(None);
    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
        if url.path().is_empty() {
            url.set_path("/");
        }
    }
    Some(url)
}

/// Last non-empty path segment.
pub fn guide_id_from_url(url: &Url) -> Option<String> {
    url.path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()
        .map(str::to_string)
}

/// `whirlwind-rend_barbarian` → `Whirlwind Rend Barbarian`.
pub fn title_from_slug(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base() -> Url {
        Url::parse("https://search.example.com/").unwrap()
    }

    #[test]
    fn canonicalization_merges_variants() {
        let variants = [
            "https://Example.COM/d3/guides/ww-barb/",
            "https://example.com:443/d3/guides/ww-barb?utm_source=x",
            "HTTPS://example.com/d3/guides/ww-barb#gear",
        ];
        for v in variants {
            assert_eq!(
                canonicalize_url(v, &base()).unwrap().as_str(),
                "https://example.com/d3/guides/ww-barb",
                "variant {}",
                v
            );
        }
    }

    #[test]
    fn relative_urls_resolve_against_origin() {
        let base = Url::parse("https://maxroll.example.com/").unwrap();
        assert_eq!(
            canonicalize_url("/d3/guides/ww-barb", &base).unwrap().as_str(),
            "https://maxroll.example.com/d3/guides/ww-barb"
        );
        assert!(canonicalize_url("mailto:someone@example.com", &base).is_none());
    }

    #[test]
    fn root_path_keeps_its_slash() {
        assert_eq!(
            canonicalize_url("https://example.com/", &base()).unwrap().as_str(),
            "https://example.com/"
        );
    }

    #[test]
    fn id_and_title_from_slug() {
        let url = Url::parse("https://example.com/d3/guides/whirlwind-rend_barbarian").unwrap();
        let id = guide_id_from_url(&url).unwrap();
        assert_eq!(id, "whirlwind-rend_barbarian");
        assert_eq!(title_from_slug(&id), "Whirlwind Rend Barbarian");
        assert!(guide_id_from_url(&Url::parse("https://example.com/").unwrap()).is_none());
    }

    #[test]
    fn hits_from_object_or_array() {
        let obj = json!({ "hits": [{ "url": "/a" }], "total": 1 });
        let arr = json!([{ "url": "/a" }, { "url": "/b" }]);
        assert_eq!(extract_hits(&obj, "hits").unwrap().len(), 1);
        assert_eq!(extract_hits(&arr, "hits").unwrap().len(), 2);
        assert!(extract_hits(&json!({ "results": [] }), "hits").is_none());
        assert!(extract_hits(&json!("nope"), "hits").is_none());
    }

    #[test]
    fn hit_title_falls_back_to_slug() {
        let with_title = json!({ "url": "/d3/guides/ww-barb", "title": "  WW Barb  " });
        let blank = json!({ "url": "/d3/guides/ww-barb", "title": " " });
        assert_eq!(
            guide_from_hit(&with_title, &base(), "url", "title").unwrap().title,
            "WW Barb"
        );
        assert_eq!(
            guide_from_hit(&blank, &base(), "url", "title").unwrap().title,
            "Ww Barb"
        );
        assert!(guide_from_hit(&json!({ "title": "x" }), &base(), "url", "title").is_err());
        assert!(guide_from_hit(&json!({ "url": 42 }), &base(), "url", "title").is_err());
    }

    #[test]
    fn globset_filters_urls() {
        let set = build_globset(&["https://example.com/d3/guides/*".to_string()]).unwrap();
        assert!(set.is_match("https://example.com/d3/guides/ww-barb"));
        assert!(!set.is_match("https://example.com/d4/guides/ww-barb"));
        assert!(build_globset(&["[".to_string()]).is_err());
    }
}
