//! Built-in web guide source.
//!
//! Combines a [`GuideLister`] over the site's search API and a
//! [`ProfileResolver`] over its guide pages and planner endpoint. All
//! planner requests of one source share a single [`RateLimiter`].

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use build_harvest_core::models::{Guide, PlannerId, PlannerPayload};
use build_harvest_core::HarvestError;

use crate::config::{CacheConfig, HttpConfig, WebSourceConfig};
use crate::http::{HttpFetcher, RateLimiter};
use crate::lister::{GuideLister, ListerSettings};
use crate::resolver::{ProfileResolver, ResolverSettings};
use crate::traits::GuideSource;

pub struct WebGuideSource {
    name: String,
    description: String,
    lister: GuideLister,
    resolver: ProfileResolver,
}

impl WebGuideSource {
    pub fn new(
        name: &str,
        source: &WebSourceConfig,
        cache: &CacheConfig,
        http: &HttpConfig,
    ) -> Result<Self, HarvestError> {
        let label = format!("web:{}", name);
        let fetcher = HttpFetcher::new(http)?;
        let planner_fetcher = match RateLimiter::per_second(http.requests_per_second)? {
            Some(limiter) => fetcher.clone().with_rate_limiter(Arc::new(limiter)),
            None => fetcher.clone(),
        };

        let lister_settings = ListerSettings::from_config(source, cache)?;
        let description = format!(
            "Guides from {}",
            lister_settings.search_url.host_str().unwrap_or("unknown host")
        );
        let lister = GuideLister::new(&label, lister_settings, fetcher.clone())?;
        let resolver = ProfileResolver::new(
            &label,
            ResolverSettings::from_config(source, cache)?,
            fetcher,
            planner_fetcher,
        )?;

        Ok(Self {
            name: name.to_string(),
            description,
            lister,
            resolver,
        })
    }
}

#[async_trait]
impl GuideSource for WebGuideSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn source_type(&self) -> &str {
        "web"
    }

    async fn list_guides(
        &self,
        query: Option<&str>,
        force_refresh: bool,
    ) -> Result<Vec<Guide>, HarvestError> {
        self.lister.list_guides(query, force_refresh).await
    }

    async fn resolve_planner_ids(
        &self,
        guide: &Guide,
    ) -> Result<BTreeSet<PlannerId>, HarvestError> {
        self.resolver.resolve_planner_ids(guide).await
    }

    async fn fetch_planner_payload(
        &self,
        guide: &Guide,
        id: &PlannerId,
    ) -> Result<PlannerPayload, HarvestError> {
        self.resolver.fetch_planner_payload(guide, id).await
    }
}
