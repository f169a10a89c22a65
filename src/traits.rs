//! Extension trait for guide sources.
//!
//! A [`GuideSource`] is one site that publishes build guides. It exposes the
//! four pipeline capabilities (list, resolve, fetch, parse) so the
//! [`Orchestrator`](crate::ingest::Orchestrator) can drive any site the same
//! way. The built-in implementation is
//! [`WebGuideSource`](crate::connector_web::WebGuideSource); custom sources
//! implement the trait in Rust and register with a [`SourceRegistry`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              SourceRegistry              │
//! │  ┌──────────────┐    ┌────────────────┐  │
//! │  │  Built-in    │    │    Custom      │  │
//! │  │  web:<name>  │    │    (Rust)      │  │
//! │  └──────────────┘    └────────────────┘  │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        Orchestrator::sync_all()
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use build_harvest::config::Config;
//! use build_harvest::traits::SourceRegistry;
//!
//! # fn example(config: &Config) -> Result<(), build_harvest_core::HarvestError> {
//! let sources = SourceRegistry::from_config(config)?;
//! for source in sources.sources() {
//!     println!("{}  {}", source.source_label(), source.description());
//! }
//! // sources.register(Arc::new(MySource::new()));
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use build_harvest_core::models::{Guide, ParsedBuilds, PlannerId, PlannerPayload};
use build_harvest_core::HarvestError;

use crate::config::Config;
use crate::parser;

/// A site that publishes build guides backed by planner documents.
///
/// # Lifecycle
///
/// 1. The source is registered via [`SourceRegistry::register`].
/// 2. [`list_guides`](GuideSource::list_guides) is called once per sync pass.
/// 3. For each guide, the orchestrator calls
///    [`resolve_planner_ids`](GuideSource::resolve_planner_ids), then
///    [`fetch_planner_payload`](GuideSource::fetch_planner_payload) per id,
///    then [`parse`](GuideSource::parse) on the collected payloads.
///
/// Methods are called concurrently from several workers.
#[async_trait]
pub trait GuideSource: Send + Sync {
    /// Instance name (e.g. `"maxroll"`).
    fn name(&self) -> &str;

    /// One-line description, shown by `harvest sources`.
    fn description(&self) -> &str;

    /// Source type identifier. Built-in sources return `"web"`.
    fn source_type(&self) -> &str {
        "custom"
    }

    /// Label stored with every guide: `"{type}:{name}"`.
    fn source_label(&self) -> String {
        format!("{}:{}", self.source_type(), self.name())
    }

    /// Complete, deduplicated guide list.
    async fn list_guides(
        &self,
        query: Option<&str>,
        force_refresh: bool,
    ) -> Result<Vec<Guide>, HarvestError>;

    async fn resolve_planner_ids(&self, guide: &Guide) -> Result<BTreeSet<PlannerId>, HarvestError>;

    async fn fetch_planner_payload(
        &self,
        guide: &Guide,
        id: &PlannerId,
    ) -> Result<PlannerPayload, HarvestError>;

    /// Normalize payloads into profiles and usages.
    ///
    /// Defaults to the standard planner document format.
    fn parse(
        &self,
        guide: &Guide,
        payloads: &[PlannerPayload],
    ) -> Result<ParsedBuilds, HarvestError> {
        parser::parse_payloads(guide, payloads)
    }
}

/// Registry for guide sources (built-in and custom).
pub struct SourceRegistry {
    sources: Vec<Arc<dyn GuideSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
        }
    }

    /// Build the registry from every `[sources.web.<name>]` block.
    pub fn from_config(config: &Config) -> Result<Self, HarvestError> {
        use crate::connector_web::WebGuideSource;

        let mut registry = Self::new();
        for (name, cfg) in &config.sources.web {
            registry.register(Arc::new(WebGuideSource::new(
                name,
                cfg,
                &config.cache,
                &config.http,
            )?));
        }
        Ok(registry)
    }

    pub fn register(&mut self, source: Arc<dyn GuideSource>) {
        self.sources.push(source);
    }

    pub fn sources(&self) -> &[Arc<dyn GuideSource>] {
        &self.sources
    }

    /// Find by label (`web:maxroll`) or bare name (`maxroll`).
    pub fn find(&self, name: &str) -> Option<Arc<dyn GuideSource>> {
        self.sources
            .iter()
            .find(|s| s.source_label() == name || s.name() == name)
            .cloned()
    }

    /// Sources selected by a CLI argument: `all`, a label, or a name.
    pub fn select(&self, spec: &str) -> Result<Vec<Arc<dyn GuideSource>>, HarvestError> {
        if spec == "all" {
            if self.sources.is_empty() {
                return Err(HarvestError::Config(
                    "no sources configured; add a [sources.web.<name>] block".to_string(),
                ));
            }
            return Ok(self.sources.clone());
        }
        self.find(spec).map(|s| vec![s]).ok_or_else(|| {
            let available: Vec<String> = self.sources.iter().map(|s| s.source_label()).collect();
            HarvestError::Config(format!(
                "unknown source '{}'. Available: {}",
                spec,
                if available.is_empty() {
                    "(none)".to_string()
                } else {
                    available.join(", ")
                }
            ))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
