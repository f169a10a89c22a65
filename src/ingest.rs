//! Ingestion pipeline orchestration.
//!
//! Coordinates the full sync flow for one guide source:
//! list guides → resolve planner ids → fetch payloads → parse → enrich with
//! the item catalog → persist. Guides run on a bounded worker pool; a
//! failing guide is recorded and never stops the others.
//!
//! Each guide moves through
//! `pending → resolving-planner-ids → fetching-payloads → parsing →
//! enriching → persisting → persisted`, or drops to `failed` from any stage
//! with an attributable [`GuideFailure`](build_harvest_core::models::GuideFailure).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use build_harvest_core::models::{Guide, GuideStage, GuideSyncResult, RunSummary};
use build_harvest_core::store::{GuideStatus, UsageStore};
use build_harvest_core::HarvestError;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::{CatalogSource, ItemCatalog};
use crate::config::{Config, SyncConfig};
use crate::http::HttpFetcher;
use crate::lister::canonicalize_url;
use crate::progress::{NoProgress, ProgressMode, SyncProgressEvent, SyncProgressReporter};
use crate::sqlite_store::SqliteStore;
use crate::traits::{GuideSource, SourceRegistry};

/// Per-run knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub workers: usize,
    pub query: Option<String>,
}

impl From<&SyncConfig> for OrchestratorOptions {
    fn from(sync: &SyncConfig) -> Self {
        Self {
            workers: sync.workers.max(1),
            query: sync.default_query.clone(),
        }
    }
}

/// Re-entry guard shared by every orchestrator working on one dataset.
#[derive(Clone, Default)]
pub struct RunLock {
    held: Arc<AtomicBool>,
}

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }

    /// Take the lock, or fail fast with `SyncInProgress`.
    pub fn try_acquire(&self, label: &str) -> Result<RunGuard, HarvestError> {
        self.held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| HarvestError::SyncInProgress(label.to_string()))?;
        Ok(RunGuard {
            held: self.held.clone(),
        })
    }
}

/// Held for the duration of one sync pass. Releases the lock on drop.
pub struct RunGuard {
    held: Arc<AtomicBool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

/// Everything a per-guide task needs, cheap to clone into the task.
#[derive(Clone)]
struct GuideContext {
    label: Arc<str>,
    source: Arc<dyn GuideSource>,
    store: Arc<dyn UsageStore>,
    catalog: Arc<ItemCatalog>,
}

pub struct Orchestrator {
    source: Arc<dyn GuideSource>,
    store: Arc<dyn UsageStore>,
    catalog: Arc<ItemCatalog>,
    catalog_rejected: usize,
    options: OrchestratorOptions,
    lock: RunLock,
    cancel: CancellationToken,
    progress: Arc<dyn SyncProgressReporter>,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn GuideSource>,
        store: Arc<dyn UsageStore>,
        catalog: Arc<ItemCatalog>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            source,
            store,
            catalog,
            catalog_rejected: 0,
            options,
            lock: RunLock::new(),
            cancel: CancellationToken::new(),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_run_lock(mut self, lock: RunLock) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Number of catalog entries rejected at load time, echoed in summaries.
    pub fn with_catalog_rejected(mut self, rejected: usize) -> Self {
        self.catalog_rejected = rejected;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Hold the run lock for this orchestrator's dataset.
    pub fn lock_run(&self) -> Result<RunGuard, HarvestError> {
        self.lock.try_acquire(&self.source.source_label())
    }

    fn context(&self) -> GuideContext {
        GuideContext {
            label: Arc::from(self.source.source_label()),
            source: self.source.clone(),
            store: self.store.clone(),
            catalog: self.catalog.clone(),
        }
    }

    /// Run every listed guide through the pipeline.
    ///
    /// Listing failures abort the run. Per-guide failures are folded into
    /// [`RunSummary::failed`]. Cancellation stops new guides from starting;
    /// guides already in flight finish.
    pub async fn sync_all(&self, force_refresh: bool) -> Result<RunSummary, HarvestError> {
        let _guard = self.lock_run()?;
        if self.cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }

        let ctx = self.context();
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(run_id = %run_id, source = %ctx.label, force_refresh, "sync started");

        self.progress.report(SyncProgressEvent::Listing {
            source: ctx.label.to_string(),
        });
        let guides = self
            .source
            .list_guides(self.options.query.as_deref(), force_refresh)
            .await?;
        let total = guides.len();

        let (results, skipped) = self.run_guides(&ctx, guides).await;

        let mut summary = RunSummary {
            run_id,
            source: ctx.label.to_string(),
            started_at,
            finished_at: Utc::now(),
            guides_attempted: results.len(),
            guides_succeeded: 0,
            failed: Vec::new(),
            guides_skipped: skipped,
            cancelled: skipped > 0 || self.cancel.is_cancelled(),
            profiles_produced: 0,
            item_usages_produced: 0,
            unknown_items: 0,
            catalog_items: self.catalog.len(),
            catalog_rejected: self.catalog_rejected,
        };
        for result in results {
            match result.failure() {
                Some(failure) => summary.failed.push(failure.clone()),
                None => {
                    summary.guides_succeeded += 1;
                    summary.profiles_produced += result.profiles.len();
                    summary.item_usages_produced += result.usages.len();
                    summary.unknown_items += result.unknown_items;
                }
            }
        }

        info!(
            run_id = %summary.run_id,
            source = %summary.source,
            guides = total,
            succeeded = summary.guides_succeeded,
            failed = summary.guides_failed(),
            skipped = summary.guides_skipped,
            usages = summary.item_usages_produced,
            "sync finished"
        );
        Ok(summary)
    }

    /// Run a single guide, found by slug or URL in the (cached) guide list.
    pub async fn sync_one(&self, guide_ref: &str) -> Result<GuideSyncResult, HarvestError> {
        let _guard = self.lock_run()?;
        if self.cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }

        let guides = self
            .source
            .list_guides(self.options.query.as_deref(), false)
            .await?;
        let mut matches: Vec<Guide> = guides
            .into_iter()
            .filter(|g| matches_reference(g, guide_ref))
            .collect();
        let guide = match matches.len() {
            0 => return Err(HarvestError::GuideNotFound(guide_ref.to_string())),
            1 => matches.remove(0),
            _ => {
                return Err(HarvestError::AmbiguousGuide {
                    reference: guide_ref.to_string(),
                    urls: matches.into_iter().map(|g| g.url).collect(),
                })
            }
        };

        Ok(process_guide(&self.context(), guide).await)
    }

    async fn run_guides(
        &self,
        ctx: &GuideContext,
        guides: Vec<Guide>,
    ) -> (Vec<GuideSyncResult>, usize) {
        let total = guides.len();
        let semaphore = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let mut set = JoinSet::new();
        let mut skipped = 0;

        for (index, guide) in guides.into_iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit.filter(|_| !self.cancel.is_cancelled()) else {
                skipped = total - index;
                info!(source = %ctx.label, skipped, "sync cancelled; remaining guides skipped");
                break;
            };

            let ctx = ctx.clone();
            set.spawn(async move {
                let _permit = permit;
                (index, process_guide(&ctx, guide).await)
            });
        }

        let mut slots: Vec<Option<GuideSyncResult>> = (0..total).map(|_| None).collect();
        let mut done = 0u64;
        let mut failed = 0u64;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => {
                    done += 1;
                    if !result.is_persisted() {
                        failed += 1;
                    }
                    slots[index] = Some(result);
                    self.progress.report(SyncProgressEvent::Guides {
                        source: ctx.label.to_string(),
                        done,
                        total: total as u64,
                        failed,
                    });
                }
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => warn!(error = %e, "guide task did not complete"),
            }
        }

        (slots.into_iter().flatten().collect(), skipped)
    }
}

fn matches_reference(guide: &Guide, reference: &str) -> bool {
    let reference = reference.trim();
    if guide.id == reference || guide.url == reference {
        return true;
    }
    match url::Url::parse(reference) {
        Ok(base) => canonicalize_url(reference, &base).is_some_and(|u| u.as_str() == guide.url),
        Err(_) => false,
    }
}

/// Drive one guide through every stage. Never returns an error: failures
/// are recorded on the guide row and carried in the result.
async fn process_guide(ctx: &GuideContext, guide: Guide) -> GuideSyncResult {
    let mut result = GuideSyncResult::pending(guide.clone());
    debug!(guide = %guide.id, "guide pending");

    let ids = match ctx.source.resolve_planner_ids(&guide).await {
        Ok(ids) => ids,
        Err(e) => return fail(ctx, result, GuideStage::ResolvingPlannerIds, e).await,
    };
    result.planner_ids = ids.iter().cloned().collect();

    let mut payloads = Vec::with_capacity(ids.len());
    for id in &ids {
        match ctx.source.fetch_planner_payload(&guide, id).await {
            Ok(payload) => payloads.push(payload),
            Err(e) => {
                let e = e.with_guide(&guide.id);
                return fail(ctx, result, GuideStage::FetchingPayloads, e).await;
            }
        }
    }

    let parsed = match ctx.source.parse(&guide, &payloads) {
        Ok(parsed) => parsed,
        Err(e) => return fail(ctx, result, GuideStage::Parsing, e.with_guide(&guide.id)).await,
    };

    let (usages, unknown) = ctx.catalog.enrich(&parsed.usages);

    if let Err(e) = ctx.store.replace_builds(&guide, &parsed.profiles, &usages).await {
        let err = HarvestError::Storage(format!("{:#}", e));
        return fail(ctx, result, GuideStage::Persisting, err).await;
    }
    if let Err(e) = ctx
        .store
        .record_guide(&ctx.label, &guide, &GuideStatus::Persisted)
        .await
    {
        let err = HarvestError::Storage(format!("{:#}", e));
        return fail(ctx, result, GuideStage::Persisting, err).await;
    }

    info!(
        guide = %guide.id,
        planner_ids = ids.len(),
        profiles = parsed.profiles.len(),
        usages = usages.len(),
        unknown_items = unknown,
        "guide persisted"
    );
    result.profiles = parsed.profiles;
    result.usages = usages;
    result.unknown_items = unknown;
    result.warnings = parsed.warnings;
    result
}

async fn fail(
    ctx: &GuideContext,
    result: GuideSyncResult,
    stage: GuideStage,
    err: HarvestError,
) -> GuideSyncResult {
    warn!(
        guide = %result.guide.id,
        stage = %stage,
        kind = %err.kind(),
        planner_id = err.planner_id().unwrap_or(""),
        status = err.status().unwrap_or(0),
        retryable = err.is_retryable(),
        error = %err,
        "guide failed"
    );
    let status = GuideStatus::Failed {
        kind: err.kind(),
        message: err.to_string(),
    };
    if let Err(e) = ctx.store.record_guide(&ctx.label, &result.guide, &status).await {
        warn!(guide = %result.guide.id, error = %e, "failed to record guide failure");
    }
    result.failed(stage, &err)
}

// ═══════════════════════════════════════════════════════════════════════
// CLI entry point
// ═══════════════════════════════════════════════════════════════════════

/// Options for `harvest sync`.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub force_refresh: bool,
    pub guide: Option<String>,
    pub workers: Option<usize>,
    pub query: Option<String>,
    pub json: bool,
    pub progress: ProgressMode,
}

/// Load the item catalog named in the config, or an empty one.
pub async fn load_catalog(config: &Config) -> Result<(ItemCatalog, usize)> {
    let Some(raw) = config.catalog.source.as_deref() else {
        warn!("no [catalog] source configured; item usages will not be enriched");
        return Ok((ItemCatalog::empty(), 0));
    };
    let fetcher = HttpFetcher::new(&config.http)?;
    let source = CatalogSource::parse(raw);
    let load = ItemCatalog::load(
        &source,
        &fetcher,
        &config.cache.dir,
        std::time::Duration::from_secs(config.cache.catalog_ttl_secs),
    )
    .await
    .with_context(|| format!("Failed to load item catalog from {}", source.describe()))?;
    Ok((load.catalog, load.rejected.len()))
}

/// Sync one source (or `all`) into the SQLite store and print the results.
pub async fn run_sync(
    config: &Config,
    source_spec: &str,
    opts: &SyncOptions,
    cancel: CancellationToken,
) -> Result<Vec<RunSummary>> {
    let registry = SourceRegistry::from_config(config)?;
    let sources = registry.select(source_spec)?;

    let store: Arc<dyn UsageStore> = Arc::new(SqliteStore::open(config).await?);
    let (catalog, catalog_rejected) = load_catalog(config).await?;
    let catalog = Arc::new(catalog);

    let mut options = OrchestratorOptions::from(&config.sync);
    if let Some(workers) = opts.workers {
        options.workers = workers.max(1);
    }
    if opts.query.is_some() {
        options.query = opts.query.clone();
    }

    let mut summaries = Vec::new();
    let mut source_errors = 0;

    for source in sources {
        let label = source.source_label();
        let orchestrator =
            Orchestrator::new(source, store.clone(), catalog.clone(), options.clone())
                .with_cancellation(cancel.clone())
            .with_progress(opts.progress.reporter())
            .with_catalog_rejected(catalog_rejected);

        if let Some(guide_ref) = &opts.guide {
            match orchestrator.sync_one(guide_ref).await {
                Ok(result) => print_guide_result(&result, opts.json)?,
                Err(HarvestError::GuideNotFound(_)) if source_spec == "all" => {
                    debug!(source = %label, guide = %guide_ref, "guide not listed by source");
                }
                Err(e) => {
                    eprintln!("sync {} failed: {}", label, e);
                    source_errors += 1;
                }
            }
            continue;
        }

        match orchestrator.sync_all(opts.force_refresh).await {
            Ok(summary) => {
                print_summary(&summary, opts.json)?;
                summaries.push(summary);
            }
            Err(HarvestError::Cancelled) => {
                eprintln!("sync {} cancelled", label);
                break;
            }
            Err(e) => {
                eprintln!("sync {} failed: {}", label, e);
                source_errors += 1;
            }
        }
    }

    if source_errors > 0 {
        bail!("{} source(s) failed to sync", source_errors);
    }
    Ok(summaries)
}

fn print_guide_result(result: &GuideSyncResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }
    println!("sync guide {}", result.guide.id);
    println!("  url: {}", result.guide.url);
    println!("  planner ids: {}", result.planner_ids.len());
    match result.failure() {
        None => {
            println!("  profiles: {}", result.profiles.len());
            println!("  item usages: {}", result.usages.len());
            println!("  unknown items: {}", result.unknown_items);
            for warning in &result.warnings {
                println!("  warning: {}", warning);
            }
            println!("ok");
        }
        Some(failure) => {
            println!("  failed at {}: {}", failure.stage, failure.message);
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }
    println!("sync {}", summary.source);
    println!("  run: {}", summary.run_id);
    println!("  guides attempted: {}", summary.guides_attempted);
    println!("  guides succeeded: {}", summary.guides_succeeded);
    println!("  guides failed: {}", summary.guides_failed());
    if summary.cancelled {
        println!("  guides skipped (cancelled): {}", summary.guides_skipped);
    }
    println!("  profiles: {}", summary.profiles_produced);
    println!("  item usages: {}", summary.item_usages_produced);
    println!("  unknown items: {}", summary.unknown_items);
    println!(
        "  catalog: {} items ({} rejected)",
        summary.catalog_items, summary.catalog_rejected
    );
    for failure in &summary.failed {
        let mut detail = failure.kind.to_string();
        if let Some(status) = failure.status {
            detail.push_str(&format!(", HTTP {}", status));
        }
        if let Some(planner) = &failure.planner_id {
            detail.push_str(&format!(", planner {}", planner));
        }
        if failure.retryable {
            detail.push_str(", retryable");
        }
        println!("  failed: {} [{}] ({})", failure.guide_id, failure.stage, detail);
    }
    println!("ok");
    Ok(())
}
