//! End-to-end pipeline tests against an in-process mock guide site.
//!
//! The mock serves a paginated search API, guide pages embedding planner
//! ids, and a planner endpoint whose per-id behavior (rate limited, broken,
//! not JSON) is set per test. Request counters let tests assert how often
//! the network was actually hit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::{Path, Query, State};
use axum::http::header::RETRY_AFTER;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use build_harvest::catalog::ItemCatalog;
use build_harvest::config::{Config, WebSourceConfig};
use build_harvest::connector_web::WebGuideSource;
use build_harvest::http::{FetchOutcome, HttpFetcher};
use build_harvest::ingest::{Orchestrator, OrchestratorOptions, RunLock};
use build_harvest::sqlite_store::SqliteStore;
use build_harvest::traits::GuideSource;
use build_harvest_core::models::{GuideStage, UsageContext};
use build_harvest_core::store::memory::InMemoryStore;
use build_harvest_core::store::{GuideStatus, UsageStore};
use build_harvest_core::{ErrorKind, HarvestError};

// ═══════════════════════════════════════════════════════════════════════
// Mock upstream
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug)]
enum Planner {
    RateLimited { times: usize },
    /// 429 with a `Retry-After: <secs>` header on the first request only.
    RetryAfter { secs: u64 },
    Status(u16),
    NotJson,
}

#[derive(Clone, Default)]
struct Upstream {
    /// Search hits in listing order, served verbatim.
    hits: Arc<Vec<Value>>,
    /// Search requests at or past this offset answer HTTP 500.
    search_fails_from: Arc<Mutex<Option<usize>>>,
    /// Planner ids embedded per guide slug. Default: `<slug>-1`.
    planners: Arc<HashMap<String, Vec<String>>>,
    behavior: Arc<HashMap<String, Planner>>,
    cancel_on_planner: Option<CancellationToken>,
    search_hits: Arc<AtomicUsize>,
    page_hits: Arc<AtomicUsize>,
    planner_hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl Upstream {
    fn with_guides(n: usize) -> Self {
        let urls: Vec<String> = (0..n).map(|i| format!("/guides/guide-{:03}", i)).collect();
        Self::with_hits(urls.iter().map(|url| json!({ "url": url })).collect())
    }

    fn with_urls(urls: &[&str]) -> Self {
        Self::with_hits(urls.iter().map(|url| json!({ "url": url })).collect())
    }

    fn with_hits(hits: Vec<Value>) -> Self {
        Self {
            hits: Arc::new(hits),
            ..Self::default()
        }
    }

    fn fail_search_from(&self, offset: Option<usize>) {
        *self.search_fails_from.lock().unwrap() = offset;
    }

    fn planner(mut self, id: &str, behavior: Planner) -> Self {
        Arc::make_mut(&mut self.behavior).insert(id.to_string(), behavior);
        self
    }

    fn searches(&self) -> usize {
        self.search_hits.load(Ordering::SeqCst)
    }

    fn pages(&self) -> usize {
        self.page_hits.load(Ordering::SeqCst)
    }

    fn planner_requests(&self, id: &str) -> usize {
        self.planner_hits.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    fn planner_requests_total(&self) -> usize {
        self.planner_hits.lock().unwrap().values().sum()
    }
}

async fn search(
    State(up): State<Upstream>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    up.search_hits.fetch_add(1, Ordering::SeqCst);
    let limit = params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(20);
    let offset = params.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    let fails_from = *up.search_fails_from.lock().unwrap();
    if fails_from.is_some_and(|from| offset >= from) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "index rebuilding").into_response();
    }
    let hits: Vec<Value> = up.hits.iter().skip(offset).take(limit).cloned().collect();
    Json(json!({ "hits": hits, "total": up.hits.len() })).into_response()
}

async fn guide_page(State(up): State<Upstream>, Path(slug): Path<String>) -> Html<String> {
    up.page_hits.fetch_add(1, Ordering::SeqCst);
    let ids = up
        .planners
        .get(&slug)
        .cloned()
        .unwrap_or_else(|| vec![format!("{}-1", slug)]);
    let embeds: String = ids
        .iter()
        .map(|id| format!(r#"<div class="planner" data-d3planner-id="{}"></div>"#, id))
        .collect();
    Html(format!("<html><body><h1>{}</h1>{}</body></html>", slug, embeds))
}

fn planner_doc() -> Value {
    json!({
        "profiles": [{
            "name": "Main",
            "class": "barbarian",
            "items": {
                "head": { "id": "Unique_Helm_001" },
                "neck": "Unique_Amulet_002"
            },
            "kanai": { "weapon": "Unique_Sword_104", "armor": null }
        }]
    })
}

async fn planner(State(up): State<Upstream>, Path(id): Path<String>) -> Response {
    let n = {
        let mut hits = up.planner_hits.lock().unwrap();
        let count = hits.entry(id.clone()).or_default();
        *count += 1;
        *count
    };
    if let Some(token) = &up.cancel_on_planner {
        token.cancel();
    }
    match up.behavior.get(&id) {
        Some(Planner::RateLimited { times }) if n <= *times => {
            (StatusCode::TOO_MANY_REQUESTS, "slow down").into_response()
        }
        Some(Planner::RetryAfter { secs }) if n == 1 => (
            StatusCode::TOO_MANY_REQUESTS,
            [(RETRY_AFTER, secs.to_string())],
            "slow down",
        )
            .into_response(),
        Some(Planner::Status(code)) => {
            (StatusCode::from_u16(*code).unwrap(), "broken").into_response()
        }
        Some(Planner::NotJson) => Html("<html>maintenance</html>").into_response(),
        _ => Json(planner_doc()).into_response(),
    }
}

async fn spawn_upstream(state: Upstream) -> String {
    let app = Router::new()
        .route("/search", get(search))
        .route("/guides/{slug}", get(guide_page))
        .route("/planner/{id}", get(planner))
        .with_state(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

// ═══════════════════════════════════════════════════════════════════════
// Harness
// ═══════════════════════════════════════════════════════════════════════

struct Harness {
    _tmp: TempDir,
    config: Config,
    source: Arc<dyn GuideSource>,
}

async fn harness(upstream: &Upstream, max_retries: u32) -> Harness {
    harness_with(upstream, max_retries, "page_size = 20\n").await
}

/// `source_toml` is appended to the `[sources.web.mock]` block.
async fn harness_with(upstream: &Upstream, max_retries: u32, source_toml: &str) -> Harness {
    let base = spawn_upstream(upstream.clone()).await;
    let tmp = TempDir::new().unwrap();

    let mut config = Config::minimal();
    config.db.path = tmp.path().join("harvest.sqlite");
    config.cache.dir = tmp.path().join("cache");
    config.http.max_retries = max_retries;
    config.http.base_delay_ms = 1;
    config.http.max_delay_ms = 5;
    config.http.timeout_secs = 5;
    config.http.requests_per_second = 0.0;

    let web: WebSourceConfig = toml::from_str(&format!(
        "search_url = \"{base}/search\"\nplanner_url = \"{base}/planner\"\n{source_toml}"
    ))
    .unwrap();
    config.sources.web.insert("mock".to_string(), web.clone());

    let source = WebGuideSource::new("mock", &web, &config.cache, &config.http).unwrap();
    Harness {
        _tmp: tmp,
        config,
        source: Arc::new(source),
    }
}

fn catalog() -> Arc<ItemCatalog> {
    let load = ItemCatalog::from_json(
        r#"{ "version": "test", "items": [
            { "id": "Unique_Helm_001", "name": "Andariel's Visage",
              "type": "Helm", "quality": "legendary" },
            { "id": "Unique_Amulet_002", "name": "Hellfire Amulet",
              "type": "Amulet", "quality": "legendary" }
        ] }"#,
    )
    .unwrap();
    Arc::new(load.catalog)
}

fn orchestrator(h: &Harness, store: Arc<dyn UsageStore>, workers: usize) -> Orchestrator {
    Orchestrator::new(
        h.source.clone(),
        store,
        catalog(),
        OrchestratorOptions {
            workers,
            query: None,
        },
    )
}

// ═══════════════════════════════════════════════════════════════════════
// Listing
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn listing_follows_pages_and_serves_cache() {
    let upstream = Upstream::with_guides(50);
    let h = harness(&upstream, 3).await;

    let guides = h.source.list_guides(None, false).await.unwrap();
    assert_eq!(guides.len(), 50);
    assert_eq!(upstream.searches(), 3);
    assert_eq!(guides[0].id, "guide-000");
    assert_eq!(guides[0].title, "Guide 000");

    let cached = h.source.list_guides(None, false).await.unwrap();
    assert_eq!(cached, guides);
    assert_eq!(upstream.searches(), 3);

    h.source.list_guides(None, true).await.unwrap();
    assert_eq!(upstream.searches(), 6);
}

#[tokio::test]
async fn listing_deduplicates_url_variants() {
    let upstream = Upstream::with_urls(&[
        "/guides/whirlwind",
        "/guides/whirlwind/",
        "/guides/whirlwind?ref=home",
        "/guides/hammerdin#intro",
        "/guides/hammerdin",
    ]);
    let h = harness(&upstream, 3).await;

    let guides = h.source.list_guides(None, false).await.unwrap();
    let ids: Vec<&str> = guides.iter().map(|g| g.id.as_str()).collect();
    assert_eq!(ids, vec!["whirlwind", "hammerdin"]);
}

#[tokio::test]
async fn listing_stops_at_max_pages() {
    let upstream = Upstream::with_guides(10);
    let h = harness_with(&upstream, 3, "page_size = 2\nmax_pages = 3\n").await;

    let guides = h.source.list_guides(None, false).await.unwrap();
    assert_eq!(guides.len(), 6);
    assert_eq!(upstream.searches(), 3);
    assert_eq!(guides.last().unwrap().id, "guide-005");
}

#[tokio::test]
async fn failed_later_page_keeps_previous_listing() {
    let upstream = Upstream::with_guides(6);
    let h = harness_with(&upstream, 2, "page_size = 2\n").await;

    let first = h.source.list_guides(None, false).await.unwrap();
    assert_eq!(first.len(), 6);
    let searches = upstream.searches();

    upstream.fail_search_from(Some(2));
    let err = h.source.list_guides(None, true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UpstreamUnavailable);
    assert_eq!(err.status(), Some(500));
    assert!(err.is_retryable());
    // Page one once, then page two until the retry budget is spent.
    assert_eq!(upstream.searches(), searches + 1 + 2);

    let cached = h.source.list_guides(None, false).await.unwrap();
    assert_eq!(cached, first);

    let store = Arc::new(InMemoryStore::new());
    match orchestrator(&h, store.clone(), 2).sync_all(true).await {
        Err(e) => assert_eq!(e.kind(), ErrorKind::UpstreamUnavailable),
        Ok(summary) => panic!("expected listing error, got {} guides", summary.guides_attempted),
    }
    assert!(store.guides().await.unwrap().is_empty());
    assert_eq!(upstream.pages(), 0);
}

#[tokio::test]
async fn malformed_hits_are_skipped() {
    let upstream = Upstream::with_hits(vec![
        json!({ "url": "/guides/whirlwind", "title": "Whirlwind" }),
        json!({ "title": "No link" }),
        json!({ "url": 42 }),
        json!({ "url": "   " }),
        json!({ "url": "mailto:builds@example.com" }),
        json!("not an object"),
        json!({ "url": "/guides/hammerdin" }),
    ]);
    let h = harness(&upstream, 3).await;
    let store = Arc::new(InMemoryStore::new());

    let summary = orchestrator(&h, store.clone(), 2).sync_all(false).await.unwrap();

    assert_eq!(summary.guides_attempted, 2);
    assert_eq!(summary.guides_succeeded, 2);
    let titles: Vec<String> = store
        .guides()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.guide.title)
        .collect();
    assert!(titles.contains(&"Whirlwind".to_string()));
    assert!(titles.contains(&"Hammerdin".to_string()));
}

// ═══════════════════════════════════════════════════════════════════════
// Retries
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn retry_after_header_replaces_backoff() {
    let upstream = Upstream::with_guides(1).planner("guide-000-1", Planner::RetryAfter { secs: 1 });
    let h = harness(&upstream, 3).await;
    let base = h.config.sources.web["mock"].planner_url.clone();

    let fetcher = HttpFetcher::new(&h.config.http).unwrap();
    let url = format!("{}/guide-000-1", base);
    let start = Instant::now();
    let outcome = fetcher.get(&url, &[]).await;

    // Backoff alone would wait 1ms before the second attempt.
    assert!(start.elapsed() >= Duration::from_millis(900), "waited {:?}", start.elapsed());
    match outcome {
        FetchOutcome::Success { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("expected success, got {:?}", other),
    }
    assert_eq!(upstream.planner_requests("guide-000-1"), 2);
}

// ═══════════════════════════════════════════════════════════════════════
// Sync
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn sync_persists_enriched_usages() {
    let upstream = Upstream::with_guides(3);
    let h = harness(&upstream, 3).await;
    let store = Arc::new(InMemoryStore::new());

    let summary = orchestrator(&h, store.clone(), 2).sync_all(false).await.unwrap();

    assert_eq!(summary.source, "web:mock");
    assert_eq!(summary.guides_attempted, 3);
    assert_eq!(summary.guides_succeeded, 3);
    assert_eq!(summary.guides_failed(), 0);
    assert_eq!(summary.profiles_produced, 3);
    assert_eq!(summary.item_usages_produced, 9);
    assert_eq!(summary.unknown_items, 3);
    assert_eq!(summary.catalog_items, 2);

    let usages = store.all_usages().await.unwrap();
    assert_eq!(usages.len(), 9);
    assert_eq!(
        usages.iter().filter(|u| u.context == UsageContext::KanaiCube).count(),
        3
    );
}

#[tokio::test]
async fn rate_limited_planner_recovers_within_budget() {
    let upstream =
        Upstream::with_guides(1).planner("guide-000-1", Planner::RateLimited { times: 2 });
    let h = harness(&upstream, 5).await;
    let store = Arc::new(InMemoryStore::new());

    let summary = orchestrator(&h, store, 1).sync_all(false).await.unwrap();

    assert_eq!(summary.guides_succeeded, 1);
    assert_eq!(upstream.planner_requests("guide-000-1"), 3);
}

#[tokio::test]
async fn exhausted_rate_limit_fails_only_that_guide() {
    let upstream = Upstream::with_guides(4)
        .planner("guide-002-1", Planner::RateLimited { times: usize::MAX });
    let h = harness(&upstream, 3).await;
    let store = Arc::new(InMemoryStore::new());

    let summary = orchestrator(&h, store.clone(), 2).sync_all(false).await.unwrap();

    assert_eq!(summary.guides_attempted, 4);
    assert_eq!(summary.guides_succeeded, 3);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(upstream.planner_requests("guide-002-1"), 3);

    let failure = &summary.failed[0];
    assert_eq!(failure.guide_id, "guide-002");
    assert_eq!(failure.stage, GuideStage::FetchingPayloads);
    assert_eq!(failure.kind, ErrorKind::UpstreamRateLimited);
    assert_eq!(failure.status, Some(429));
    assert_eq!(failure.planner_id.as_deref(), Some("guide-002-1"));
    assert!(failure.retryable);

    let records = store.guides().await.unwrap();
    let failed: Vec<_> = records
        .iter()
        .filter(|r| matches!(r.status, GuideStatus::Failed { .. }))
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].guide.id, "guide-002");
}

#[tokio::test]
async fn broken_and_non_json_planners_are_attributed() {
    let upstream = Upstream::with_guides(3)
        .planner("guide-000-1", Planner::Status(404))
        .planner("guide-001-1", Planner::NotJson);
    let h = harness(&upstream, 3).await;
    let store = Arc::new(InMemoryStore::new());

    let summary = orchestrator(&h, store, 3).sync_all(false).await.unwrap();
    assert_eq!(summary.guides_succeeded, 1);

    let by_guide: HashMap<&str, _> = summary
        .failed
        .iter()
        .map(|f| (f.guide_id.as_str(), f))
        .collect();

    let rejected = by_guide["guide-000"];
    assert_eq!(rejected.kind, ErrorKind::UpstreamUnavailable);
    assert_eq!(rejected.status, Some(404));
    assert!(!rejected.retryable);
    assert_eq!(upstream.planner_requests("guide-000-1"), 1);

    let malformed = by_guide["guide-001"];
    assert_eq!(malformed.kind, ErrorKind::MalformedContent);
    assert_eq!(malformed.stage, GuideStage::FetchingPayloads);

    // Not cached: a second run asks again.
    let store = Arc::new(InMemoryStore::new());
    orchestrator(&h, store, 1).sync_all(false).await.unwrap();
    assert_eq!(upstream.planner_requests("guide-001-1"), 2);
}

#[tokio::test]
async fn guide_without_planners_persists_empty() {
    let mut upstream = Upstream::with_guides(1);
    upstream.planners = Arc::new(HashMap::from([("guide-000".to_string(), Vec::new())]));
    let h = harness(&upstream, 3).await;
    let store = Arc::new(InMemoryStore::new());

    let summary = orchestrator(&h, store.clone(), 1).sync_all(false).await.unwrap();

    assert_eq!(summary.guides_succeeded, 1);
    assert_eq!(summary.item_usages_produced, 0);
    assert_eq!(upstream.planner_requests_total(), 0);
    assert_eq!(store.guides().await.unwrap()[0].status, GuideStatus::Persisted);
}

#[tokio::test]
async fn replay_is_idempotent_and_uses_planner_cache() {
    let upstream = Upstream::with_guides(5);
    let h = harness(&upstream, 3).await;
    let store: Arc<dyn UsageStore> = Arc::new(SqliteStore::open(&h.config).await.unwrap());

    orchestrator(&h, store.clone(), 3).sync_all(false).await.unwrap();
    let first = store.all_usages().await.unwrap();
    let planner_requests = upstream.planner_requests_total();
    let page_requests = upstream.pages();
    assert_eq!(first.len(), 15);
    assert_eq!(planner_requests, 5);

    let summary = orchestrator(&h, store.clone(), 3).sync_all(false).await.unwrap();
    assert_eq!(summary.guides_succeeded, 5);
    assert_eq!(store.all_usages().await.unwrap(), first);

    // Guide pages are re-read, planners come from cache, the listing too.
    assert_eq!(upstream.planner_requests_total(), planner_requests);
    assert_eq!(upstream.pages(), page_requests * 2);
    assert_eq!(upstream.searches(), 1);
}

#[tokio::test]
async fn sync_one_by_slug_and_url() {
    let upstream = Upstream::with_guides(3);
    let h = harness(&upstream, 3).await;
    let store = Arc::new(InMemoryStore::new());
    let orch = orchestrator(&h, store.clone(), 1);

    let result = orch.sync_one("guide-001").await.unwrap();
    assert!(result.is_persisted());
    assert_eq!(result.usages.len(), 3);

    let url = result.guide.url.clone();
    let again = orch.sync_one(&format!("{}/?utm=x", url)).await.unwrap();
    assert_eq!(again.guide.url, url);

    match orch.sync_one("no-such-guide").await {
        Err(HarvestError::GuideNotFound(r)) => assert_eq!(r, "no-such-guide"),
        other => panic!("expected GuideNotFound, got {:?}", other.map(|r| r.guide)),
    }
    assert_eq!(store.guides().await.unwrap().len(), 1);
}

// ═══════════════════════════════════════════════════════════════════════
// Re-entry and cancellation
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn second_run_on_same_dataset_is_rejected() {
    let upstream = Upstream::with_guides(2);
    let h = harness(&upstream, 3).await;
    let store: Arc<dyn UsageStore> = Arc::new(InMemoryStore::new());
    let lock = RunLock::new();

    let first = orchestrator(&h, store.clone(), 1).with_run_lock(lock.clone());
    let second = orchestrator(&h, store, 1).with_run_lock(lock.clone());

    let guard = first.lock_run().unwrap();
    match second.sync_all(false).await {
        Err(HarvestError::SyncInProgress(label)) => assert_eq!(label, "web:mock"),
        other => panic!("expected SyncInProgress, got {:?}", other.map(|s| s.run_id)),
    }
    assert_eq!(upstream.searches(), 0);

    drop(guard);
    assert!(!lock.is_held());
    assert_eq!(second.sync_all(false).await.unwrap().guides_succeeded, 2);
}

#[tokio::test]
async fn cancellation_stops_new_guides_and_keeps_in_flight_ones() {
    let cancel = CancellationToken::new();
    let mut upstream = Upstream::with_guides(5);
    upstream.cancel_on_planner = Some(cancel.clone());
    let h = harness(&upstream, 3).await;
    let store = Arc::new(InMemoryStore::new());

    let summary = orchestrator(&h, store.clone(), 1)
        .with_cancellation(cancel.clone())
        .sync_all(false)
        .await
        .unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.guides_attempted, 1);
    assert_eq!(summary.guides_succeeded, 1);
    assert_eq!(summary.guides_skipped, 4);
    assert_eq!(store.guides().await.unwrap().len(), 1);

    match orchestrator(&h, store, 1).with_cancellation(cancel).sync_all(false).await {
        Err(HarvestError::Cancelled) => {}
        other => panic!("expected Cancelled, got {:?}", other.map(|s| s.run_id)),
    }
}
