//! Store statistics overview.
//!
//! Summarizes what the last syncs persisted: guide counts by status,
//! profile and item-usage counts, how many usages reference items missing
//! from the catalog, and a per-source breakdown. Used by `harvest stats`.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// Per-source breakdown of guide and usage counts.
struct SourceStats {
    source: String,
    guides: i64,
    failed: i64,
    usages: i64,
    last_success_ts: Option<i64>,
}

/// Totals across the whole store.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StoreTotals {
    pub guides_persisted: i64,
    pub guides_failed: i64,
    pub profiles: i64,
    pub usages: i64,
    pub unknown_usages: i64,
    /// `(context, usages)` pairs, most used first.
    pub by_context: Vec<(String, i64)>,
}

/// Count rows in each table. Shared by `run_stats` and tests.
pub async fn store_totals(pool: &SqlitePool) -> Result<StoreTotals> {
    let guides_persisted: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM guides WHERE status = 'persisted'")
            .fetch_one(pool)
            .await?;

    let guides_failed: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM guides WHERE status = 'failed'")
            .fetch_one(pool)
            .await?;

    let profiles: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM profiles")
        .fetch_one(pool)
        .await?;

    let usages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM item_usages")
        .fetch_one(pool)
        .await?;

    let unknown_usages: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM item_usages WHERE item_name IS NULL")
            .fetch_one(pool)
            .await?;

    let by_context = sqlx::query(
        "SELECT context, COUNT(*) AS n FROM item_usages GROUP BY context ORDER BY n DESC, context",
    )
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| (row.get::<String, _>("context"), row.get::<i64, _>("n")))
    .collect();

    Ok(StoreTotals {
        guides_persisted,
        guides_failed,
        profiles,
        usages,
        unknown_usages,
        by_context,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let totals = store_totals(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Build Harvest: Store Stats");
    println!("==========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!(
        "  Guides:      {} persisted, {} failed",
        totals.guides_persisted, totals.guides_failed
    );
    println!("  Profiles:    {}", totals.profiles);
    println!("  Usages:      {}", totals.usages);
    println!(
        "  Unknown:     {} / {} ({}%)",
        totals.unknown_usages,
        totals.usages,
        if totals.usages > 0 {
            (totals.unknown_usages * 100) / totals.usages
        } else {
            0
        }
    );

    if !totals.by_context.is_empty() {
        println!();
        println!("  By context:");
        for (context, n) in &totals.by_context {
            println!("    {:<12} {:>8}", context, n);
        }
    }

    let source_rows = sqlx::query(
        r#"
        SELECT
            g.source,
            COUNT(DISTINCT g.url) AS guides,
            COUNT(DISTINCT CASE WHEN g.status = 'failed' THEN g.url END) AS failed,
            COUNT(u.id) AS usages,
            MAX(g.last_success_at) AS last_success_at
        FROM guides g
        LEFT JOIN item_usages u ON u.guide_url = g.url
        GROUP BY g.source
        ORDER BY guides DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let source_stats: Vec<SourceStats> = source_rows
        .iter()
        .map(|row| SourceStats {
            source: row.get("source"),
            guides: row.get("guides"),
            failed: row.get("failed"),
            usages: row.get("usages"),
            last_success_ts: row.get("last_success_at"),
        })
        .collect();

    if !source_stats.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<24} {:>6} {:>6} {:>8}   {}",
            "SOURCE", "GUIDES", "FAILED", "USAGES", "LAST SUCCESS"
        );
        println!("  {}", "-".repeat(72));

        for s in &source_stats {
            let sync_display = match s.last_success_ts {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<24} {:>6} {:>6} {:>8}   {}",
                s.source, s.guides, s.failed, s.usages, sync_display
            );
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
pub(crate) fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_store::SqliteStore;
    use build_harvest_core::models::{
        EnrichedUsage, Guide, ItemMeta, ItemUsage, PlannerId, Profile, UsageContext,
    };
    use build_harvest_core::store::{GuideStatus, UsageStore};
    use tempfile::TempDir;

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn relative_time_buckets() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(now - 86400), "1 day ago");
    }

    #[tokio::test]
    async fn totals_count_unknown_items_and_contexts() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::minimal();
        config.db.path = tmp.path().join("harvest.sqlite");
        let store = SqliteStore::open(&config).await.unwrap();

        let guide = Guide {
            id: "g".to_string(),
            title: "G".to_string(),
            url: "https://example.com/d3/guides/g".to_string(),
        };
        let profile = Profile {
            guide_id: guide.id.clone(),
            guide_url: guide.url.clone(),
            planner_id: PlannerId::parse("p1").unwrap(),
            name: "Main".to_string(),
            class: "wizard".to_string(),
        };
        let usage = |item: &str, context, known: bool| EnrichedUsage {
            usage: ItemUsage {
                profile: profile.key(),
                item_id: item.to_string(),
                slot: "ring".to_string(),
                context,
            },
            meta: known.then(|| ItemMeta {
                id: item.to_string(),
                name: item.to_string(),
                item_type: "Ring".to_string(),
                quality: "set".to_string(),
            }),
        };

        store
            .replace_builds(
                &guide,
                &[profile.clone()],
                &[
                    usage("A", UsageContext::Main, true),
                    usage("B", UsageContext::Main, false),
                    usage("C", UsageContext::KanaiCube, true),
                ],
            )
            .await
            .unwrap();
        store
            .record_guide("web:test", &guide, &GuideStatus::Persisted)
            .await
            .unwrap();

        let totals = store_totals(store.pool()).await.unwrap();
        assert_eq!(totals.guides_persisted, 1);
        assert_eq!(totals.guides_failed, 0);
        assert_eq!(totals.profiles, 1);
        assert_eq!(totals.usages, 3);
        assert_eq!(totals.unknown_usages, 1);
        assert_eq!(
            totals.by_context,
            vec![("main".to_string(), 2), ("kanai-cube".to_string(), 1)]
        );
    }
}
