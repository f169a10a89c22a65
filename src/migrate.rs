use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Guide rows: existence and last sync status
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS guides (
            url TEXT PRIMARY KEY,
            guide_id TEXT NOT NULL,
            title TEXT NOT NULL,
            source TEXT NOT NULL,
            status TEXT NOT NULL,
            error_kind TEXT,
            error_message TEXT,
            last_attempt_at INTEGER NOT NULL,
            last_success_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS profiles (
            guide_url TEXT NOT NULL,
            planner_id TEXT NOT NULL,
            name TEXT NOT NULL,
            guide_id TEXT NOT NULL,
            class TEXT NOT NULL,
            PRIMARY KEY (guide_url, planner_id, name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One row per (profile, item, slot, context); replays are ignored
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS item_usages (
            id TEXT PRIMARY KEY,
            guide_url TEXT NOT NULL,
            planner_id TEXT NOT NULL,
            profile_name TEXT NOT NULL,
            item_id TEXT NOT NULL,
            slot TEXT NOT NULL,
            context TEXT NOT NULL,
            item_name TEXT,
            item_type TEXT,
            item_quality TEXT,
            UNIQUE (guide_url, planner_id, profile_name, item_id, slot, context)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_item_usages_item ON item_usages(item_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_item_usages_guide ON item_usages(guide_url)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_guides_source ON guides(source)")
        .execute(pool)
        .await?;

    Ok(())
}
