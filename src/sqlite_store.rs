//! SQLite-backed [`UsageStore`] implementation.
//!
//! Guide rows are upserted by [`record_guide`](UsageStore::record_guide);
//! a guide's profiles and usages are replaced inside one transaction by
//! [`replace_builds`](UsageStore::replace_builds). The `item_usages` UNIQUE
//! constraint plus `ON CONFLICT DO NOTHING` keeps replays idempotent.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use build_harvest_core::models::{
    EnrichedUsage, Guide, ItemUsage, PlannerId, Profile, ProfileKey, UsageContext,
};
use build_harvest_core::store::{BuildWriteStats, GuideRecord, GuideStatus, UsageStore};
use build_harvest_core::ErrorKind;

use crate::config::Config;
use crate::{db, migrate};

/// SQLite implementation of the [`UsageStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and apply migrations.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

fn usage_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ItemUsage> {
    let planner: String = row.get("planner_id");
    let context: String = row.get("context");
    Ok(ItemUsage {
        profile: ProfileKey {
            guide_url: row.get("guide_url"),
            planner_id: PlannerId::parse(&planner)
                .ok_or_else(|| anyhow!("invalid planner id in store: {:?}", planner))?,
            name: row.get("profile_name"),
        },
        item_id: row.get("item_id"),
        slot: row.get("slot"),
        context: UsageContext::parse(&context)
            .ok_or_else(|| anyhow!("invalid usage context in store: {:?}", context))?,
    })
}

const USAGE_COLUMNS: &str = "guide_url, planner_id, profile_name, item_id, slot, context";

#[async_trait]
impl UsageStore for SqliteStore {
    async fn record_guide(&self, source: &str, guide: &Guide, status: &GuideStatus) -> Result<()> {
        let now = Utc::now().timestamp();
        let (error_kind, error_message, success_at) = match status {
            GuideStatus::Persisted => (None, None, Some(now)),
            GuideStatus::Failed { kind, message } => {
                (Some(kind.as_str()), Some(message.as_str()), None)
            }
        };

        sqlx::query(
            r#"
            INSERT INTO guides (url, guide_id, title, source, status, error_kind, error_message,
                                last_attempt_at, last_success_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                guide_id = excluded.guide_id,
                title = excluded.title,
                source = excluded.source,
                status = excluded.status,
                error_kind = excluded.error_kind,
                error_message = excluded.error_message,
                last_attempt_at = excluded.last_attempt_at,
                last_success_at = COALESCE(excluded.last_success_at, guides.last_success_at)
            "#,
        )
        .bind(&guide.url)
        .bind(&guide.id)
        .bind(&guide.title)
        .bind(source)
        .bind(status.as_str())
        .bind(error_kind)
        .bind(error_message)
        .bind(now)
        .bind(success_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn replace_builds(
        &self,
        guide: &Guide,
        profiles: &[Profile],
        usages: &[EnrichedUsage],
    ) -> Result<BuildWriteStats> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM item_usages WHERE guide_url = ?")
            .bind(&guide.url)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM profiles WHERE guide_url = ?")
            .bind(&guide.url)
            .execute(&mut *tx)
            .await?;

        let mut stats = BuildWriteStats::default();

        for profile in profiles {
            let result = sqlx::query(
                r#"
                INSERT INTO profiles (guide_url, planner_id, name, guide_id, class)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(guide_url, planner_id, name) DO NOTHING
                "#,
            )
            .bind(&profile.guide_url)
            .bind(profile.planner_id.as_str())
            .bind(&profile.name)
            .bind(&profile.guide_id)
            .bind(&profile.class)
            .execute(&mut *tx)
            .await?;
            stats.profiles_written += result.rows_affected() as usize;
        }

        for enriched in usages {
            let usage = &enriched.usage;
            let meta = enriched.meta.as_ref();
            let result = sqlx::query(
                r#"
                INSERT INTO item_usages (id, guide_url, planner_id, profile_name, item_id, slot,
                                         context, item_name, item_type, item_quality)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(usage.dedup_hash())
            .bind(&usage.profile.guide_url)
            .bind(usage.profile.planner_id.as_str())
            .bind(&usage.profile.name)
            .bind(&usage.item_id)
            .bind(&usage.slot)
            .bind(usage.context.as_str())
            .bind(meta.map(|m| m.name.as_str()))
            .bind(meta.map(|m| m.item_type.as_str()))
            .bind(meta.map(|m| m.quality.as_str()))
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                stats.usages_written += 1;
            } else {
                stats.usages_ignored += 1;
            }
        }

        tx.commit().await?;
        Ok(stats)
    }

    async fn usages_for_guide(&self, guide_url: &str) -> Result<Vec<ItemUsage>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM item_usages WHERE guide_url = ?",
            USAGE_COLUMNS
        ))
        .bind(guide_url)
        .fetch_all(&self.pool)
        .await?;

        let mut usages = rows.iter().map(usage_from_row).collect::<Result<Vec<_>>>()?;
        usages.sort();
        Ok(usages)
    }

    async fn all_usages(&self) -> Result<Vec<ItemUsage>> {
        let rows = sqlx::query(&format!("SELECT {} FROM item_usages", USAGE_COLUMNS))
            .fetch_all(&self.pool)
            .await?;

        let mut usages = rows.iter().map(usage_from_row).collect::<Result<Vec<_>>>()?;
        usages.sort();
        Ok(usages)
    }

    async fn guides(&self) -> Result<Vec<GuideRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT url, guide_id, title, source, status, error_kind, error_message,
                   last_attempt_at, last_success_at
            FROM guides
            ORDER BY url
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                let status = match status.as_str() {
                    "persisted" => GuideStatus::Persisted,
                    _ => {
                        let kind: Option<String> = row.get("error_kind");
                        let message: Option<String> = row.get("error_message");
                        GuideStatus::Failed {
                            kind: kind.as_deref().and_then(ErrorKind::parse).ok_or_else(|| {
                                anyhow!("guide row with unknown error kind: {:?}", kind)
                            })?,
                            message: message.unwrap_or_default(),
                        }
                    }
                };
                Ok(GuideRecord {
                    guide: Guide {
                        id: row.get("guide_id"),
                        title: row.get("title"),
                        url: row.get("url"),
                    },
                    source: row.get("source"),
                    status,
                    last_attempt_at: from_ts(row.get("last_attempt_at")),
                    last_success_at: row.get::<Option<i64>, _>("last_success_at").map(from_ts),
                })
            })
            .collect()
    }
}
