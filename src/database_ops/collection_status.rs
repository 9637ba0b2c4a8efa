use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::instrument;

use super::db::Db;
use crate::marketplace::Marketplace;

/// One row of the per-(app, marketplace) collection ledger.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct CollectionStatusRecord {
    pub app_id: String,
    pub marketplace: String,
    pub last_known_remote_count: Option<i64>,
    pub collected_count: i64,
    pub last_collected_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i64,
    pub last_error_code: Option<String>,
    pub last_error_detail: Option<String>,
    pub initial_done: bool,
    pub collection_limited: bool,
    pub collection_limited_reason: Option<String>,
    /// A run failed after storing part of the new head; the next run must page past known ids.
    pub resume_pending: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, sqlx::FromRow)]
pub struct CollectionStats {
    pub attempted: i64,
    pub succeeded: i64,
    pub failing: i64,
    pub limited: i64,
}

const STATUS_COLUMNS: &str = "app_id, marketplace, last_known_remote_count, collected_count, \
     last_collected_at, last_attempt_at, consecutive_failures, last_error_code, last_error_detail, \
     initial_done, collection_limited, collection_limited_reason, resume_pending";

impl Db {
    pub async fn get_status(
        &self,
        app_id: &str,
        marketplace: Marketplace,
    ) -> Result<Option<CollectionStatusRecord>> {
        let pool = &self.pool;
        let sql = format!(
            "SELECT {STATUS_COLUMNS} FROM collection_status WHERE app_id = ? AND marketplace = ?"
        );
        let sql = sql.as_str();
        self.retrying("get_status", || {
            sqlx::query_as::<_, CollectionStatusRecord>(sql)
                .bind(app_id)
                .bind(marketplace.as_str())
                .fetch_optional(pool)
        })
        .await
    }

    /// Upsert after a successful run: clears the failure streak and adds `collected_delta`.
    #[instrument(skip(self))]
    pub async fn upsert_success(
        &self,
        app_id: &str,
        marketplace: Marketplace,
        remote_count: i64,
        collected_delta: i64,
        limited_reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let pool = &self.pool;
        self.retrying("upsert_success", || {
            sqlx::query(
                "INSERT INTO collection_status (
                    app_id, marketplace, last_known_remote_count, collected_count,
                    last_collected_at, last_attempt_at, consecutive_failures,
                    initial_done, collection_limited, collection_limited_reason,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5, 0, 1, ?6, ?7, ?5, ?5)
                 ON CONFLICT (app_id, marketplace) DO UPDATE SET
                    last_known_remote_count = excluded.last_known_remote_count,
                    collected_count = collection_status.collected_count + excluded.collected_count,
                    last_collected_at = excluded.last_collected_at,
                    last_attempt_at = excluded.last_attempt_at,
                    consecutive_failures = 0,
                    last_error_code = NULL,
                    last_error_detail = NULL,
                    initial_done = 1,
                    resume_pending = 0,
                    collection_limited = excluded.collection_limited,
                    collection_limited_reason = excluded.collection_limited_reason,
                    updated_at = excluded.updated_at",
            )
            .bind(app_id)
            .bind(marketplace.as_str())
            .bind(remote_count)
            .bind(collected_delta.max(0))
            .bind(now)
            .bind(limited_reason.is_some())
            .bind(limited_reason)
            .execute(pool)
        })
        .await?;
        Ok(())
    }

    /// Upsert after a failed attempt; returns the new consecutive failure count.
    /// A `None` remote count keeps whatever was last seen.
    #[instrument(skip(self, detail))]
    pub async fn upsert_failure(
        &self,
        app_id: &str,
        marketplace: Marketplace,
        remote_count: Option<i64>,
        error_code: &str,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        let pool = &self.pool;
        self.retrying("upsert_failure", || {
            sqlx::query_scalar::<_, i64>(
                "INSERT INTO collection_status (
                    app_id, marketplace, last_known_remote_count, last_attempt_at,
                    consecutive_failures, last_error_code, last_error_detail,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?4, ?4)
                 ON CONFLICT (app_id, marketplace) DO UPDATE SET
                    last_known_remote_count = COALESCE(excluded.last_known_remote_count,
                                                       collection_status.last_known_remote_count),
                    last_attempt_at = excluded.last_attempt_at,
                    consecutive_failures = collection_status.consecutive_failures + 1,
                    last_error_code = excluded.last_error_code,
                    last_error_detail = excluded.last_error_detail,
                    updated_at = excluded.updated_at
                 RETURNING consecutive_failures",
            )
            .bind(app_id)
            .bind(marketplace.as_str())
            .bind(remote_count)
            .bind(now)
            .bind(error_code)
            .bind(detail)
            .fetch_one(pool)
        })
        .await
    }

    /// Flags an already-collected app whose last run stopped partway through new reviews.
    /// No-op for apps that never finished an initial run.
    pub async fn mark_resume_pending(&self, app_id: &str, marketplace: Marketplace) -> Result<bool> {
        let pool = &self.pool;
        let res = self
            .retrying("mark_resume_pending", || {
                sqlx::query(
                    "UPDATE collection_status SET resume_pending = 1
                     WHERE app_id = ? AND marketplace = ? AND initial_done = 1",
                )
                .bind(app_id)
                .bind(marketplace.as_str())
                .execute(pool)
            })
            .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Records a permanent exclusion. Returns false if the app was already marked.
    pub async fn mark_app_failed(
        &self,
        app_id: &str,
        marketplace: Marketplace,
        reason: &str,
        detail: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let pool = &self.pool;
        let res = self
            .retrying("mark_app_failed", || {
                sqlx::query(
                    "INSERT OR IGNORE INTO failed_apps (app_id, marketplace, reason, detail, failed_at)
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(app_id)
                .bind(marketplace.as_str())
                .bind(reason)
                .bind(detail)
                .bind(now)
                .execute(pool)
            })
            .await?;
        Ok(res.rows_affected() > 0)
    }

    pub async fn permanent_failure_reason(
        &self,
        app_id: &str,
        marketplace: Marketplace,
    ) -> Result<Option<String>> {
        let pool = &self.pool;
        self.retrying("permanent_failure_reason", || {
            sqlx::query_scalar::<_, String>(
                "SELECT reason FROM failed_apps WHERE app_id = ? AND marketplace = ?",
            )
            .bind(app_id)
            .bind(marketplace.as_str())
            .fetch_optional(pool)
        })
        .await
    }

    /// Failure counts grouped by last error code, for apps currently failing.
    pub async fn failure_stats(&self, marketplace: Marketplace) -> Result<Vec<(String, i64)>> {
        let pool = &self.pool;
        self.retrying("failure_stats", || {
            sqlx::query_as::<_, (String, i64)>(
                "SELECT last_error_code, COUNT(*) FROM collection_status
                 WHERE marketplace = ? AND consecutive_failures > 0 AND last_error_code IS NOT NULL
                 GROUP BY last_error_code ORDER BY COUNT(*) DESC, last_error_code",
            )
            .bind(marketplace.as_str())
            .fetch_all(pool)
        })
        .await
    }

    pub async fn consecutive_failure_apps(
        &self,
        marketplace: Marketplace,
        min_failures: i64,
    ) -> Result<Vec<CollectionStatusRecord>> {
        let pool = &self.pool;
        let sql = format!(
            "SELECT {STATUS_COLUMNS} FROM collection_status
             WHERE marketplace = ? AND consecutive_failures >= ?
             ORDER BY consecutive_failures DESC, app_id"
        );
        let sql = sql.as_str();
        self.retrying("consecutive_failure_apps", || {
            sqlx::query_as::<_, CollectionStatusRecord>(sql)
                .bind(marketplace.as_str())
                .bind(min_failures)
                .fetch_all(pool)
        })
        .await
    }

    /// Attempt outcomes for records touched since `since`.
    pub async fn collection_stats_since(
        &self,
        marketplace: Marketplace,
        since: DateTime<Utc>,
    ) -> Result<CollectionStats> {
        let pool = &self.pool;
        self.retrying("collection_stats_since", || {
            sqlx::query_as::<_, CollectionStats>(
                "SELECT
                    COUNT(*) AS attempted,
                    COALESCE(SUM(CASE WHEN last_collected_at >= ?2 THEN 1 ELSE 0 END), 0) AS succeeded,
                    COALESCE(SUM(CASE WHEN consecutive_failures > 0 THEN 1 ELSE 0 END), 0) AS failing,
                    COALESCE(SUM(CASE WHEN collection_limited THEN 1 ELSE 0 END), 0) AS limited
                 FROM collection_status
                 WHERE marketplace = ?1 AND last_attempt_at >= ?2",
            )
            .bind(marketplace.as_str())
            .bind(since)
            .fetch_one(pool)
        })
        .await
    }
}
