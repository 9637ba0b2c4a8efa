use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::QueryBuilder;
use std::collections::HashSet;
use tracing::{debug, instrument};

use super::db::Db;
use crate::marketplace::Marketplace;

/// Canonical review row. Identity is (app_id, marketplace, review_id).
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ReviewRecord {
    pub app_id: String,
    pub marketplace: String,
    pub review_id: String,
    pub language: Option<String>,
    pub country: Option<String>,
    pub rating: Option<i64>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub user_name: Option<String>,
    pub app_version: Option<String>,
    pub thumbs_up: Option<i64>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub reply_content: Option<String>,
    pub replied_at: Option<DateTime<Utc>>,
}

impl ReviewRecord {
    pub fn new(app_id: &str, marketplace: Marketplace, review_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.to_string(),
            marketplace: marketplace.as_str().to_string(),
            review_id: review_id.into(),
            language: None,
            country: None,
            rating: None,
            title: None,
            content: None,
            user_name: None,
            app_version: None,
            thumbs_up: None,
            reviewed_at: None,
            reply_content: None,
            replied_at: None,
        }
    }
}

/// Where harvested pages go. Inserts are insert-or-ignore; the return value counts rows
/// actually stored.
#[async_trait]
pub trait ReviewSink: Send + Sync {
    async fn insert_reviews(&self, rows: &[ReviewRecord]) -> Result<u64>;
}

// keeps (rows * columns) well under SQLite's bind parameter limit
const INSERT_CHUNK: usize = 500;

impl Db {
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn insert_reviews_batch(&self, rows: &[ReviewRecord]) -> Result<u64> {
        let pool = &self.pool;
        let now = Utc::now();
        let mut inserted = 0u64;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let res = self
                .retrying("insert_reviews", || async move {
                    let mut qb: QueryBuilder<'_, sqlx::Sqlite> = QueryBuilder::new(
                        "INSERT OR IGNORE INTO reviews (app_id, marketplace, review_id, language, country, \
                         rating, title, content, user_name, app_version, thumbs_up, reviewed_at, \
                         reply_content, replied_at, recorded_at) ",
                    );
                    qb.push_values(chunk, |mut b, r| {
                        b.push_bind(&r.app_id)
                            .push_bind(&r.marketplace)
                            .push_bind(&r.review_id)
                            .push_bind(&r.language)
                            .push_bind(&r.country)
                            .push_bind(r.rating)
                            .push_bind(&r.title)
                            .push_bind(&r.content)
                            .push_bind(&r.user_name)
                            .push_bind(&r.app_version)
                            .push_bind(r.thumbs_up)
                            .push_bind(r.reviewed_at)
                            .push_bind(&r.reply_content)
                            .push_bind(r.replied_at)
                            .push_bind(now);
                    });
                    qb.build().execute(pool).await
                })
                .await?;
            inserted += res.rows_affected();
        }
        debug!(offered = rows.len(), inserted, "reviews stored");
        Ok(inserted)
    }

    /// Every review id already stored for the app; seeds the run's dedup set.
    pub async fn existing_review_ids(
        &self,
        app_id: &str,
        marketplace: Marketplace,
    ) -> Result<HashSet<String>> {
        let pool = &self.pool;
        let ids = self
            .retrying("existing_review_ids", || {
                sqlx::query_scalar::<_, String>(
                    "SELECT review_id FROM reviews WHERE app_id = ? AND marketplace = ?",
                )
                .bind(app_id)
                .bind(marketplace.as_str())
                .fetch_all(pool)
            })
            .await?;
        Ok(ids.into_iter().collect())
    }

    pub async fn review_count(&self, app_id: &str, marketplace: Marketplace) -> Result<i64> {
        let pool = &self.pool;
        self.retrying("review_count", || {
            sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM reviews WHERE app_id = ? AND marketplace = ?",
            )
            .bind(app_id)
            .bind(marketplace.as_str())
            .fetch_one(pool)
        })
        .await
    }
}

#[async_trait]
impl ReviewSink for Db {
    async fn insert_reviews(&self, rows: &[ReviewRecord]) -> Result<u64> {
        self.insert_reviews_batch(rows).await
    }
}
