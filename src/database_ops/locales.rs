use anyhow::Result;

use super::db::Db;
use crate::locale::LocalePair;
use crate::marketplace::Marketplace;

impl Db {
    /// Locale set discovered for an app (written by the sitemap crawler).
    pub async fn app_locales(&self, app_id: &str, marketplace: Marketplace) -> Result<Vec<LocalePair>> {
        let pool = &self.pool;
        self.retrying("app_locales", || {
            sqlx::query_as::<_, LocalePair>(
                "SELECT language, country FROM app_localizations
                 WHERE app_id = ? AND marketplace = ? ORDER BY language, country",
            )
            .bind(app_id)
            .bind(marketplace.as_str())
            .fetch_all(pool)
        })
        .await
    }

    pub async fn record_locales(
        &self,
        app_id: &str,
        marketplace: Marketplace,
        locales: &[LocalePair],
    ) -> Result<()> {
        for l in locales {
            let pool = &self.pool;
            self.retrying("record_locales", || {
                sqlx::query(
                    "INSERT OR IGNORE INTO app_localizations (app_id, marketplace, language, country)
                     VALUES (?, ?, ?, ?)",
                )
                .bind(app_id)
                .bind(marketplace.as_str())
                .bind(&l.language)
                .bind(&l.country)
                .execute(pool)
            })
            .await?;
        }
        Ok(())
    }

    /// Apps due for collection: known locales, no permanent marker, failure streak under
    /// `max_failures`. Never-collected apps first, then least recently collected.
    pub async fn candidate_apps(
        &self,
        marketplace: Marketplace,
        max_failures: i64,
        limit: Option<i64>,
    ) -> Result<Vec<String>> {
        let pool = &self.pool;
        let limit = limit.unwrap_or(-1);
        self.retrying("candidate_apps", || {
            sqlx::query_scalar::<_, String>(
                "SELECT l.app_id
                 FROM (SELECT DISTINCT app_id FROM app_localizations WHERE marketplace = ?1) l
                 LEFT JOIN collection_status s ON s.app_id = l.app_id AND s.marketplace = ?1
                 LEFT JOIN failed_apps f ON f.app_id = l.app_id AND f.marketplace = ?1
                 WHERE f.app_id IS NULL AND COALESCE(s.consecutive_failures, 0) < ?2
                 ORDER BY s.last_collected_at IS NOT NULL, s.last_collected_at, l.app_id
                 LIMIT ?3",
            )
            .bind(marketplace.as_str())
            .bind(max_failures)
            .bind(limit)
            .fetch_all(pool)
        })
        .await
    }
}
