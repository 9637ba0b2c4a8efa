use anyhow::Result;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::collections::HashSet;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

/// Process exit code used when the store stays unreachable past its retry budget.
pub const DB_UNAVAILABLE_EXIT_CODE: i32 = 75;

/// Fatal marker: the store could not be reached within the retry budget.
/// `main` looks for this in the error chain to pick the exit code.
#[derive(Debug, Error)]
#[error("persistent store unavailable during {operation}: {detail}")]
pub struct StoreUnavailable {
    pub operation: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct StoreRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for StoreRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_secs(2),
        }
    }
}

const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "collection_state",
        include_str!("../../migrations/0001_collection_state.sql"),
    ),
    (2, "reviews", include_str!("../../migrations/0002_reviews.sql")),
    (
        3,
        "resume_pending",
        include_str!("../../migrations/0003_resume_pending.sql"),
    ),
];

#[derive(Clone)]
pub struct Db {
    pub pool: SqlitePool,
    retry: StoreRetry,
}

/// Lock contention and pool/IO trouble are worth waiting out; anything else is a bug or bad data.
pub fn is_transient(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            msg.contains("database is locked") || msg.contains("busy")
        }
        _ => false,
    }
}

impl Db {
    // SECURITY: never include raw DSNs in tracing spans.
    #[instrument(skip(database_url, retry))]
    pub async fn connect(database_url: &str, max_connections: u32, retry: StoreRetry) -> Result<Self> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match Self::open_pool(database_url, max_connections).await {
                Ok(pool) => {
                    info!(attempt, "connected to db");
                    let db = Self { pool, retry };
                    db.run_migrations().await?;
                    return Ok(db);
                }
                Err(e) if attempt < retry.attempts.max(1) => {
                    warn!(attempt, max = retry.attempts, error = %e, "db connect failed; retrying");
                    tokio::time::sleep(retry.delay).await;
                }
                Err(e) => {
                    return Err(StoreUnavailable {
                        operation: "connect".into(),
                        detail: e.to_string(),
                    }
                    .into())
                }
            }
        }
    }

    async fn open_pool(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);
        SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect_with(options)
            .await
    }

    /// Private in-memory database with the schema applied. One connection that never
    /// expires, since the data lives only as long as it does.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let db = Self {
            pool,
            retry: StoreRetry {
                attempts: 1,
                delay: Duration::ZERO,
            },
        };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _harvester_migrations (
                version INTEGER PRIMARY KEY,
                description TEXT,
                installed_at TEXT DEFAULT CURRENT_TIMESTAMP
             )",
        )
        .execute(&self.pool)
        .await?;
        let applied: HashSet<i64> =
            sqlx::query_scalar::<_, i64>("SELECT version FROM _harvester_migrations")
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .collect();
        for &(version, desc, sql) in MIGRATIONS {
            if applied.contains(&version) {
                continue;
            }
            info!(version, desc, "applying migration");
            let mut tx = self.pool.begin().await?;
            sqlx::raw_sql(sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO _harvester_migrations (version, description) VALUES (?, ?)")
                .bind(version)
                .bind(desc)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
        }
        Ok(())
    }

    /// Runs `op`, waiting out transient store errors. Exhausting the budget yields
    /// `StoreUnavailable`; non-transient errors pass straight through.
    pub async fn retrying<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if is_transient(&e) && attempt < self.retry.attempts => {
                    warn!(operation, attempt, error = %e, "store busy; retrying");
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(e) if is_transient(&e) => {
                    return Err(StoreUnavailable {
                        operation: operation.into(),
                        detail: e.to_string(),
                    }
                    .into())
                }
                Err(e) => return Err(anyhow::Error::new(e).context(operation)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_schema_is_applied_once() {
        let db = Db::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        let versions: Vec<i64> =
            sqlx::query_scalar("SELECT version FROM _harvester_migrations ORDER BY version")
                .fetch_all(&db.pool)
                .await
                .unwrap();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn exhausted_retries_report_store_unavailable() {
        let db = Db::in_memory().await.unwrap();
        let err = db
            .retrying("probe", || async { Err::<(), _>(sqlx::Error::PoolTimedOut) })
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<StoreUnavailable>().is_some());
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_store_unavailable() {
        let db = Db::in_memory().await.unwrap();
        let err = db
            .retrying("probe", || async { Err::<(), _>(sqlx::Error::RowNotFound) })
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<StoreUnavailable>().is_none());
    }

    #[tokio::test]
    async fn connect_creates_file_database() {
        let path = std::env::temp_dir().join(format!("harvest-{}.db", uuid::Uuid::new_v4()));
        let url = format!("sqlite://{}", path.display());
        let db = Db::connect(&url, 2, StoreRetry::default()).await.unwrap();
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reviews")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(n, 0);
        db.pool.close().await;
        let _ = std::fs::remove_file(&path);
    }
}
