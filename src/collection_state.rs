//! Per-(app, marketplace) change detection and outcome ledger.
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use tracing::{info, instrument, warn};

use crate::database_ops::{CollectionStatusRecord, Db};
use crate::marketplace::Marketplace;
use crate::transport::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectionMode {
    /// Nothing trustworthy stored yet: harvest everything the budget allows.
    Initial,
    /// Reviews already stored: stop at the first known review.
    Incremental,
}

impl fmt::Display for CollectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CollectionMode::Initial => "INITIAL",
            CollectionMode::Incremental => "INCREMENTAL",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub collect: bool,
    pub mode: CollectionMode,
    pub reason: &'static str,
}

/// Every failure code that can land in `collection_status.last_error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureCode {
    Transport(ErrorKind),
    NotFound,
    PermanentlyRemoved,
}

impl FailureCode {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCode::Transport(k) => k.code(),
            FailureCode::NotFound => "NOT_FOUND",
            FailureCode::PermanentlyRemoved => "PERMANENTLY_REMOVED",
        }
    }

    /// App-level failures exclude the app immediately, without waiting for the threshold.
    pub fn is_permanent(self) -> bool {
        matches!(self, FailureCode::NotFound | FailureCode::PermanentlyRemoved)
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ErrorKind> for FailureCode {
    fn from(k: ErrorKind) -> Self {
        FailureCode::Transport(k)
    }
}

pub struct CollectionState {
    db: Db,
}

impl CollectionState {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn record(
        &self,
        app_id: &str,
        marketplace: Marketplace,
    ) -> Result<Option<CollectionStatusRecord>> {
        self.db.get_status(app_id, marketplace).await
    }

    pub async fn should_collect(
        &self,
        app_id: &str,
        marketplace: Marketplace,
        remote_count: i64,
    ) -> Result<Decision> {
        let rec = self.db.get_status(app_id, marketplace).await?;
        Ok(decide(rec.as_ref(), remote_count))
    }

    pub async fn record_success(
        &self,
        app_id: &str,
        marketplace: Marketplace,
        remote_count: i64,
        collected_delta: i64,
    ) -> Result<()> {
        self.record_success_limited(app_id, marketplace, remote_count, collected_delta, None)
            .await
    }

    /// `record_success` that also notes why a run stopped short of everything available.
    pub async fn record_success_limited(
        &self,
        app_id: &str,
        marketplace: Marketplace,
        remote_count: i64,
        collected_delta: i64,
        limited_reason: Option<&str>,
    ) -> Result<()> {
        self.db
            .upsert_success(
                app_id,
                marketplace,
                remote_count,
                collected_delta,
                limited_reason,
                Utc::now(),
            )
            .await
    }

    /// After a failed incremental run that stored some of the new head: the next run
    /// resumes in INITIAL mode instead of halting on the reviews it just stored.
    pub async fn mark_resume_pending(&self, app_id: &str, marketplace: Marketplace) -> Result<bool> {
        self.db.mark_resume_pending(app_id, marketplace).await
    }

    /// Returns the consecutive failure count after this failure.
    pub async fn record_failure(
        &self,
        app_id: &str,
        marketplace: Marketplace,
        remote_count: Option<i64>,
        code: FailureCode,
        detail: Option<&str>,
    ) -> Result<i64> {
        self.db
            .upsert_failure(
                app_id,
                marketplace,
                remote_count,
                code.as_str(),
                detail,
                Utc::now(),
            )
            .await
    }
}

/// The gating rule on its own, so it can be reasoned about without a store.
pub fn decide(record: Option<&CollectionStatusRecord>, remote_count: i64) -> Decision {
    match record {
        None => Decision {
            collect: true,
            mode: CollectionMode::Initial,
            reason: "new_app",
        },
        Some(r) if !r.initial_done => Decision {
            collect: true,
            mode: CollectionMode::Initial,
            reason: "initial_incomplete",
        },
        Some(r) if r.resume_pending => Decision {
            collect: true,
            mode: CollectionMode::Initial,
            reason: "resume_incomplete",
        },
        Some(r) if r.last_known_remote_count == Some(remote_count) => Decision {
            collect: false,
            mode: CollectionMode::Incremental,
            reason: "no_change",
        },
        Some(_) => Decision {
            collect: true,
            mode: CollectionMode::Incremental,
            reason: "count_changed",
        },
    }
}

/// Scheduling exclusion, applied before `should_collect`. An app is out when it carries a
/// permanent marker or its failure streak has reached the threshold.
#[derive(Clone)]
pub struct Governance {
    db: Db,
    pub max_consecutive_failures: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exclusion {
    Permanent(String),
    FailureThreshold(i64),
}

impl Governance {
    pub fn new(db: Db, max_consecutive_failures: i64) -> Self {
        Self {
            db,
            max_consecutive_failures,
        }
    }

    pub async fn exclusion(&self, app_id: &str, marketplace: Marketplace) -> Result<Option<Exclusion>> {
        if let Some(reason) = self.db.permanent_failure_reason(app_id, marketplace).await? {
            return Ok(Some(Exclusion::Permanent(reason)));
        }
        let failures = self
            .db
            .get_status(app_id, marketplace)
            .await?
            .map(|r| r.consecutive_failures)
            .unwrap_or(0);
        if failures >= self.max_consecutive_failures {
            return Ok(Some(Exclusion::FailureThreshold(failures)));
        }
        Ok(None)
    }

    /// Escalation after a recorded failure. Returns true when the app was newly excluded.
    #[instrument(skip(self, detail))]
    pub async fn escalate(
        &self,
        app_id: &str,
        marketplace: Marketplace,
        code: FailureCode,
        failures: i64,
        detail: Option<&str>,
    ) -> Result<bool> {
        let reason = if code.is_permanent() {
            code.as_str()
        } else if failures >= self.max_consecutive_failures {
            "failure_threshold"
        } else {
            return Ok(false);
        };
        let marked = self
            .db
            .mark_app_failed(app_id, marketplace, reason, detail, Utc::now())
            .await?;
        if marked {
            warn!(app_id, marketplace = %marketplace, reason, failures, "app excluded from collection");
        } else {
            info!(app_id, marketplace = %marketplace, reason, "app already excluded");
        }
        Ok(marked)
    }
}
