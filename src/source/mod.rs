//! Marketplace review listings and detail counts, fetched through `Transport`.
pub mod app_store;
pub mod play_store;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::collection_state::FailureCode;
use crate::database_ops::ReviewRecord;
use crate::locale::LocalePair;
use crate::marketplace::Marketplace;
use crate::transport::{ErrorKind, HttpOutcome, Payload};

pub use app_store::AppStoreSource;
pub use play_store::{PlayEndpoints, PlayStoreSource};

/// Position in a locale's listing: numbered pages or an opaque continuation token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageCursor {
    Page(u32),
    Token(String),
}

#[derive(Debug, Clone, Default)]
pub struct ReviewPage {
    pub reviews: Vec<ReviewRecord>,
    /// `None` once the listing is exhausted.
    pub next: Option<PageCursor>,
}

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("{kind}: {detail}")]
    Transport { kind: ErrorKind, detail: String },
    #[error("app not found")]
    NotFound,
    #[error("app permanently removed")]
    PermanentlyRemoved,
}

impl SourceError {
    pub fn code(&self) -> FailureCode {
        match self {
            SourceError::Transport { kind, .. } => FailureCode::Transport(*kind),
            SourceError::NotFound => FailureCode::NotFound,
            SourceError::PermanentlyRemoved => FailureCode::PermanentlyRemoved,
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        SourceError::Transport {
            kind: ErrorKind::UnknownError,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait ReviewSource: Send {
    fn marketplace(&self) -> Marketplace;

    /// Total review/rating count the marketplace reports; the change-detection signal.
    /// `locales` are the app's harvest partitions, primary first.
    async fn remote_count(&mut self, app_id: &str, locales: &[LocalePair]) -> Result<i64, SourceError>;

    /// One page of reviews for a locale, newest first. `cursor = None` starts at the top.
    async fn fetch_page(
        &mut self,
        app_id: &str,
        locale: &LocalePair,
        cursor: Option<&PageCursor>,
    ) -> Result<ReviewPage, SourceError>;
}

/// JSON body of a successful outcome, or the app-level/transport error it represents.
pub(crate) fn json_body(outcome: HttpOutcome) -> Result<Value, SourceError> {
    if outcome.success {
        return match outcome.data {
            Some(Payload::Json(v)) => Ok(v),
            _ => Err(SourceError::malformed("expected json body")),
        };
    }
    match outcome.status {
        Some(404) => Err(SourceError::NotFound),
        Some(410) => Err(SourceError::PermanentlyRemoved),
        _ => Err(SourceError::Transport {
            kind: outcome.error_kind.unwrap_or(ErrorKind::UnknownError),
            detail: outcome.detail.unwrap_or_default(),
        }),
    }
}

/// Accepts RFC 3339, naive `YYYY-MM-DD[T ]HH:MM:SS` (taken as UTC), or unix seconds/millis.
pub(crate) fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
                .map(|n| Utc.from_utc_datetime(&n))
        }
        Value::Number(n) => {
            let raw = n.as_i64()?;
            // anything past year ~2286 in seconds is really milliseconds
            if raw > 9_999_999_999 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

pub(crate) fn non_empty(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}
