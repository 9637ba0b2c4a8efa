//! Sequential per-app harvesting for one marketplace.
use anyhow::Result;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::is_store_unavailable;
use crate::allocator::{HarvestError, LocaleQuotaAllocator};
use crate::collection_state::{CollectionMode, CollectionState, Exclusion, FailureCode, Governance};
use crate::database_ops::Db;
use crate::locale::partition_locales;
use crate::marketplace::Marketplace;
use crate::source::{ReviewSource, SourceError};

/// Stored as `collection_limited_reason` when the per-run budget ran out before the listings did.
pub const LIMITED_BY_BUDGET: &str = "BUDGET_EXHAUSTED";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub processed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub reviews_collected: u64,
}

impl BatchSummary {
    pub fn absorb(&mut self, other: BatchSummary) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.reviews_collected += other.reviews_collected;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppOutcome {
    Excluded(Exclusion),
    Unchanged,
    Collected {
        mode: CollectionMode,
        collected: u64,
        limited: bool,
    },
    Failed {
        code: FailureCode,
        consecutive_failures: i64,
        /// Reviews stored before the failure; they stay stored.
        collected: u64,
        excluded: bool,
    },
}

pub struct Harvester<S: ReviewSource> {
    source: S,
    db: Db,
    state: CollectionState,
    governance: Governance,
    budget: u64,
    run_id: Uuid,
}

impl<S: ReviewSource> Harvester<S> {
    pub fn new(source: S, db: Db, budget: u64, max_consecutive_failures: i64) -> Self {
        Self {
            source,
            state: CollectionState::new(db.clone()),
            governance: Governance::new(db.clone(), max_consecutive_failures),
            db,
            budget,
            run_id: Uuid::new_v4(),
        }
    }

    pub fn marketplace(&self) -> Marketplace {
        self.source.marketplace()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Harvests each app in turn. Individual app failures are counted and the batch moves
    /// on; only an unreachable store ends it early.
    pub async fn run_batch(&mut self, apps: &[String]) -> Result<BatchSummary> {
        let mp = self.marketplace();
        info!(run_id = %self.run_id, marketplace = %mp, apps = apps.len(), budget = self.budget, "batch start");
        let mut summary = BatchSummary::default();
        for app_id in apps {
            match self.harvest_app(app_id).await {
                Ok(AppOutcome::Collected { collected, .. }) => {
                    summary.processed += 1;
                    summary.reviews_collected += collected;
                }
                Ok(AppOutcome::Excluded(_)) | Ok(AppOutcome::Unchanged) => summary.skipped += 1,
                Ok(AppOutcome::Failed { collected, .. }) => {
                    summary.failed += 1;
                    summary.reviews_collected += collected;
                }
                Err(e) if is_store_unavailable(&e) => {
                    error!(run_id = %self.run_id, app_id = %app_id, error = %e, "store unavailable; aborting batch");
                    return Err(e);
                }
                Err(e) => {
                    summary.failed += 1;
                    error!(run_id = %self.run_id, app_id = %app_id, error = ?e, "app harvest errored");
                }
            }
        }
        info!(
            run_id = %self.run_id,
            marketplace = %mp,
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            reviews = summary.reviews_collected,
            "batch done"
        );
        Ok(summary)
    }

    #[instrument(skip(self), fields(run_id = %self.run_id, marketplace = %self.source.marketplace()))]
    pub async fn harvest_app(&mut self, app_id: &str) -> Result<AppOutcome> {
        let mp = self.source.marketplace();
        if let Some(ex) = self.governance.exclusion(app_id, mp).await? {
            debug!(exclusion = ?ex, "excluded; skipping");
            return Ok(AppOutcome::Excluded(ex));
        }

        let discovered = self.db.app_locales(app_id, mp).await?;
        let locales = partition_locales(mp, &discovered);
        let remote = match self.source.remote_count(app_id, &locales).await {
            Ok(n) => n,
            Err(e) => return self.fail(app_id, &e, 0).await,
        };

        let decision = self.state.should_collect(app_id, mp, remote).await?;
        if !decision.collect {
            debug!(remote, reason = decision.reason, "unchanged; skipping");
            return Ok(AppOutcome::Unchanged);
        }

        let known = self.db.existing_review_ids(app_id, mp).await?;
        info!(
            mode = %decision.mode,
            reason = decision.reason,
            remote,
            known = known.len(),
            locales = locales.len(),
            "harvesting"
        );

        let result = LocaleQuotaAllocator::new(&mut self.source, &self.db, self.budget)
            .harvest(app_id, &locales, &known, decision.mode)
            .await;
        match result {
            Ok(report) => {
                let limited = report.limited();
                self.state
                    .record_success_limited(
                        app_id,
                        mp,
                        remote,
                        report.collected as i64,
                        limited.then_some(LIMITED_BY_BUDGET),
                    )
                    .await?;
                info!(
                    collected = report.collected,
                    pass2 = report.collected_in_pass2,
                    hit_existing = report.hit_existing,
                    limited,
                    "app harvested"
                );
                Ok(AppOutcome::Collected {
                    mode: decision.mode,
                    collected: report.collected,
                    limited,
                })
            }
            Err(HarvestError::Source { source, collected }) => self.fail(app_id, &source, collected).await,
            Err(HarvestError::Store(e)) => Err(e),
        }
    }

    /// Records the failure and applies escalation. The remote count is not recorded, so an
    /// interrupted run is picked up again next cycle instead of reading as unchanged. When
    /// part of the new head was already stored, the next run pages past it.
    async fn fail(&self, app_id: &str, err: &SourceError, collected: u64) -> Result<AppOutcome> {
        let mp = self.source.marketplace();
        let code = err.code();
        let detail = err.to_string();
        let failures = self
            .state
            .record_failure(app_id, mp, None, code, Some(&detail))
            .await?;
        if collected > 0 && self.state.mark_resume_pending(app_id, mp).await? {
            debug!(collected, "partial head stored; next run resumes past it");
        }
        let excluded = self
            .governance
            .escalate(app_id, mp, code, failures, Some(&detail))
            .await?;
        warn!(code = %code, failures, collected, excluded, error = %err, "app harvest failed");
        Ok(AppOutcome::Failed {
            code,
            consecutive_failures: failures,
            collected,
            excluded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::ReviewRecord;
    use crate::locale::LocalePair;
    use crate::source::{PageCursor, ReviewPage};
    use crate::transport::ErrorKind;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};

    const MP: Marketplace = Marketplace::AppStore;
    const PAGE: usize = 4;

    /// One listing per app, served identically for every locale.
    #[derive(Default)]
    struct ScriptedSource {
        counts: HashMap<String, i64>,
        listings: HashMap<String, Vec<String>>,
        missing: HashSet<String>,
        count_errors: HashSet<String>,
        /// App whose listing fails on this page number.
        page_errors: HashMap<String, u32>,
        /// Apps listed only in this storefront country.
        storefronts: HashMap<String, String>,
    }

    impl ScriptedSource {
        fn app(mut self, app: &str, ids: Vec<String>) -> Self {
            self.counts.insert(app.into(), ids.len() as i64);
            self.listings.insert(app.into(), ids);
            self
        }

        fn prepend(&mut self, app: &str, fresh: &[&str]) {
            let list = self.listings.entry(app.into()).or_default();
            let mut next: Vec<String> = fresh.iter().map(|s| s.to_string()).collect();
            next.append(list);
            self.counts.insert(app.into(), next.len() as i64);
            *list = next;
        }
    }

    #[async_trait]
    impl ReviewSource for ScriptedSource {
        fn marketplace(&self) -> Marketplace {
            MP
        }

        async fn remote_count(&mut self, app_id: &str, locales: &[LocalePair]) -> Result<i64, SourceError> {
            if self.missing.contains(app_id) {
                return Err(SourceError::NotFound);
            }
            if let Some(country) = self.storefronts.get(app_id) {
                if !locales.iter().any(|l| &l.country == country) {
                    return Err(SourceError::NotFound);
                }
            }
            if self.count_errors.contains(app_id) {
                return Err(SourceError::Transport {
                    kind: ErrorKind::ServerError,
                    detail: "HTTP 503".into(),
                });
            }
            Ok(self.counts.get(app_id).copied().unwrap_or(0))
        }

        async fn fetch_page(
            &mut self,
            app_id: &str,
            _locale: &LocalePair,
            cursor: Option<&PageCursor>,
        ) -> Result<ReviewPage, SourceError> {
            let page = match cursor {
                Some(PageCursor::Page(n)) => *n,
                _ => 1,
            };
            if self.page_errors.get(app_id) == Some(&page) {
                return Err(SourceError::Transport {
                    kind: ErrorKind::IpBlocked,
                    detail: "no address available".into(),
                });
            }
            let ids = self.listings.get(app_id).cloned().unwrap_or_default();
            let start = (page as usize - 1) * PAGE;
            let reviews = ids
                .iter()
                .skip(start)
                .take(PAGE)
                .map(|id| ReviewRecord::new(app_id, MP, id.clone()))
                .collect();
            let next = (start + PAGE < ids.len()).then(|| PageCursor::Page(page + 1));
            Ok(ReviewPage { reviews, next })
        }
    }

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    fn apps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn harvester(source: ScriptedSource, budget: u64, max_failures: i64) -> (Harvester<ScriptedSource>, Db) {
        let db = Db::in_memory().await.unwrap();
        (Harvester::new(source, db.clone(), budget, max_failures), db)
    }

    #[tokio::test]
    async fn first_run_collects_then_unchanged_count_skips() {
        let (mut h, db) = harvester(ScriptedSource::default().app("a", ids("r", 10)), 100, 5).await;
        let s = h.run_batch(&apps(&["a"])).await.unwrap();
        assert_eq!(
            s,
            BatchSummary {
                processed: 1,
                skipped: 0,
                failed: 0,
                reviews_collected: 10
            }
        );
        let rec = db.get_status("a", MP).await.unwrap().unwrap();
        assert!(rec.initial_done);
        assert_eq!((rec.collected_count, rec.last_known_remote_count), (10, Some(10)));
        assert_eq!(db.review_count("a", MP).await.unwrap(), 10);

        let s = h.run_batch(&apps(&["a"])).await.unwrap();
        assert_eq!((s.processed, s.skipped, s.reviews_collected), (0, 1, 0));
    }

    #[tokio::test]
    async fn changed_count_collects_only_the_new_head() {
        let (mut h, db) = harvester(ScriptedSource::default().app("a", ids("old", 9)), 100, 5).await;
        h.run_batch(&apps(&["a"])).await.unwrap();

        h.source.prepend("a", &["new1", "new0"]);
        let out = h.harvest_app("a").await.unwrap();
        assert_eq!(
            out,
            AppOutcome::Collected {
                mode: CollectionMode::Incremental,
                collected: 2,
                limited: false
            }
        );
        let rec = db.get_status("a", MP).await.unwrap().unwrap();
        assert_eq!((rec.collected_count, rec.last_known_remote_count), (11, Some(11)));
    }

    #[tokio::test]
    async fn budget_cut_is_recorded_as_limited() {
        let (mut h, db) = harvester(ScriptedSource::default().app("big", ids("r", 30)), 10, 5).await;
        let out = h.harvest_app("big").await.unwrap();
        assert!(matches!(out, AppOutcome::Collected { collected: 10, limited: true, .. }));
        let rec = db.get_status("big", MP).await.unwrap().unwrap();
        assert!(rec.collection_limited);
        assert_eq!(rec.collection_limited_reason.as_deref(), Some(LIMITED_BY_BUDGET));
    }

    #[tokio::test]
    async fn missing_app_is_excluded_at_once() {
        let mut source = ScriptedSource::default().app("ok", ids("r", 3));
        source.missing.insert("gone".into());
        let (mut h, db) = harvester(source, 100, 5).await;

        let s = h.run_batch(&apps(&["gone", "ok"])).await.unwrap();
        assert_eq!((s.processed, s.failed, s.reviews_collected), (1, 1, 3));
        assert_eq!(
            db.permanent_failure_reason("gone", MP).await.unwrap().as_deref(),
            Some("NOT_FOUND")
        );
        let out = h.harvest_app("gone").await.unwrap();
        assert_eq!(out, AppOutcome::Excluded(Exclusion::Permanent("NOT_FOUND".into())));
    }

    #[tokio::test]
    async fn repeated_transport_failures_reach_the_threshold() {
        let mut source = ScriptedSource::default();
        source.count_errors.insert("flaky".into());
        let (mut h, db) = harvester(source, 100, 2).await;

        let first = h.harvest_app("flaky").await.unwrap();
        assert!(matches!(first, AppOutcome::Failed { consecutive_failures: 1, excluded: false, .. }));
        let second = h.harvest_app("flaky").await.unwrap();
        assert!(matches!(second, AppOutcome::Failed { consecutive_failures: 2, excluded: true, .. }));
        let rec = db.get_status("flaky", MP).await.unwrap().unwrap();
        assert_eq!(rec.last_error_code.as_deref(), Some("SERVER_ERROR"));
        assert!(matches!(h.harvest_app("flaky").await.unwrap(), AppOutcome::Excluded(_)));
    }

    #[tokio::test]
    async fn interrupted_harvest_keeps_reviews_and_retries_next_cycle() {
        let mut source = ScriptedSource::default().app("a", ids("r", 10));
        source.page_errors.insert("a".into(), 2);
        let (mut h, db) = harvester(source, 100, 5).await;

        let out = h.harvest_app("a").await.unwrap();
        assert_eq!(
            out,
            AppOutcome::Failed {
                code: FailureCode::Transport(ErrorKind::IpBlocked),
                consecutive_failures: 1,
                collected: 4,
                excluded: false
            }
        );
        assert_eq!(db.review_count("a", MP).await.unwrap(), 4);
        let rec = db.get_status("a", MP).await.unwrap().unwrap();
        assert_eq!(rec.last_known_remote_count, None);

        h.source.page_errors.clear();
        let out = h.harvest_app("a").await.unwrap();
        assert_eq!(
            out,
            AppOutcome::Collected {
                mode: CollectionMode::Initial,
                collected: 6,
                limited: false
            }
        );
        let rec = db.get_status("a", MP).await.unwrap().unwrap();
        assert_eq!(rec.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn interrupted_incremental_run_resumes_past_the_stored_head() {
        let (mut h, db) = harvester(ScriptedSource::default().app("a", ids("old", 9)), 100, 5).await;
        h.harvest_app("a").await.unwrap();

        let fresh = ids("new", 10);
        let fresh: Vec<&str> = fresh.iter().map(String::as_str).collect();
        h.source.prepend("a", &fresh);
        h.source.page_errors.insert("a".into(), 2);
        let out = h.harvest_app("a").await.unwrap();
        assert!(matches!(out, AppOutcome::Failed { collected: 4, excluded: false, .. }));
        assert!(db.get_status("a", MP).await.unwrap().unwrap().resume_pending);

        h.source.page_errors.clear();
        let out = h.harvest_app("a").await.unwrap();
        assert_eq!(
            out,
            AppOutcome::Collected {
                mode: CollectionMode::Initial,
                collected: 6,
                limited: false
            }
        );
        assert_eq!(db.review_count("a", MP).await.unwrap(), 19);
        let rec = db.get_status("a", MP).await.unwrap().unwrap();
        assert!(!rec.resume_pending);
        assert_eq!(rec.last_known_remote_count, Some(19));

        assert_eq!(h.harvest_app("a").await.unwrap(), AppOutcome::Unchanged);
    }

    #[tokio::test]
    async fn incremental_failure_before_any_insert_stays_incremental() {
        let (mut h, db) = harvester(ScriptedSource::default().app("a", ids("old", 9)), 100, 5).await;
        h.harvest_app("a").await.unwrap();
        h.source.prepend("a", &["new0"]);
        h.source.page_errors.insert("a".into(), 1);
        let out = h.harvest_app("a").await.unwrap();
        assert!(matches!(out, AppOutcome::Failed { collected: 0, .. }));
        assert!(!db.get_status("a", MP).await.unwrap().unwrap().resume_pending);

        h.source.page_errors.clear();
        let out = h.harvest_app("a").await.unwrap();
        assert!(matches!(out, AppOutcome::Collected { mode: CollectionMode::Incremental, collected: 1, .. }));
    }

    #[tokio::test]
    async fn app_outside_the_default_storefront_is_not_excluded() {
        let mut source = ScriptedSource::default().app("kronly", ids("r", 3));
        source.storefronts.insert("kronly".into(), "KR".into());
        let (mut h, db) = harvester(source, 100, 5).await;
        db.record_locales("kronly", MP, &[LocalePair::new("ko", "KR")])
            .await
            .unwrap();

        let out = h.harvest_app("kronly").await.unwrap();
        assert!(matches!(out, AppOutcome::Collected { collected: 3, .. }));
        assert_eq!(db.permanent_failure_reason("kronly", MP).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreachable_store_aborts_the_batch() {
        let (mut h, db) = harvester(ScriptedSource::default().app("a", ids("r", 3)), 100, 5).await;
        db.pool.close().await;
        let err = h.run_batch(&apps(&["a", "b"])).await.unwrap_err();
        assert!(is_store_unavailable(&err));
    }
}
