//! Budgeted, locale-partitioned review harvesting for one app.
//!
//! Pass 1 gives every locale an even share of the budget. Pass 2 hands whatever pass 1 left
//! unspent to the locales that stopped only because their share ran out. In incremental mode
//! the first already-stored review ends the whole app run: listings are newest first, so
//! everything older is assumed to be stored too.
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

use crate::collection_state::CollectionMode;
use crate::database_ops::ReviewSink;
use crate::locale::LocalePair;
use crate::source::{PageCursor, ReviewSource, SourceError};

#[derive(Debug, Clone, Serialize)]
pub struct LocaleOutcome {
    pub locale: LocalePair,
    pub collected: u64,
    /// Stopped on quota with more reviews available.
    pub has_more: bool,
    pub hit_existing: bool,
    pub pages: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestReport {
    pub collected: u64,
    pub collected_in_pass2: u64,
    pub hit_existing: bool,
    pub locales: Vec<LocaleOutcome>,
}

impl HarvestReport {
    /// Reviews were taken but some locale still had more than the budget allowed.
    pub fn limited(&self) -> bool {
        self.collected > 0 && self.locales.iter().any(|l| l.has_more)
    }
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("source failed after {collected} reviews: {source}")]
    Source { source: SourceError, collected: u64 },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Where a locale's listing stands between passes.
struct LocaleState {
    locale: LocalePair,
    cursor: Option<PageCursor>,
    exhausted: bool,
}

pub struct LocaleQuotaAllocator<'a, S: ReviewSource, K: ReviewSink> {
    source: &'a mut S,
    sink: &'a K,
    budget: u64,
}

/// Even pass-1 share. At least one review per locale; the caller still caps each share
/// by the unspent budget so the total never exceeds it.
pub fn locale_quota(budget: u64, locales: usize) -> u64 {
    if locales == 0 {
        return 0;
    }
    (budget / locales as u64).max(1)
}

/// Splits `remaining` over `n` locales; the first `remaining % n` get one extra.
pub fn redistribute(remaining: u64, n: usize) -> Vec<u64> {
    if n == 0 {
        return Vec::new();
    }
    let base = remaining / n as u64;
    let extra = remaining % n as u64;
    (0..n as u64).map(|k| base + u64::from(k < extra)).collect()
}

impl<'a, S: ReviewSource, K: ReviewSink> LocaleQuotaAllocator<'a, S, K> {
    pub fn new(source: &'a mut S, sink: &'a K, budget: u64) -> Self {
        Self {
            source,
            sink,
            budget,
        }
    }

    pub async fn harvest(
        &mut self,
        app_id: &str,
        locales: &[LocalePair],
        known: &HashSet<String>,
        mode: CollectionMode,
    ) -> Result<HarvestReport, HarvestError> {
        let stop_on_existing = mode == CollectionMode::Incremental;
        let mut seen = known.clone();
        let mut total = 0u64;
        let mut hit_existing = false;
        let mut states: Vec<LocaleState> = locales
            .iter()
            .map(|l| LocaleState {
                locale: l.clone(),
                cursor: None,
                exhausted: false,
            })
            .collect();
        let mut outcomes: Vec<LocaleOutcome> = locales
            .iter()
            .map(|l| LocaleOutcome {
                locale: l.clone(),
                collected: 0,
                has_more: false,
                hit_existing: false,
                pages: 0,
            })
            .collect();

        let quota = locale_quota(self.budget, locales.len());
        for (state, out) in states.iter_mut().zip(outcomes.iter_mut()) {
            let share = quota.min(self.budget - total);
            if share == 0 {
                break;
            }
            self.harvest_locale(app_id, state, out, share, known, &mut seen, stop_on_existing, &mut total)
                .await?;
            if out.hit_existing {
                hit_existing = true;
                break;
            }
        }
        let after_pass1 = total;

        let remaining = self.budget - total;
        let wanting: Vec<usize> = (0..outcomes.len()).filter(|i| outcomes[*i].has_more).collect();
        if remaining > 0 && !wanting.is_empty() && !hit_existing {
            debug!(app_id, remaining, locales = wanting.len(), "redistributing unused budget");
            let shares = redistribute(remaining, wanting.len());
            for (i, extra) in wanting.into_iter().zip(shares) {
                let share = extra.min(self.budget - total);
                if share == 0 {
                    continue;
                }
                let (state, out) = (&mut states[i], &mut outcomes[i]);
                self.harvest_locale(app_id, state, out, share, known, &mut seen, stop_on_existing, &mut total)
                    .await?;
                if out.hit_existing {
                    hit_existing = true;
                    break;
                }
            }
        }

        Ok(HarvestReport {
            collected: total,
            collected_in_pass2: total - after_pass1,
            hit_existing,
            locales: outcomes,
        })
    }

    /// Pages one locale until its share is spent, the listing ends, or (incremental only)
    /// a known review shows up. Each page is stored before the next is fetched.
    #[allow(clippy::too_many_arguments)]
    async fn harvest_locale(
        &mut self,
        app_id: &str,
        state: &mut LocaleState,
        out: &mut LocaleOutcome,
        share: u64,
        known: &HashSet<String>,
        seen: &mut HashSet<String>,
        stop_on_existing: bool,
        total: &mut u64,
    ) -> Result<(), HarvestError> {
        let mut taken = 0u64;
        out.has_more = false;
        while taken < share && !state.exhausted {
            let current = state.cursor.clone();
            let page = match self.source.fetch_page(app_id, &state.locale, current.as_ref()).await {
                Ok(p) => p,
                Err(source) => {
                    return Err(HarvestError::Source {
                        source,
                        collected: *total,
                    })
                }
            };
            out.pages += 1;
            if page.reviews.is_empty() {
                state.exhausted = true;
                break;
            }

            let mut fresh = Vec::new();
            let mut quota_cut = false;
            for r in page.reviews {
                if stop_on_existing && known.contains(&r.review_id) {
                    out.hit_existing = true;
                    break;
                }
                if seen.contains(&r.review_id) {
                    continue;
                }
                if taken + fresh.len() as u64 >= share {
                    quota_cut = true;
                    break;
                }
                seen.insert(r.review_id.clone());
                fresh.push(r);
            }
            if !fresh.is_empty() {
                let stored = self.sink.insert_reviews(&fresh).await?;
                taken += stored;
                *total += stored;
                out.collected += stored;
            }

            if out.hit_existing {
                debug!(app_id, locale = %state.locale, taken, "reached stored review; ending app run");
                state.exhausted = true;
                break;
            }
            if quota_cut {
                // unconsumed reviews remain on this page; resume from it next pass
                state.cursor = current;
                out.has_more = true;
                break;
            }
            match page.next {
                Some(next) => state.cursor = Some(next),
                None => state.exhausted = true,
            }
        }
        if taken >= share && !state.exhausted {
            out.has_more = true;
        }
        debug!(
            app_id,
            locale = %state.locale,
            share,
            taken,
            has_more = out.has_more,
            pages = out.pages,
            "locale harvested"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::ReviewRecord;
    use crate::marketplace::Marketplace;
    use crate::source::ReviewPage;
    use crate::transport::ErrorKind;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FakeSource {
        listings: HashMap<String, Vec<String>>,
        page_size: usize,
        fetches: Vec<(String, u32)>,
        fail_at: Option<(String, u32)>,
    }

    impl FakeSource {
        fn new(page_size: usize, listings: Vec<(&LocalePair, Vec<String>)>) -> Self {
            Self {
                listings: listings
                    .into_iter()
                    .map(|(l, ids)| (l.to_string(), ids))
                    .collect(),
                page_size,
                fetches: Vec::new(),
                fail_at: None,
            }
        }

        fn pages_for(&self, locale: &LocalePair) -> Vec<u32> {
            let key = locale.to_string();
            self.fetches
                .iter()
                .filter(|(k, _)| *k == key)
                .map(|(_, p)| *p)
                .collect()
        }
    }

    #[async_trait]
    impl ReviewSource for FakeSource {
        fn marketplace(&self) -> Marketplace {
            Marketplace::AppStore
        }

        async fn remote_count(&mut self, _app_id: &str, _locales: &[LocalePair]) -> Result<i64, SourceError> {
            Ok(0)
        }

        async fn fetch_page(
            &mut self,
            app_id: &str,
            locale: &LocalePair,
            cursor: Option<&PageCursor>,
        ) -> Result<ReviewPage, SourceError> {
            let page = match cursor {
                None => 1,
                Some(PageCursor::Page(n)) => *n,
                Some(PageCursor::Token(_)) => panic!("token cursor"),
            };
            let key = locale.to_string();
            self.fetches.push((key.clone(), page));
            if self.fail_at.as_ref() == Some(&(key.clone(), page)) {
                return Err(SourceError::Transport {
                    kind: ErrorKind::RateLimited,
                    detail: "throttled".into(),
                });
            }
            let ids = self.listings.get(&key).cloned().unwrap_or_default();
            let start = (page as usize - 1) * self.page_size;
            let reviews = ids
                .iter()
                .skip(start)
                .take(self.page_size)
                .map(|id| ReviewRecord::new(app_id, Marketplace::AppStore, id.clone()))
                .collect();
            let next = (start + self.page_size < ids.len()).then(|| PageCursor::Page(page + 1));
            Ok(ReviewPage { reviews, next })
        }
    }

    #[derive(Default)]
    struct MemorySink {
        rows: Mutex<Vec<ReviewRecord>>,
    }

    impl MemorySink {
        fn ids(&self) -> Vec<String> {
            self.rows.lock().unwrap().iter().map(|r| r.review_id.clone()).collect()
        }
    }

    #[async_trait]
    impl ReviewSink for MemorySink {
        async fn insert_reviews(&self, rows: &[ReviewRecord]) -> anyhow::Result<u64> {
            let mut stored = self.rows.lock().unwrap();
            let mut n = 0;
            for r in rows {
                if !stored.iter().any(|s| s.review_id == r.review_id) {
                    stored.push(r.clone());
                    n += 1;
                }
            }
            Ok(n)
        }
    }

    fn ids(prefix: &str, n: usize) -> Vec<String> {
        (0..n).map(|i| format!("{prefix}{i}")).collect()
    }

    fn loc(l: &str, c: &str) -> LocalePair {
        LocalePair::new(l, c)
    }

    #[test]
    fn quota_and_redistribution_arithmetic() {
        assert_eq!(locale_quota(100, 3), 33);
        assert_eq!(locale_quota(2, 5), 1);
        assert_eq!(locale_quota(50, 0), 0);
        assert_eq!(redistribute(17, 2), vec![9, 8]);
        assert_eq!(redistribute(3, 5), vec![1, 1, 1, 0, 0]);
        assert!(redistribute(10, 0).is_empty());
    }

    #[tokio::test]
    async fn unused_budget_moves_to_locales_that_hit_their_cap() {
        let (l1, l2, l3) = (loc("en", "US"), loc("fr", "FR"), loc("de", "DE"));
        let mut source = FakeSource::new(
            10,
            vec![(&l1, ids("a", 17)), (&l2, ids("b", 60)), (&l3, ids("c", 60))],
        );
        let sink = MemorySink::default();
        let locales = vec![l1.clone(), l2.clone(), l3.clone()];
        let report = LocaleQuotaAllocator::new(&mut source, &sink, 100)
            .harvest("app", &locales, &HashSet::new(), CollectionMode::Initial)
            .await
            .unwrap();

        let per: Vec<u64> = report.locales.iter().map(|l| l.collected).collect();
        assert_eq!(per, vec![17, 33 + 9, 33 + 8]);
        assert_eq!(report.collected, 100);
        assert_eq!(report.collected_in_pass2, 17);
        assert!(!report.locales[0].has_more);
        assert!(report.limited());

        // pass 2 resumes on the page where pass 1 stopped
        assert_eq!(source.pages_for(&l2), vec![1, 2, 3, 4, 4, 5]);
        let stored = sink.ids();
        let unique: HashSet<_> = stored.iter().collect();
        assert_eq!(unique.len(), stored.len());
        assert!(stored.contains(&"b41".to_string()));
        assert!(!stored.contains(&"b42".to_string()));
    }

    #[tokio::test]
    async fn known_review_ends_the_whole_app_run() {
        let (l1, l2) = (loc("en", "US"), loc("ja", "JP"));
        let mut listing = ids("new", 5);
        listing.extend(ids("old", 10));
        let mut source = FakeSource::new(3, vec![(&l1, listing), (&l2, ids("jp", 10))]);
        let sink = MemorySink::default();
        let known: HashSet<String> = ids("old", 10).into_iter().collect();
        let report = LocaleQuotaAllocator::new(&mut source, &sink, 100)
            .harvest("app", &[l1.clone(), l2.clone()], &known, CollectionMode::Incremental)
            .await
            .unwrap();

        assert_eq!(report.collected, 5);
        assert!(report.hit_existing);
        assert_eq!(sink.ids(), ids("new", 5));
        assert_eq!(source.pages_for(&l1), vec![1, 2]);
        assert!(source.pages_for(&l2).is_empty());
        assert_eq!(report.collected_in_pass2, 0);
    }

    #[tokio::test]
    async fn initial_mode_skips_known_reviews_and_keeps_paging() {
        let l1 = loc("en", "US");
        let mut listing = ids("old", 4);
        listing.extend(ids("new", 5));
        let mut source = FakeSource::new(3, vec![(&l1, listing)]);
        let sink = MemorySink::default();
        let known: HashSet<String> = ids("old", 4).into_iter().collect();
        let report = LocaleQuotaAllocator::new(&mut source, &sink, 100)
            .harvest("app", &[l1.clone()], &known, CollectionMode::Initial)
            .await
            .unwrap();
        assert_eq!(report.collected, 5);
        assert!(!report.hit_existing);
        assert_eq!(source.pages_for(&l1), vec![1, 2, 3]);
        assert!(!report.limited());
    }

    #[tokio::test]
    async fn total_never_exceeds_budget() {
        for budget in [0u64, 1, 2, 5, 17, 50, 100] {
            for n in 1..=6usize {
                let locales: Vec<LocalePair> =
                    (0..n).map(|i| loc("en", &format!("C{i}"))).collect();
                let listings = locales
                    .iter()
                    .enumerate()
                    .map(|(i, l)| (l, ids(&format!("{i}-"), 7 * (i + 1))))
                    .collect();
                let mut source = FakeSource::new(4, listings);
                let sink = MemorySink::default();
                let report = LocaleQuotaAllocator::new(&mut source, &sink, budget)
                    .harvest("app", &locales, &HashSet::new(), CollectionMode::Initial)
                    .await
                    .unwrap();
                assert!(report.collected <= budget, "budget {budget} locales {n}");
                assert_eq!(sink.ids().len() as u64, report.collected);
                if budget == 0 {
                    assert!(source.fetches.is_empty());
                }
            }
        }
    }

    #[tokio::test]
    async fn same_review_in_two_locales_is_stored_once() {
        let (l1, l2) = (loc("en", "US"), loc("en", "GB"));
        let mut source = FakeSource::new(
            10,
            vec![
                (&l1, vec!["a".into(), "b".into(), "c".into()]),
                (&l2, vec!["b".into(), "c".into(), "d".into()]),
            ],
        );
        let sink = MemorySink::default();
        let report = LocaleQuotaAllocator::new(&mut source, &sink, 100)
            .harvest("app", &[l1, l2], &HashSet::new(), CollectionMode::Incremental)
            .await
            .unwrap();
        assert_eq!(report.collected, 4);
        assert_eq!(report.locales[1].collected, 1);
        assert!(!report.hit_existing);
    }

    #[tokio::test]
    async fn source_failure_keeps_stored_pages_and_reports_progress() {
        let (l1, l2) = (loc("en", "US"), loc("ko", "KR"));
        let mut source = FakeSource::new(10, vec![(&l1, ids("a", 5)), (&l2, ids("k", 20))]);
        source.fail_at = Some((l2.to_string(), 2));
        let sink = MemorySink::default();
        let err = LocaleQuotaAllocator::new(&mut source, &sink, 100)
            .harvest("app", &[l1, l2], &HashSet::new(), CollectionMode::Initial)
            .await
            .unwrap_err();
        match err {
            HarvestError::Source { source, collected } => {
                assert_eq!(collected, 15);
                assert_eq!(source.code().as_str(), "RATE_LIMITED");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sink.ids().len(), 15);
    }
}
