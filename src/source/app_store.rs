use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{json_body, non_empty, parse_timestamp, PageCursor, ReviewPage, ReviewSource, SourceError};
use crate::database_ops::ReviewRecord;
use crate::locale::LocalePair;
use crate::marketplace::Marketplace;
use crate::transport::{Fetcher, Transport};

const MP: Marketplace = Marketplace::AppStore;

pub fn reviews_url(country: &str, page: u32, app_id: &str) -> String {
    format!(
        "https://itunes.apple.com/{}/rss/customerreviews/page={}/id={}/sortBy=mostRecent/json",
        country.to_ascii_lowercase(),
        page,
        app_id
    )
}

pub fn lookup_url(app_id: &str, country: &str) -> String {
    format!(
        "https://itunes.apple.com/lookup?id={}&country={}",
        app_id,
        country.to_ascii_lowercase()
    )
}

/// Customer-review RSS feed (JSON flavour) plus the lookup API for rating counts.
pub struct AppStoreSource<F: Fetcher> {
    transport: Transport<F>,
}

impl<F: Fetcher> AppStoreSource<F> {
    pub fn new(transport: Transport<F>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Transport<F> {
        &self.transport
    }
}

/// Distinct lookup countries: the app's own, in order, then the marketplace default.
pub fn lookup_countries(locales: &[LocalePair]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let fallback = MP.profile().fallback_country;
    for country in locales.iter().map(|l| l.country.as_str()).chain([fallback]) {
        if !out.iter().any(|c| c.eq_ignore_ascii_case(country)) {
            out.push(country.to_ascii_uppercase());
        }
    }
    out
}

fn label<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key)?.get("label")?.as_str()
}

/// Feed entries: a list, or a bare object when the feed holds one entry. Entries without
/// a rating describe the app itself and are dropped.
pub fn parse_feed(app_id: &str, locale: &LocalePair, body: &Value) -> Vec<ReviewRecord> {
    let entries: Vec<&Value> = match body.get("feed").and_then(|f| f.get("entry")) {
        Some(Value::Array(list)) => list.iter().collect(),
        Some(obj @ Value::Object(_)) => vec![obj],
        _ => Vec::new(),
    };
    entries
        .into_iter()
        .filter_map(|e| {
            let rating = label(e, "im:rating")?.trim().parse::<i64>().ok()?;
            let id = label(e, "id")?;
            let mut r = ReviewRecord::new(app_id, MP, id);
            r.rating = Some(rating);
            r.language = Some(locale.language.clone());
            r.country = Some(locale.country.clone());
            r.title = non_empty(label(e, "title"));
            r.content = non_empty(label(e, "content"));
            r.user_name = non_empty(e.get("author").and_then(|a| label(a, "name")));
            r.app_version = non_empty(label(e, "im:version"));
            r.thumbs_up = label(e, "im:voteCount").and_then(|s| s.trim().parse().ok());
            r.reviewed_at = e
                .get("updated")
                .and_then(|u| u.get("label"))
                .and_then(parse_timestamp);
            Some(r)
        })
        .collect()
}

#[async_trait]
impl<F: Fetcher> ReviewSource for AppStoreSource<F> {
    fn marketplace(&self) -> Marketplace {
        MP
    }

    /// Storefronts are tried in locale order, then the default one. The app is only
    /// NOT_FOUND once every storefront returns an empty lookup.
    async fn remote_count(&mut self, app_id: &str, locales: &[LocalePair]) -> Result<i64, SourceError> {
        for country in lookup_countries(locales) {
            let url = lookup_url(app_id, &country);
            let body = json_body(self.transport.request(&url, MP, true).await)?;
            let first = body
                .get("results")
                .and_then(|r| r.as_array())
                .and_then(|r| r.first());
            match first {
                Some(app) => {
                    return Ok(app
                        .get("userRatingCount")
                        .and_then(|c| c.as_i64())
                        .unwrap_or(0))
                }
                None => debug!(app_id, country = %country, "not listed in storefront"),
            }
        }
        Err(SourceError::NotFound)
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
            Some(PageCursor::Token(t)) => {
                return Err(SourceError::malformed(format!("unexpected token cursor {t}")))
            }
        };
        let max_pages = MP.profile().max_pages.unwrap_or(u32::MAX);
        if page > max_pages {
            return Ok(ReviewPage::default());
        }
        let url = reviews_url(&locale.country, page, app_id);
        let body = json_body(self.transport.request(&url, MP, true).await)?;
        let reviews = parse_feed(app_id, locale, &body);
        debug!(app_id, locale = %locale, page, count = reviews.len(), "rss page");
        let next = (!reviews.is_empty() && page < max_pages).then(|| PageCursor::Page(page + 1));
        Ok(ReviewPage { reviews, next })
    }
}
