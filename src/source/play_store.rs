use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use url::form_urlencoded::byte_serialize;

use super::{json_body, non_empty, parse_timestamp, PageCursor, ReviewPage, ReviewSource, SourceError};
use crate::database_ops::ReviewRecord;
use crate::locale::LocalePair;
use crate::marketplace::Marketplace;
use crate::transport::{Fetcher, Transport};

const MP: Marketplace = Marketplace::PlayStore;

/// URL templates for the Play review gateway. Placeholders: `{app_id}`, `{lang}`,
/// `{country}`, `{count}`, `{token}`.
#[derive(Debug, Clone)]
pub struct PlayEndpoints {
    pub reviews_url: String,
    pub details_url: String,
}

impl Default for PlayEndpoints {
    fn default() -> Self {
        Self {
            reviews_url: "http://127.0.0.1:8700/reviews?app_id={app_id}&hl={lang}&gl={country}&count={count}&token={token}".into(),
            details_url: "http://127.0.0.1:8700/details?app_id={app_id}&hl={lang}&gl={country}".into(),
        }
    }
}

impl PlayEndpoints {
    /// Still pointing at the local gateway defaults, which only work if one is running.
    pub fn is_default(&self) -> bool {
        let d = Self::default();
        self.reviews_url == d.reviews_url && self.details_url == d.details_url
    }
}

fn enc(s: &str) -> String {
    byte_serialize(s.as_bytes()).collect()
}

fn fill(template: &str, app_id: &str, locale: &LocalePair, count: u32, token: Option<&str>) -> String {
    template
        .replace("{app_id}", &enc(app_id))
        .replace("{lang}", &enc(&locale.language))
        .replace("{country}", &enc(&locale.country.to_ascii_lowercase()))
        .replace("{count}", &count.to_string())
        .replace("{token}", &enc(token.unwrap_or("")))
}

/// Continuation-token review listing.
pub struct PlayStoreSource<F: Fetcher> {
    transport: Transport<F>,
    endpoints: PlayEndpoints,
}

impl<F: Fetcher> PlayStoreSource<F> {
    pub fn new(transport: Transport<F>, endpoints: PlayEndpoints) -> Self {
        Self {
            transport,
            endpoints,
        }
    }

    pub fn transport(&self) -> &Transport<F> {
        &self.transport
    }
}

fn str_field<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(|x| x.as_str())
}

pub fn parse_reviews(app_id: &str, locale: &LocalePair, body: &Value) -> ReviewPage {
    let reviews = body
        .get("reviews")
        .and_then(|r| r.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|item| {
                    let id = str_field(item, "reviewId")?;
                    let mut r = ReviewRecord::new(app_id, MP, id);
                    r.language = Some(locale.language.clone());
                    r.country = Some(locale.country.clone());
                    r.rating = item.get("score").and_then(|s| s.as_i64());
                    r.content = non_empty(str_field(item, "content"));
                    r.user_name = non_empty(str_field(item, "userName"));
                    r.thumbs_up = item.get("thumbsUpCount").and_then(|t| t.as_i64());
                    r.app_version = non_empty(str_field(item, "reviewCreatedVersion"));
                    r.reviewed_at = item.get("at").and_then(parse_timestamp);
                    r.reply_content = non_empty(str_field(item, "replyContent"));
                    r.replied_at = item.get("repliedAt").and_then(parse_timestamp);
                    Some(r)
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let next = non_empty(str_field(body, "nextToken"))
        .filter(|_| !reviews.is_empty())
        .map(PageCursor::Token);
    ReviewPage { reviews, next }
}

#[async_trait]
impl<F: Fetcher> ReviewSource for PlayStoreSource<F> {
    fn marketplace(&self) -> Marketplace {
        MP
    }

    async fn remote_count(&mut self, app_id: &str, locales: &[LocalePair]) -> Result<i64, SourceError> {
        let fallback = LocalePair::fallback(MP);
        let locale = locales.first().unwrap_or(&fallback);
        let url = fill(&self.endpoints.details_url, app_id, locale, 0, None);
        let body = json_body(self.transport.request(&url, MP, true).await)?;
        ["reviews", "ratings"]
            .iter()
            .find_map(|k| body.get(*k).and_then(|v| v.as_i64()))
            .ok_or_else(|| SourceError::malformed("details without reviews/ratings count"))
    }

    async fn fetch_page(
        &mut self,
        app_id: &str,
        locale: &LocalePair,
        cursor: Option<&PageCursor>,
    ) -> Result<ReviewPage, SourceError> {
        let token = match cursor {
            None => None,
            Some(PageCursor::Token(t)) => Some(t.as_str()),
            Some(PageCursor::Page(n)) => {
                return Err(SourceError::malformed(format!("unexpected page cursor {n}")))
            }
        };
        let url = fill(
            &self.endpoints.reviews_url,
            app_id,
            locale,
            MP.profile().page_size,
            token,
        );
        let body = json_body(self.transport.request(&url, MP, true).await)?;
        let page = parse_reviews(app_id, locale, &body);
        debug!(app_id, locale = %locale, count = page.reviews.len(), more = page.next.is_some(), "play page");
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_pool::AddressPool;
    use crate::transport::fetch::testing::FnFetcher;
    use crate::transport::{RawResponse, TransportConfig};
    use serde_json::json;
    use std::time::Duration;

    fn source(fetcher: FnFetcher) -> PlayStoreSource<FnFetcher> {
        let pool = AddressPool::new(Duration::from_secs(1));
        PlayStoreSource::new(
            Transport::new(fetcher, pool, TransportConfig::default()),
            PlayEndpoints::default(),
        )
    }

    #[test]
    fn template_fill_encodes_values() {
        let url = fill(
            "https://gw/r?id={app_id}&hl={lang}&gl={country}&n={count}&t={token}",
            "com.example.app",
            &LocalePair::new("pt", "BR"),
            100,
            Some("a b/c"),
        );
        assert_eq!(url, "https://gw/r?id=com.example.app&hl=pt&gl=br&n=100&t=a+b%2Fc");
    }

    #[test]
    fn maps_review_fields_and_token() {
        let body = json!({
            "reviews": [
                {"reviewId": "gp:1", "userName": "lee", "score": 2, "content": "meh",
                 "thumbsUpCount": 7, "reviewCreatedVersion": "1.0.3",
                 "at": "2024-02-01T10:00:00", "replyContent": "thanks", "repliedAt": "2024-02-02 09:00:00"},
                {"userName": "no id"}
            ],
            "nextToken": "tok-2"
        });
        let page = parse_reviews("com.x", &LocalePair::new("ko", "KR"), &body);
        assert_eq!(page.reviews.len(), 1);
        let r = &page.reviews[0];
        assert_eq!(r.review_id, "gp:1");
        assert_eq!((r.rating, r.thumbs_up), (Some(2), Some(7)));
        assert_eq!(r.reply_content.as_deref(), Some("thanks"));
        assert!(r.replied_at.is_some());
        assert_eq!(page.next, Some(PageCursor::Token("tok-2".into())));
    }

    #[test]
    fn empty_page_ends_listing_even_with_token() {
        let page = parse_reviews("x", &LocalePair::new("en", "US"), &json!({"reviews": [], "nextToken": "t"}));
        assert!(page.next.is_none());
    }

    #[tokio::test]
    async fn follows_continuation_tokens() {
        let fetcher = FnFetcher::new(|url, _, _| {
            let body = if url.contains("token=&") || url.ends_with("token=") {
                json!({"reviews": [{"reviewId": "1", "score": 5}], "nextToken": "next"})
            } else {
                json!({"reviews": [{"reviewId": "2", "score": 4}]})
            };
            Ok(RawResponse::new(200, body.to_string()))
        });
        let mut s = source(fetcher);
        let l = LocalePair::new("en", "US");
        let p1 = s.fetch_page("com.x", &l, None).await.unwrap();
        let p2 = s.fetch_page("com.x", &l, p1.next.as_ref()).await.unwrap();
        assert_eq!(p2.reviews[0].review_id, "2");
        assert!(p2.next.is_none());
        let calls = s.transport().fetcher().call_log();
        assert!(calls[1].0.ends_with("token=next"));
    }

    #[test]
    fn configured_gateway_is_not_default() {
        let mut e = PlayEndpoints::default();
        assert!(e.is_default());
        e.reviews_url = "https://gw.internal/reviews?app_id={app_id}".into();
        assert!(!e.is_default());
    }

    #[tokio::test]
    async fn details_count_and_missing_app() {
        let fetcher = FnFetcher::new(|url, _, _| {
            if url.contains("app_id=gone") {
                Ok(RawResponse::new(404, "not found"))
            } else {
                Ok(RawResponse::new(200, json!({"ratings": 9000, "reviews": 812}).to_string()))
            }
        });
        let mut s = source(fetcher);
        assert_eq!(s.remote_count("com.x", &[]).await.unwrap(), 812);
        assert!(matches!(s.remote_count("gone", &[]).await, Err(SourceError::NotFound)));
    }
}
