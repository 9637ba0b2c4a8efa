use async_trait::async_trait;
use reqwest::{header, Client};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Status, body and throttle hint of one completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    /// Parsed `Retry-After` seconds, when the server sent one.
    pub retry_after: Option<u64>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            retry_after: None,
        }
    }
}

/// Failures below the HTTP layer. All of them classify as network errors.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Other(String),
}

/// A single GET bound to an optional local source address.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn get(
        &self,
        url: &str,
        bind: Option<Ipv4Addr>,
        timeout: Duration,
    ) -> Result<RawResponse, FetchError>;
}

/// reqwest-backed fetcher. One client per source address, built lazily and reused so
/// connection pools stay warm across requests.
pub struct ReqwestFetcher {
    clients: Mutex<HashMap<Option<Ipv4Addr>, Client>>,
}

impl ReqwestFetcher {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, bind: Option<Ipv4Addr>) -> Result<Client, FetchError> {
        let mut clients = self
            .clients
            .lock()
            .map_err(|_| FetchError::Other("client cache poisoned".into()))?;
        if let Some(c) = clients.get(&bind) {
            return Ok(c.clone());
        }
        let client = Client::builder()
            .local_address(bind.map(IpAddr::V4))
            .user_agent(BROWSER_USER_AGENT)
            .build()
            .map_err(|e| FetchError::Other(format!("client build failed: {e}")))?;
        clients.insert(bind, client.clone());
        Ok(client)
    }
}

impl Default for ReqwestFetcher {
    fn default() -> Self {
        Self::new()
    }
}

fn map_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(e.to_string())
    } else if e.is_connect() {
        FetchError::Connect(e.to_string())
    } else {
        FetchError::Other(e.to_string())
    }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
    async fn get(
        &self,
        url: &str,
        bind: Option<Ipv4Addr>,
        timeout: Duration,
    ) -> Result<RawResponse, FetchError> {
        let client = self.client_for(bind)?;
        let resp = client
            .get(url)
            .header(header::ACCEPT, "application/json, text/html;q=0.9, */*;q=0.8")
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = resp.status().as_u16();
        let retry_after = resp
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        let body = resp.text().await.map_err(map_reqwest_error)?;
        Ok(RawResponse {
            status,
            body,
            retry_after,
        })
    }
}
