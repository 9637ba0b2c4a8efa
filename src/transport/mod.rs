//! HTTP transport bound to rotating source addresses, with failure classification and
//! per-kind retry.
pub mod classify;
pub mod fetch;

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::address_pool::AddressPool;
use crate::marketplace::Marketplace;

pub use classify::{classify_status, Attempts, ErrorKind, RetryAction, RetryPolicy};
pub use fetch::{FetchError, Fetcher, RawResponse, ReqwestFetcher};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub rotation: bool,
    pub timeout: Duration,
    /// Address this process is pinned to; used when the pool has nothing for a marketplace.
    pub bound_address: Option<Ipv4Addr>,
    pub policy: RetryPolicy,
    /// Consecutive network failures on one address, while a sibling succeeds, that count as a block.
    pub block_after_network_failures: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            rotation: true,
            timeout: Duration::from_secs(30),
            bound_address: None,
            policy: RetryPolicy::default(),
            block_after_network_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            Payload::Text(_) => None,
        }
    }
}

/// Result of one logical request, after retries.
#[derive(Debug, Clone)]
pub struct HttpOutcome {
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub status: Option<u16>,
    pub data: Option<Payload>,
    /// Source address of the final attempt; `None` when the OS picked it.
    pub used_address: Option<Ipv4Addr>,
    pub detail: Option<String>,
    pub attempts: u32,
}

impl HttpOutcome {
    fn failed(failure: Failure, used_address: Option<Ipv4Addr>, attempts: u32) -> Self {
        Self {
            success: false,
            error_kind: Some(failure.kind),
            status: failure.status,
            data: None,
            used_address,
            detail: Some(failure.detail),
            attempts,
        }
    }
}

#[derive(Debug)]
struct Failure {
    kind: ErrorKind,
    status: Option<u16>,
    detail: String,
    retry_after: Option<u64>,
}

enum Selection {
    Bound(Ipv4Addr),
    /// Pool has no working address for the marketplace.
    Fallback(Option<Ipv4Addr>),
    /// Working addresses exist but all are marked failed.
    Exhausted,
}

#[derive(Debug, Default, Clone, Copy)]
struct AddressHealth {
    consecutive_network_failures: u32,
    successes: u64,
}

pub struct Transport<F: Fetcher> {
    fetcher: F,
    pool: AddressPool,
    config: TransportConfig,
    failed: HashMap<Marketplace, HashSet<Ipv4Addr>>,
    health: HashMap<(Marketplace, Ipv4Addr), AddressHealth>,
}

impl<F: Fetcher> Transport<F> {
    pub fn new(fetcher: F, pool: AddressPool, config: TransportConfig) -> Self {
        Self {
            fetcher,
            pool,
            config,
            failed: HashMap::new(),
            health: HashMap::new(),
        }
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn set_rotation(&mut self, enabled: bool) {
        self.config.rotation = enabled;
        if !enabled {
            self.pool.reset_rotation(None);
        }
    }

    pub fn failed_addresses(&self, marketplace: Marketplace) -> Vec<Ipv4Addr> {
        let mut v: Vec<_> = self
            .failed
            .get(&marketplace)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        v.sort();
        v
    }

    pub fn reset_failed(&mut self, marketplace: Option<Marketplace>) {
        match marketplace {
            Some(mp) => {
                self.failed.remove(&mp);
                self.health.retain(|(m, _), _| *m != mp);
            }
            None => {
                self.failed.clear();
                self.health.clear();
            }
        }
    }

    fn select(&mut self, marketplace: Marketplace) -> Selection {
        if !self.pool.has_working(marketplace) {
            return Selection::Fallback(self.config.bound_address);
        }
        let empty = HashSet::new();
        let exclude = self.failed.get(&marketplace).unwrap_or(&empty);
        let picked = if self.config.rotation {
            self.pool.next(marketplace, exclude)
        } else {
            self.pool.first(marketplace, exclude)
        };
        picked.map(Selection::Bound).unwrap_or(Selection::Exhausted)
    }

    /// GET `url` for `marketplace`, retrying per the policy. Never panics on remote input;
    /// every failure ends up classified on the returned outcome.
    pub async fn request(&mut self, url: &str, marketplace: Marketplace, parse_json: bool) -> HttpOutcome {
        let mut attempts = Attempts::default();
        let mut address = match self.select(marketplace) {
            Selection::Bound(a) => Some(a),
            Selection::Fallback(a) => a,
            Selection::Exhausted => return no_address(None, 0),
        };

        loop {
            let failure = match self.attempt(url, marketplace, address, parse_json).await {
                Ok((status, payload)) => {
                    return HttpOutcome {
                        success: true,
                        error_kind: None,
                        status: Some(status),
                        data: Some(payload),
                        used_address: address,
                        detail: None,
                        attempts: attempts.total() + 1,
                    }
                }
                Err(f) => f,
            };

            let action = self.config.policy.decide(failure.kind, &attempts);
            debug!(
                marketplace = %marketplace,
                address = ?address,
                kind = %failure.kind,
                status = ?failure.status,
                ?action,
                "request attempt failed"
            );
            match action {
                RetryAction::GiveUp => {
                    warn!(
                        marketplace = %marketplace,
                        address = ?address,
                        kind = %failure.kind,
                        detail = %failure.detail,
                        "request failed"
                    );
                    return HttpOutcome::failed(failure, address, attempts.total() + 1);
                }
                RetryAction::Wait(base) => {
                    let wait = match (failure.kind, failure.retry_after) {
                        (ErrorKind::RateLimited, Some(secs)) => base.max(Duration::from_secs(secs)),
                        _ => base,
                    };
                    warn!(
                        marketplace = %marketplace,
                        kind = %failure.kind,
                        wait_secs = wait.as_secs(),
                        "backing off before retry"
                    );
                    tokio::time::sleep(wait).await;
                }
                RetryAction::SwapAddress => {
                    if let Some(a) = address {
                        self.failed.entry(marketplace).or_default().insert(a);
                    }
                    address = match self.select(marketplace) {
                        Selection::Bound(a) => Some(a),
                        Selection::Fallback(_) => {
                            // pinned or default route: there is nothing to swap to
                            warn!(
                                marketplace = %marketplace,
                                address = ?address,
                                detail = %failure.detail,
                                "blocked with no pool to swap from"
                            );
                            return HttpOutcome::failed(failure, address, attempts.total() + 1);
                        }
                        Selection::Exhausted => {
                            return no_address(address, attempts.total() + 1);
                        }
                    };
                    warn!(marketplace = %marketplace, next = ?address, "address blocked; swapping");
                }
            }
            attempts.bump(failure.kind);
        }
    }

    async fn attempt(
        &mut self,
        url: &str,
        marketplace: Marketplace,
        address: Option<Ipv4Addr>,
        parse_json: bool,
    ) -> Result<(u16, Payload), Failure> {
        let resp = match self.fetcher.get(url, address, self.config.timeout).await {
            Ok(r) => r,
            Err(e) => {
                let kind = self.note_network_failure(marketplace, address);
                return Err(Failure {
                    kind,
                    status: None,
                    detail: e.to_string(),
                    retry_after: None,
                });
            }
        };

        if let Some(kind) = classify_status(resp.status, &resp.body) {
            return Err(Failure {
                kind,
                status: Some(resp.status),
                detail: format!("HTTP {}", resp.status),
                retry_after: resp.retry_after,
            });
        }
        self.note_success(marketplace, address);

        if !parse_json {
            return Ok((resp.status, Payload::Text(resp.body)));
        }
        match serde_json::from_str::<Value>(&resp.body) {
            Ok(v) => Ok((resp.status, Payload::Json(v))),
            Err(e) => Err(Failure {
                kind: ErrorKind::UnknownError,
                status: Some(resp.status),
                detail: format!("invalid json: {e}"),
                retry_after: None,
            }),
        }
    }

    fn note_success(&mut self, marketplace: Marketplace, address: Option<Ipv4Addr>) {
        if let Some(a) = address {
            let h = self.health.entry((marketplace, a)).or_default();
            h.consecutive_network_failures = 0;
            h.successes += 1;
        }
    }

    /// One address failing repeatedly while a sibling keeps working is treated as a block.
    fn note_network_failure(&mut self, marketplace: Marketplace, address: Option<Ipv4Addr>) -> ErrorKind {
        let Some(a) = address else {
            return ErrorKind::NetworkError;
        };
        let failures = {
            let h = self.health.entry((marketplace, a)).or_default();
            h.consecutive_network_failures += 1;
            h.consecutive_network_failures
        };
        let sibling_ok = self
            .health
            .iter()
            .any(|((m, other), h)| *m == marketplace && *other != a && h.successes > 0);
        if failures >= self.config.block_after_network_failures && sibling_ok {
            ErrorKind::IpBlocked
        } else {
            ErrorKind::NetworkError
        }
    }
}

fn no_address(last: Option<Ipv4Addr>, attempts: u32) -> HttpOutcome {
    HttpOutcome::failed(
        Failure {
            kind: ErrorKind::IpBlocked,
            status: None,
            detail: "no address available".into(),
            retry_after: None,
        },
        last,
        attempts,
    )
}
