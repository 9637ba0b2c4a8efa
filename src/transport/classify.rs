use regex::RegexSet;
use serde::Serialize;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

/// Transport-level failure taxonomy. Every failed request ends in exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Connection, DNS or timeout failure.
    NetworkError,
    /// The marketplace is refusing this source address.
    IpBlocked,
    RateLimited,
    ServerError,
    UnknownError,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::IpBlocked => "IP_BLOCKED",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

fn block_markers() -> &'static RegexSet {
    static MARKERS: OnceLock<RegexSet> = OnceLock::new();
    MARKERS.get_or_init(|| {
        RegexSet::new([
            r"(?i)unusual traffic",
            r"(?i)captcha",
            r"(?i)/sorry/index",
            r"(?i)access denied",
            r"(?i)automated (queries|requests)",
        ])
        .unwrap_or_else(|_| RegexSet::empty())
    })
}

pub fn looks_like_block_page(body: &str) -> bool {
    block_markers().is_match(body)
}

/// Maps an HTTP status (and body, for 429) onto the taxonomy. `None` means success.
pub fn classify_status(status: u16, body: &str) -> Option<ErrorKind> {
    match status {
        200..=299 => None,
        403 => Some(ErrorKind::IpBlocked),
        429 if looks_like_block_page(body) => Some(ErrorKind::IpBlocked),
        429 => Some(ErrorKind::RateLimited),
        500..=599 => Some(ErrorKind::ServerError),
        _ => Some(ErrorKind::UnknownError),
    }
}

/// What the request loop should do after a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Wait(Duration),
    SwapAddress,
    GiveUp,
}

/// Per-request retry counters, one per remedy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attempts {
    pub rate_limited: u32,
    pub transient: u32,
    pub swaps: u32,
}

impl Attempts {
    pub fn bump(&mut self, kind: ErrorKind) {
        match kind {
            ErrorKind::RateLimited => self.rate_limited += 1,
            ErrorKind::NetworkError | ErrorKind::ServerError => self.transient += 1,
            ErrorKind::IpBlocked => self.swaps += 1,
            ErrorKind::UnknownError => {}
        }
    }

    pub fn total(&self) -> u32 {
        self.rate_limited + self.transient + self.swaps
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Waits applied to successive 429s; the length is the retry budget.
    pub rate_limit_delays: Vec<Duration>,
    pub transient_retries: u32,
    pub transient_delay: Duration,
    pub address_swaps: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit_delays: vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
            transient_retries: 2,
            transient_delay: Duration::from_secs(2),
            address_swaps: 1,
        }
    }
}

impl RetryPolicy {
    /// Pure decision from the failure kind and the counters accumulated so far.
    pub fn decide(&self, kind: ErrorKind, attempts: &Attempts) -> RetryAction {
        match kind {
            ErrorKind::RateLimited => self
                .rate_limit_delays
                .get(attempts.rate_limited as usize)
                .map(|d| RetryAction::Wait(*d))
                .unwrap_or(RetryAction::GiveUp),
            ErrorKind::IpBlocked if attempts.swaps < self.address_swaps => RetryAction::SwapAddress,
            ErrorKind::NetworkError | ErrorKind::ServerError
                if attempts.transient < self.transient_retries =>
            {
                RetryAction::Wait(self.transient_delay)
            }
            _ => RetryAction::GiveUp,
        }
    }
}
