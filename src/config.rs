//! Process configuration, read once from the environment (and `.env`).
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::database_ops::{StoreRetry, DB_UNAVAILABLE_EXIT_CODE};
use crate::marketplace::Marketplace;
use crate::source::PlayEndpoints;
use crate::transport::TransportConfig;
use crate::util::env::{db_url, env_flag, env_ipv4_list, env_opt, env_parse, env_parse_opt, preflight_check};

pub const ENV_SOURCE_ADDRESS: &str = "COLLECTOR_SOURCE_ADDRESS";
pub const ENV_NO_SPAWN: &str = "COLLECTOR_NO_SPAWN";

const LOGGED_KEYS: &[&str] = &[
    "HARVEST_DATABASE_URL",
    "APP_REVIEWS_MAX_PER_RUN",
    "IP_ROTATION",
    "REQUEST_TIMEOUT_SECS",
    "PROBE_TIMEOUT_SECS",
    "MAX_CONSECUTIVE_FAILURES",
    "DB_CONNECT_MAX_RETRIES",
    "DB_RETRY_DELAY_SECS",
    "PIPELINE_CHILD_TIMEOUT_SECS",
    "PIPELINE_KILL_GRACE_SECS",
    "LOOP_INTERVAL_SECONDS",
    "COLLECTOR_ADDRESSES",
    ENV_SOURCE_ADDRESS,
    ENV_NO_SPAWN,
    "COLLECTOR_BIN",
    "PLAY_REVIEWS_URL",
    "PLAY_DETAILS_URL",
    "DB_UNAVAILABLE_EXIT_CODE",
];

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub database_url: String,
    /// Per-app review budget; `None` uses the marketplace default.
    pub budget: Option<u64>,
    pub rotation: bool,
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
    pub max_consecutive_failures: i64,
    pub store_retry: StoreRetry,
    pub child_timeout: Duration,
    pub kill_grace: Duration,
    pub loop_interval: Duration,
    /// Probe exactly these instead of enumerating host addresses.
    pub candidate_addresses: Vec<Ipv4Addr>,
    /// Set in spawned collectors: the one address this process should use.
    pub source_address: Option<Ipv4Addr>,
    pub no_spawn: bool,
    /// Binary spawned per marketplace by the pipeline; defaults to the running executable.
    pub collector_bin: Option<PathBuf>,
    pub play: PlayEndpoints,
    pub unavailable_exit_code: i32,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            database_url: crate::util::env::DEFAULT_DATABASE_URL.to_string(),
            budget: None,
            rotation: true,
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            max_consecutive_failures: 5,
            store_retry: StoreRetry::default(),
            child_timeout: Duration::from_secs(6 * 60 * 60),
            kill_grace: Duration::from_secs(10),
            loop_interval: Duration::from_secs(10),
            candidate_addresses: Vec::new(),
            source_address: None,
            no_spawn: false,
            collector_bin: None,
            play: PlayEndpoints::default(),
            unavailable_exit_code: DB_UNAVAILABLE_EXIT_CODE,
        }
    }
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let play = PlayEndpoints {
            reviews_url: env_opt("PLAY_REVIEWS_URL").unwrap_or(d.play.reviews_url),
            details_url: env_opt("PLAY_DETAILS_URL").unwrap_or(d.play.details_url),
        };
        Self {
            database_url: db_url(),
            budget: env_parse_opt::<u64>("APP_REVIEWS_MAX_PER_RUN"),
            rotation: env_flag("IP_ROTATION", d.rotation),
            request_timeout: Duration::from_secs(env_parse("REQUEST_TIMEOUT_SECS", 30u64)),
            probe_timeout: Duration::from_secs(env_parse("PROBE_TIMEOUT_SECS", 10u64)),
            max_consecutive_failures: env_parse("MAX_CONSECUTIVE_FAILURES", d.max_consecutive_failures),
            store_retry: StoreRetry {
                attempts: env_parse("DB_CONNECT_MAX_RETRIES", d.store_retry.attempts).max(1),
                delay: Duration::from_secs(env_parse("DB_RETRY_DELAY_SECS", 2u64)),
            },
            child_timeout: Duration::from_secs(env_parse("PIPELINE_CHILD_TIMEOUT_SECS", 21_600u64)),
            kill_grace: Duration::from_secs(env_parse("PIPELINE_KILL_GRACE_SECS", 10u64)),
            loop_interval: Duration::from_secs(env_parse("LOOP_INTERVAL_SECONDS", 10u64)),
            candidate_addresses: env_ipv4_list("COLLECTOR_ADDRESSES"),
            source_address: env_parse_opt::<Ipv4Addr>(ENV_SOURCE_ADDRESS),
            no_spawn: env_flag(ENV_NO_SPAWN, false),
            collector_bin: env_opt("COLLECTOR_BIN").map(PathBuf::from),
            play,
            unavailable_exit_code: env_parse("DB_UNAVAILABLE_EXIT_CODE", DB_UNAVAILABLE_EXIT_CODE),
        }
    }

    pub fn budget_for(&self, marketplace: Marketplace) -> u64 {
        self.budget.unwrap_or(marketplace.profile().default_budget)
    }

    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            rotation: self.rotation && self.source_address.is_none(),
            timeout: self.request_timeout,
            bound_address: self.source_address,
            ..TransportConfig::default()
        }
    }

    /// Logs the redacted snapshot of every key this process reads.
    pub fn preflight(title: &str) -> anyhow::Result<()> {
        preflight_check(title, &[], LOGGED_KEYS)
    }
}
