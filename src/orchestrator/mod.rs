//! Collection runs: one marketplace in process (`collect`), or every marketplace with a
//! child collector per outbound address (`process::run_pipeline`).
pub mod batch;
pub mod process;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::address_pool::AddressPool;
use crate::config::HarvestConfig;
use crate::database_ops::{Db, StoreUnavailable};
use crate::marketplace::Marketplace;
use crate::source::{AppStoreSource, PlayStoreSource, ReviewSource};
use crate::transport::{ReqwestFetcher, Transport};

pub use batch::{AppOutcome, BatchSummary, Harvester, LIMITED_BY_BUDGET};
pub use process::{run_loop, run_pipeline, ChildExit, PipelineReport};

/// True when the store gave up somewhere in the error chain; such errors end the process.
pub fn is_store_unavailable(e: &anyhow::Error) -> bool {
    e.chain().any(|c| c.is::<StoreUnavailable>())
}

#[derive(Debug, Clone, Default)]
pub struct CollectOptions {
    /// Max apps per run; `None` takes every candidate.
    pub limit: Option<i64>,
    pub budget: Option<u64>,
    /// Harvest exactly these apps instead of querying candidates.
    pub app_ids: Vec<String>,
    pub no_rotation: bool,
}

/// Probes candidate addresses (or the host's, when none are configured).
pub async fn probe_pool(cfg: &HarvestConfig) -> Result<AddressPool> {
    let mut pool = AddressPool::new(cfg.probe_timeout);
    if !cfg.candidate_addresses.is_empty() {
        pool = pool.with_candidates(cfg.candidate_addresses.clone());
    }
    let fetcher = ReqwestFetcher::new();
    pool.initialize(&fetcher).await.context("address probing failed")?;
    Ok(pool)
}

/// One marketplace, in this process. A collector pinned by `COLLECTOR_SOURCE_ADDRESS` skips
/// probing and sends everything from that address.
pub async fn collect(
    cfg: &HarvestConfig,
    db: &Db,
    marketplace: Marketplace,
    opts: &CollectOptions,
) -> Result<BatchSummary> {
    let pool = match cfg.source_address {
        Some(addr) => {
            info!(marketplace = %marketplace, address = %addr, "pinned to source address");
            AddressPool::new(cfg.probe_timeout)
        }
        None => match probe_pool(cfg).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!(error = ?e, "probing failed; using the OS default route");
                AddressPool::new(cfg.probe_timeout)
            }
        },
    };
    collect_with_pool(cfg, db, marketplace, opts, pool).await
}

pub async fn collect_with_pool(
    cfg: &HarvestConfig,
    db: &Db,
    marketplace: Marketplace,
    opts: &CollectOptions,
    pool: AddressPool,
) -> Result<BatchSummary> {
    let mut transport_cfg = cfg.transport();
    if opts.no_rotation {
        transport_cfg.rotation = false;
    }
    let transport = Transport::new(ReqwestFetcher::new(), pool, transport_cfg);

    let apps = if opts.app_ids.is_empty() {
        db.candidate_apps(marketplace, cfg.max_consecutive_failures, opts.limit)
            .await?
    } else {
        opts.app_ids.clone()
    };
    if apps.is_empty() {
        info!(marketplace = %marketplace, "no candidate apps");
        return Ok(BatchSummary::default());
    }

    let budget = opts.budget.unwrap_or_else(|| cfg.budget_for(marketplace));
    match marketplace {
        Marketplace::AppStore => {
            run_source(AppStoreSource::new(transport), db, budget, cfg, &apps).await
        }
        Marketplace::PlayStore => {
            if cfg.play.is_default() {
                warn!(
                    reviews_url = %cfg.play.reviews_url,
                    "PLAY_REVIEWS_URL / PLAY_DETAILS_URL unset; using the local gateway default"
                );
            }
            let source = PlayStoreSource::new(transport, cfg.play.clone());
            run_source(source, db, budget, cfg, &apps).await
        }
    }
}

async fn run_source<S: ReviewSource>(
    source: S,
    db: &Db,
    budget: u64,
    cfg: &HarvestConfig,
    apps: &[String],
) -> Result<BatchSummary> {
    let mut harvester = Harvester::new(source, db.clone(), budget, cfg.max_consecutive_failures);
    harvester.run_batch(apps).await
}
