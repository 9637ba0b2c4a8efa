//! Multi-marketplace pipeline: one child collector per marketplace, each pinned to its own
//! outbound address and run in its own process group.
use anyhow::{Context, Result};
use futures::future::join_all;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

use super::{collect_with_pool, is_store_unavailable, probe_pool, BatchSummary, CollectOptions};
use crate::address_pool::AddressPool;
use crate::config::{HarvestConfig, ENV_NO_SPAWN, ENV_SOURCE_ADDRESS};
use crate::database_ops::{Db, StoreUnavailable, DB_UNAVAILABLE_EXIT_CODE};
use crate::marketplace::Marketplace;

/// Handle for a spawned collector.
pub struct ProcHandle {
    pub child: Child,
    pub marketplace: Marketplace,
    pub address: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// `None` when a signal ended it.
    Exited(Option<i32>),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketplaceRun {
    InProcess(BatchSummary),
    Child { address: Ipv4Addr, exit: ChildExit },
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub runs: BTreeMap<Marketplace, MarketplaceRun>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> usize {
        self.runs
            .values()
            .filter(|r| {
                matches!(
                    r,
                    MarketplaceRun::InProcess(_)
                        | MarketplaceRun::Child {
                            exit: ChildExit::Exited(Some(0)),
                            ..
                        }
                )
            })
            .count()
    }
}

fn inherit_collector_env(cmd: &mut Command, address: Ipv4Addr) {
    // the child re-reads everything else (db url, budgets, endpoints) from the same env
    cmd.env(ENV_SOURCE_ADDRESS, address.to_string())
        .env(ENV_NO_SPAWN, "1")
        .env_remove("COLLECTOR_ADDRESSES");
}

fn collector_args(marketplace: Marketplace, opts: &CollectOptions) -> Vec<String> {
    let mut args = vec![
        "collect".to_string(),
        "--marketplace".to_string(),
        marketplace.cli_name().to_string(),
    ];
    if let Some(limit) = opts.limit {
        args.push("--limit".into());
        args.push(limit.to_string());
    }
    if let Some(budget) = opts.budget {
        args.push("--budget".into());
        args.push(budget.to_string());
    }
    args
}

impl ProcHandle {
    /// Spawns `cmd` as the leader of a new process group so the whole tree can be signalled.
    pub fn spawn(mut cmd: Command, marketplace: Marketplace, address: Ipv4Addr) -> Result<Self> {
        cmd.process_group(0)
            .kill_on_drop(true)
            .stdin(Stdio::null());
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn collector for {marketplace}"))?;
        info!(marketplace = %marketplace, address = %address, pid = ?child.id(), "collector spawned");
        Ok(Self {
            child,
            marketplace,
            address,
        })
    }

    /// Spawn a collector child for `marketplace`, pinned to `address`.
    pub fn spawn_collector(
        cfg: &HarvestConfig,
        marketplace: Marketplace,
        address: Ipv4Addr,
        opts: &CollectOptions,
    ) -> Result<Self> {
        let bin = match &cfg.collector_bin {
            Some(p) => p.clone(),
            None => std::env::current_exe().context("cannot locate own executable")?,
        };
        let mut cmd = Command::new(bin);
        cmd.args(collector_args(marketplace, opts));
        inherit_collector_env(&mut cmd, address);
        Self::spawn(cmd, marketplace, address)
    }

    /// Waits up to `timeout`; past it the group gets SIGTERM, then SIGKILL after `grace`.
    pub async fn supervise(mut self, timeout: Duration, grace: Duration) -> Result<ChildExit> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => {
                let status = status.context("waiting on collector failed")?;
                let exit = exit_of(status);
                info!(marketplace = %self.marketplace, exit = ?exit, "collector finished");
                Ok(exit)
            }
            Err(_) => {
                warn!(
                    marketplace = %self.marketplace,
                    timeout_secs = timeout.as_secs(),
                    "collector timed out; terminating process group"
                );
                self.terminate(grace).await?;
                Ok(ChildExit::TimedOut)
            }
        }
    }

    async fn terminate(&mut self, grace: Duration) -> Result<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };
        #[allow(clippy::cast_possible_wrap)]
        let group = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            warn!(pid, error = %e, "SIGTERM to collector group failed");
        }
        if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
            return Ok(());
        }
        warn!(pid, grace_secs = grace.as_secs(), "collector ignored SIGTERM; sending SIGKILL");
        let _ = killpg(group, Signal::SIGKILL);
        self.child.wait().await.context("reaping killed collector failed")?;
        Ok(())
    }
}

fn exit_of(status: ExitStatus) -> ChildExit {
    ChildExit::Exited(status.code())
}

/// Gives each marketplace a distinct working address. `None` unless at least two live
/// addresses exist and every marketplace can be served by one nobody else took.
pub fn assign_addresses(
    working: &BTreeMap<Marketplace, Vec<Ipv4Addr>>,
) -> Option<BTreeMap<Marketplace, Ipv4Addr>> {
    let live: BTreeSet<Ipv4Addr> = working.values().flatten().copied().collect();
    if live.len() < 2 {
        return None;
    }
    let mut taken = BTreeSet::new();
    let mut out = BTreeMap::new();
    // fewest options first so a marketplace with one live address keeps it
    let mut order: Vec<Marketplace> = Marketplace::ALL.to_vec();
    order.sort_by_key(|mp| working.get(mp).map(Vec::len).unwrap_or(0));
    for mp in order {
        let pick = working
            .get(&mp)?
            .iter()
            .copied()
            .find(|a| !taken.contains(a))?;
        taken.insert(pick);
        out.insert(mp, pick);
    }
    Some(out)
}

/// Probes, then runs every marketplace: in parallel child processes when addresses allow,
/// sequentially in this process otherwise. A child exiting with the store-unavailable code
/// fails the whole pipeline with `StoreUnavailable`.
pub async fn run_pipeline(cfg: &HarvestConfig, db: &Db, opts: &CollectOptions) -> Result<PipelineReport> {
    let started = Instant::now();
    let pool = match probe_pool(cfg).await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = ?e, "probing failed; continuing without bound addresses");
            AddressPool::new(cfg.probe_timeout)
        }
    };
    let working: BTreeMap<Marketplace, Vec<Ipv4Addr>> = Marketplace::ALL
        .iter()
        .map(|mp| (*mp, pool.working(*mp).to_vec()))
        .collect();

    let assignment = if cfg.no_spawn {
        None
    } else {
        assign_addresses(&working)
    };
    let report = match assignment {
        Some(plan) => run_children(cfg, opts, plan).await?,
        None => {
            info!(live = ?working, "fewer than two usable addresses; running marketplaces sequentially");
            run_sequential(cfg, db, opts, &pool).await?
        }
    };
    info!(
        elapsed_secs = started.elapsed().as_secs(),
        succeeded = report.succeeded(),
        total = report.runs.len(),
        "pipeline done"
    );
    Ok(report)
}

async fn run_sequential(
    cfg: &HarvestConfig,
    db: &Db,
    opts: &CollectOptions,
    pool: &AddressPool,
) -> Result<PipelineReport> {
    let mut report = PipelineReport::default();
    for mp in Marketplace::ALL {
        let run = match collect_with_pool(cfg, db, mp, opts, pool.clone()).await {
            Ok(summary) => MarketplaceRun::InProcess(summary),
            Err(e) if is_store_unavailable(&e) => return Err(e),
            Err(e) => {
                error!(marketplace = %mp, error = ?e, "marketplace run failed");
                MarketplaceRun::Failed(format!("{e:#}"))
            }
        };
        report.runs.insert(mp, run);
    }
    Ok(report)
}

async fn run_children(
    cfg: &HarvestConfig,
    opts: &CollectOptions,
    plan: BTreeMap<Marketplace, Ipv4Addr>,
) -> Result<PipelineReport> {
    let mut report = PipelineReport::default();
    let mut handles = Vec::new();
    for (mp, addr) in plan {
        match ProcHandle::spawn_collector(cfg, mp, addr, opts) {
            Ok(h) => handles.push(h),
            Err(e) => {
                error!(marketplace = %mp, error = ?e, "spawn failed");
                report.runs.insert(mp, MarketplaceRun::Failed(format!("{e:#}")));
            }
        }
    }

    let waits = handles.into_iter().map(|h| {
        let (mp, address) = (h.marketplace, h.address);
        async move {
            let exit = h.supervise(cfg.child_timeout, cfg.kill_grace).await;
            (mp, address, exit)
        }
    });
    let mut store_down = None;
    for (mp, address, exit) in join_all(waits).await {
        let run = match exit {
            Ok(exit) => {
                if exit == ChildExit::Exited(Some(cfg.unavailable_exit_code))
                    || exit == ChildExit::Exited(Some(DB_UNAVAILABLE_EXIT_CODE))
                {
                    store_down = Some(mp);
                }
                MarketplaceRun::Child { address, exit }
            }
            Err(e) => MarketplaceRun::Failed(format!("{e:#}")),
        };
        report.runs.insert(mp, run);
    }
    if let Some(mp) = store_down {
        return Err(StoreUnavailable {
            operation: format!("{mp} collector"),
            detail: "child exited with the store-unavailable code".into(),
        }
        .into());
    }
    Ok(report)
}

/// Repeats the pipeline until SIGTERM or Ctrl-C, pausing `loop_interval` between cycles.
/// Signals that arrive mid-cycle are honored once the cycle ends.
pub async fn run_loop(cfg: &HarvestConfig, db: &Db, opts: &CollectOptions) -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut cycle = 0u64;
    loop {
        cycle += 1;
        info!(cycle, "pipeline cycle start");
        match run_pipeline(cfg, db, opts).await {
            Ok(report) => info!(cycle, succeeded = report.succeeded(), "pipeline cycle done"),
            Err(e) if is_store_unavailable(&e) => return Err(e),
            Err(e) => error!(cycle, error = ?e, "pipeline cycle failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(cfg.loop_interval) => {}
            _ = term.recv() => {
                info!(cycle, "SIGTERM received; stopping");
                break;
            }
            _ = int.recv() => {
                info!(cycle, "interrupt received; stopping");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn distinct_address_per_marketplace() {
        let working = BTreeMap::from([
            (Marketplace::AppStore, vec![ip(1), ip(2)]),
            (Marketplace::PlayStore, vec![ip(1)]),
        ]);
        let plan = assign_addresses(&working).unwrap();
        assert_eq!(plan[&Marketplace::PlayStore], ip(1));
        assert_eq!(plan[&Marketplace::AppStore], ip(2));
    }

    #[test]
    fn single_live_address_means_sequential() {
        let working = BTreeMap::from([
            (Marketplace::AppStore, vec![ip(1)]),
            (Marketplace::PlayStore, vec![ip(1)]),
        ]);
        assert!(assign_addresses(&working).is_none());
        let partial = BTreeMap::from([
            (Marketplace::AppStore, vec![ip(1), ip(2)]),
            (Marketplace::PlayStore, vec![]),
        ]);
        assert!(assign_addresses(&partial).is_none());
    }

    #[test]
    fn child_arguments_and_environment() {
        let opts = CollectOptions {
            limit: Some(20),
            budget: Some(500),
            ..Default::default()
        };
        assert_eq!(
            collector_args(Marketplace::PlayStore, &opts),
            vec!["collect", "--marketplace", "play-store", "--limit", "20", "--budget", "500"]
        );
        let mut cmd = Command::new("true");
        inherit_collector_env(&mut cmd, ip(7));
        let envs: Vec<_> = cmd
            .as_std()
            .get_envs()
            .map(|(k, v)| (k.to_string_lossy().into_owned(), v.map(|v| v.to_string_lossy().into_owned())))
            .collect();
        assert!(envs.contains(&(ENV_SOURCE_ADDRESS.to_string(), Some("10.0.0.7".into()))));
        assert!(envs.contains(&(ENV_NO_SPAWN.to_string(), Some("1".into()))));
    }

    #[tokio::test]
    async fn exit_code_is_reported() {
        let h = ProcHandle::spawn(sh("exit 75"), Marketplace::AppStore, ip(1)).unwrap();
        let exit = h
            .supervise(Duration::from_secs(10), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(exit, ChildExit::Exited(Some(DB_UNAVAILABLE_EXIT_CODE)));
    }

    #[tokio::test]
    async fn hung_child_is_terminated() {
        let h = ProcHandle::spawn(sh("sleep 30"), Marketplace::AppStore, ip(1)).unwrap();
        let started = Instant::now();
        let exit = h
            .supervise(Duration::from_millis(200), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(exit, ChildExit::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn child_ignoring_sigterm_is_killed_after_grace() {
        let h = ProcHandle::spawn(
            sh("trap '' TERM; while true; do sleep 1; done"),
            Marketplace::PlayStore,
            ip(2),
        )
        .unwrap();
        let started = Instant::now();
        let exit = h
            .supervise(Duration::from_millis(200), Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(exit, ChildExit::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
