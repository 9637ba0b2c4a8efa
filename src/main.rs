use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use review_harvester::config::HarvestConfig;
use review_harvester::database_ops::Db;
use review_harvester::marketplace::Marketplace;
use review_harvester::orchestrator::{self, is_store_unavailable, CollectOptions};
use review_harvester::tracing::init_tracing;
use review_harvester::util::env;
use serde_json::json;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "review-harvester", version, about = "Marketplace review collector")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Harvest reviews for one marketplace in this process
    Collect {
        /// app-store or play-store
        #[arg(long)]
        marketplace: Marketplace,
        /// Maximum number of apps to process (default: every candidate)
        #[arg(long)]
        limit: Option<i64>,
        /// Per-app review budget (default: APP_REVIEWS_MAX_PER_RUN or the marketplace default)
        #[arg(long)]
        budget: Option<u64>,
        /// Harvest only these app ids (repeatable)
        #[arg(long = "app-id")]
        app_ids: Vec<String>,
        /// Always use the first working address
        #[arg(long, default_value_t = false)]
        no_rotation: bool,
    },
    /// Probe addresses and harvest every marketplace, one child collector per address
    Pipeline {
        #[arg(long)]
        limit: Option<i64>,
        #[arg(long)]
        budget: Option<u64>,
        /// Repeat until SIGTERM / Ctrl-C, pausing LOOP_INTERVAL_SECONDS between cycles
        #[arg(long = "loop", default_value_t = false)]
        daemon: bool,
    },
    /// Probe outbound addresses against every marketplace and print the results
    Probe,
    /// Print failure and collection statistics
    Status {
        /// Restrict to one marketplace (default: all)
        #[arg(long)]
        marketplace: Option<Marketplace>,
        /// List apps with at least this many consecutive failures
        #[arg(long, default_value_t = 1)]
        min_failures: i64,
    },
}

#[tokio::main]
async fn main() {
    env::init_env();
    if let Err(e) = init_tracing("info,sqlx=warn") {
        eprintln!("{e:#}");
    }
    let cli = Cli::parse();
    let cfg = HarvestConfig::from_env();

    if let Err(e) = run(cli, cfg.clone()).await {
        if is_store_unavailable(&e) {
            error!(error = ?e, code = cfg.unavailable_exit_code, "store unavailable; exiting");
            std::process::exit(cfg.unavailable_exit_code);
        }
        error!(error = ?e, "fatal");
        std::process::exit(1);
    }
}

async fn run(cli: Cli, cfg: HarvestConfig) -> Result<()> {
    HarvestConfig::preflight("review-harvester")?;
    match cli.command {
        Commands::Collect {
            marketplace,
            limit,
            budget,
            app_ids,
            no_rotation,
        } => {
            let db = connect(&cfg).await?;
            let opts = CollectOptions {
                limit,
                budget,
                app_ids,
                no_rotation,
            };
            let summary = orchestrator::collect(&cfg, &db, marketplace, &opts).await?;
            info!(marketplace = %marketplace, summary = ?summary, "collect: completed");
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Pipeline {
            limit,
            budget,
            daemon,
        } => {
            let db = connect(&cfg).await?;
            let opts = CollectOptions {
                limit,
                budget,
                ..Default::default()
            };
            if daemon {
                orchestrator::run_loop(&cfg, &db, &opts).await?;
            } else {
                let report = orchestrator::run_pipeline(&cfg, &db, &opts).await?;
                info!(runs = ?report.runs, "pipeline: completed");
            }
        }
        Commands::Probe => {
            let pool = orchestrator::probe_pool(&cfg).await?;
            let summary: Vec<_> = pool
                .summary()
                .into_iter()
                .map(|(mp, (working, tested))| json!({"marketplace": mp, "working": working, "tested": tested}))
                .collect();
            let out = json!({"addresses": pool.tested(), "summary": summary});
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Status {
            marketplace,
            min_failures,
        } => {
            let db = connect(&cfg).await?;
            let since = Utc::now() - ChronoDuration::hours(24);
            let targets: Vec<Marketplace> = match marketplace {
                Some(mp) => vec![mp],
                None => Marketplace::ALL.to_vec(),
            };
            let mut report = Vec::new();
            for mp in targets {
                report.push(json!({
                    "marketplace": mp,
                    "last_24h": db.collection_stats_since(mp, since).await?,
                    "failures_by_code": db.failure_stats(mp).await?,
                    "failing_apps": db.consecutive_failure_apps(mp, min_failures).await?,
                }));
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

async fn connect(cfg: &HarvestConfig) -> Result<Db> {
    Db::connect(&cfg.database_url, 5, cfg.store_retry.clone())
        .await
        .context("opening review store")
}
