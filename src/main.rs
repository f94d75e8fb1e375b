mod chain;
mod db;
mod rpc;
mod scan;
mod types;

use std::env;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use chain::{ClientRegistry, RpcClientFactory};
use db::{DbPool, PgScanStore};
use scan::delivery::DeliveryRetryMarker;
use scan::operator::{self, TaskRef};
use scan::realtime::RealtimeIngestor;
use scan::scheduler::run_cycle;
use scan::ScanContext;
use types::config::indexer::IndexerConfig;
use types::scan::ScanKind;

const DEFAULT_CONFIG_PATH: &str = "config/config.json";
const MIGRATIONS_DIR: &str = "migrations";

/// What the process was started to do.
#[derive(Debug)]
enum Command {
    Run,
    ScanOnce,
    Scan(i64),
    Audit(NaiveDate),
    Outstanding,
    CloseTask(TaskRef),
    EnableConfig(i64),
    DisableConfig(i64),
}

fn parse_id(flag: &str, value: &str) -> anyhow::Result<i64> {
    value
        .parse()
        .with_context(|| format!("Invalid config id '{}' for {}", value, flag))
}

#[derive(Debug)]
struct Args {
    config: PathBuf,
    command: Command,
}

fn parse_args(args: &[String]) -> anyhow::Result<Args> {
    let mut config = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut command = Command::Run;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        let mut value = |flag: &str| {
            iter.next()
                .cloned()
                .with_context(|| format!("{} requires a value", flag))
        };
        match arg.as_str() {
            "--config" => config = PathBuf::from(value("--config")?),
            "--scan-once" => command = Command::ScanOnce,
            "--scan" => command = Command::Scan(parse_id(arg, &value(arg)?)?),
            "--enable-config" => command = Command::EnableConfig(parse_id(arg, &value(arg)?)?),
            "--disable-config" => command = Command::DisableConfig(parse_id(arg, &value(arg)?)?),
            "--audit" => {
                let day = value("--audit")?;
                command = Command::Audit(
                    NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                        .with_context(|| format!("Invalid audit day '{}'", day))?,
                );
            }
            "--outstanding" => command = Command::Outstanding,
            "--close-task" => {
                let task = value("--close-task")?;
                command = Command::CloseTask(task.parse().map_err(anyhow::Error::msg)?);
            }
            other => anyhow::bail!("Unknown argument '{}'", other),
        }
    }

    Ok(Args { config, command })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let args = parse_args(&args)?;

    let config = IndexerConfig::load(&args.config)?;
    load_required_env_vars(&config)?;
    tracing::info!(
        "Loaded config with {} chain(s) and {} seed scan config(s)",
        config.chains.len(),
        config.scan_configs.len()
    );

    let pool = DbPool::new(&config.database_url()?)
        .await
        .context("Failed to connect to database")?;
    pool.run_migrations(Path::new(MIGRATIONS_DIR))
        .await
        .context("Failed to run migrations")?;

    let registry = ClientRegistry::new(
        &config.chains,
        Arc::new(RpcClientFactory),
        config.scan.max_scan_block,
    )?;
    let ctx = ScanContext::new(
        Arc::new(PgScanStore::new(pool)),
        Arc::new(registry),
        config.scan.clone(),
    );

    let seeded = operator::seed_scan_configs(&ctx, &config.scan_configs).await?;
    if !seeded.is_empty() {
        tracing::info!("Seeded {} scan config(s)", seeded.len());
    }

    match args.command {
        Command::Run => run(ctx).await,
        Command::ScanOnce => {
            for kind in ScanKind::ALL {
                run_cycle(&ctx, kind).await?;
            }
            Ok(())
        }
        Command::Scan(config_id) => {
            let summary = operator::trigger_scan(&ctx, config_id).await?;
            tracing::info!(
                "Scan of config {}: {} task(s) created, {} finished, {} left for retry",
                config_id,
                summary.tasks_created,
                summary.tasks_finished,
                summary.tasks_retried + summary.task_errors
            );
            Ok(())
        }
        Command::Audit(day) => {
            for kind in ScanKind::ALL {
                let summary = operator::trigger_reconcile(&ctx, kind, day).await;
                tracing::info!("{} audit of {}: {:?}", kind, day, summary);
            }
            Ok(())
        }
        Command::Outstanding => {
            for kind in ScanKind::ALL {
                let tasks = operator::list_outstanding_tasks(&ctx, kind).await?;
                tracing::info!("{} outstanding {} task(s)", tasks.len(), kind);
                for task in tasks {
                    println!("{}", task);
                }
            }
            Ok(())
        }
        Command::CloseTask(task) => {
            operator::force_close_task(&ctx, task).await?;
            Ok(())
        }
        Command::EnableConfig(config_id) => {
            operator::enable_scan_config(&ctx, config_id).await?;
            Ok(())
        }
        Command::DisableConfig(config_id) => {
            operator::disable_scan_config(&ctx, config_id).await?;
            Ok(())
        }
    }
}

/// Ensures the RPC and database env vars are set, loading .env if needed.
fn load_required_env_vars(config: &IndexerConfig) -> anyhow::Result<()> {
    let required: Vec<&str> = config
        .chains
        .iter()
        .map(|c| c.rpc_url_env_var.as_str())
        .chain(std::iter::once(config.database_url_env_var.as_str()))
        .collect();

    let missing: Vec<&&str> = required
        .iter()
        .filter(|var| env::var(var).is_err())
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    dotenvy::dotenv().with_context(|| {
        format!(
            "Missing env vars {:?} and failed to load .env file",
            missing
        )
    })?;

    let still_missing: Vec<&str> = required
        .iter()
        .filter(|var| env::var(var).is_err())
        .copied()
        .collect();

    anyhow::ensure!(
        still_missing.is_empty(),
        "Missing required env vars after loading .env: {:?}",
        still_missing
    );

    Ok(())
}

/// Long-running mode: periodic scan cycles per kind, delivery touches and
/// audits of the previous day, plus realtime subscriptions. Stops on ctrl-c.
async fn run(ctx: ScanContext) -> anyhow::Result<()> {
    let settings = ctx.settings.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    for kind in ScanKind::ALL {
        let ctx = ctx.clone();
        tasks.spawn(every(
            Duration::from_secs(settings.scan_interval_secs),
            shutdown_rx.clone(),
            move || {
                let ctx = ctx.clone();
                async move {
                    if let Err(e) = run_cycle(&ctx, kind).await {
                        tracing::error!("{} scan cycle failed: {}", kind, e);
                    }
                }
            },
        ));
    }

    let marker = Arc::new(DeliveryRetryMarker::new(&ctx));
    tasks.spawn(every(
        Duration::from_secs(settings.touch_interval_secs),
        shutdown_rx.clone(),
        move || {
            let marker = marker.clone();
            async move {
                if let Err(e) = marker.touch_unprocessed(Utc::now()).await {
                    tracing::error!("Delivery touch failed: {}", e);
                }
            }
        },
    ));

    let audit_ctx = ctx.clone();
    tasks.spawn(every(
        Duration::from_secs(settings.audit_interval_secs),
        shutdown_rx.clone(),
        move || {
            let ctx = audit_ctx.clone();
            async move {
                let day = operator::previous_utc_day(Utc::now());
                for kind in ScanKind::ALL {
                    let summary = operator::trigger_reconcile(&ctx, kind, day).await;
                    tracing::info!("{} audit of {}: {:?}", kind, day, summary);
                }
            }
        },
    ));

    let ingestor = RealtimeIngestor::new(ctx.clone());
    let realtime_shutdown = shutdown_rx.clone();
    tasks.spawn(async move { Ok(ingestor.run(realtime_shutdown).await?) });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl-c")?;
            tracing::info!("Shutting down");
        }
        Some(result) = tasks.join_next() => {
            tracing::warn!("A background loop exited early: {:?}", result);
        }
    }
    shutdown_tx.send_replace(true);

    while let Some(result) = tasks.join_next().await {
        result??;
    }
    tracing::info!("All loops stopped");
    Ok(())
}

/// Run `tick` every `period` until shutdown. A tick in progress is finished
/// before the loop stops.
async fn every<F, Fut>(
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = interval.tick() => {}
        }
        if *shutdown.borrow() {
            return Ok(());
        }
        tick().await;
    }
}
