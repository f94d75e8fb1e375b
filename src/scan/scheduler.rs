//! Runs every enabled config of a kind through partitioning and execution on
//! a bounded worker pool.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::scan::executor::{self, TaskOutcome};
use crate::scan::partitioner;
use crate::scan::{ScanContext, ScanError};
use crate::types::scan::{ScanConfig, ScanKind};

/// Configs that must run sequentially, in ascending id order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum UnitKey {
    Group { chain_id: Option<u64>, group: String },
    Single(i64),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub units: usize,
    pub failed_units: usize,
    pub tasks_created: usize,
    pub tasks_finished: usize,
    pub tasks_retried: usize,
    pub task_errors: usize,
}

impl CycleSummary {
    fn merge(&mut self, other: CycleSummary) {
        self.failed_units += other.failed_units;
        self.tasks_created += other.tasks_created;
        self.tasks_finished += other.tasks_finished;
        self.tasks_retried += other.tasks_retried;
        self.task_errors += other.task_errors;
    }
}

/// Group configs into concurrency units.
///
/// Configs sharing a chain and `scan_group` form one unit; every other config
/// is a unit of its own. Units come out ordered by their smallest config id.
pub fn group_units(
    configs: Vec<ScanConfig>,
    chain_of: impl Fn(&str) -> Option<u64>,
) -> Vec<Vec<ScanConfig>> {
    let mut units: BTreeMap<UnitKey, Vec<ScanConfig>> = BTreeMap::new();
    for config in configs {
        let key = match &config.scan_group {
            Some(group) if !group.is_empty() => UnitKey::Group {
                chain_id: chain_of(&config.contract),
                group: group.clone(),
            },
            _ => UnitKey::Single(config.id),
        };
        units.entry(key).or_default().push(config);
    }

    let mut units: Vec<Vec<ScanConfig>> = units
        .into_values()
        .map(|mut unit| {
            unit.sort_by_key(|c| c.id);
            unit
        })
        .collect();
    units.sort_by_key(|unit| unit.first().map(|c| c.id));
    units
}

/// One scheduling cycle for `kind`.
pub async fn run_cycle(ctx: &ScanContext, kind: ScanKind) -> Result<CycleSummary, ScanError> {
    let configs = ctx.store.enabled_configs(kind).await?;
    let registry = ctx.registry.clone();
    let units = group_units(configs, |contract| registry.chain_id_of(contract));

    let mut summary = CycleSummary {
        units: units.len(),
        ..CycleSummary::default()
    };
    if units.is_empty() {
        return Ok(summary);
    }

    let workers = ctx.settings.max_workers(kind).min(units.len());
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut join_set = JoinSet::new();

    for unit in units {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let ctx = ctx.clone();
        join_set.spawn(async move {
            let _permit = permit;
            run_unit(&ctx, &unit).await
        });
    }

    while let Some(result) = join_set.join_next().await {
        match result {
            Ok(unit_summary) => summary.merge(unit_summary),
            Err(e) => {
                tracing::error!("{} scan unit panicked: {}", kind, e);
                summary.failed_units += 1;
            }
        }
    }

    tracing::info!(
        "{} scan cycle: {} unit(s), {} task(s) created, {} finished, {} left for retry",
        kind,
        summary.units,
        summary.tasks_created,
        summary.tasks_finished,
        summary.tasks_retried + summary.task_errors
    );
    Ok(summary)
}

async fn run_unit(ctx: &ScanContext, unit: &[ScanConfig]) -> CycleSummary {
    let mut summary = CycleSummary::default();
    let mut unit_failed = false;
    for config in unit {
        match run_config(ctx, config).await {
            Ok(config_summary) => summary.merge(config_summary),
            Err(e) => {
                tracing::error!("Scan of {} failed: {}", config, e);
                unit_failed = true;
            }
        }
    }
    if unit_failed {
        summary.failed_units = 1;
    }
    summary
}

/// Partition then execute every `Initial` task of one config's contract.
pub async fn run_config(ctx: &ScanContext, config: &ScanConfig) -> Result<CycleSummary, ScanError> {
    let facade = ctx.registry.facade(&config.contract).await?;
    let head = facade.latest_block().await?;

    let mut summary = CycleSummary::default();
    match partitioner::partition(ctx, config, head).await {
        Ok(created) => summary.tasks_created = created.len(),
        Err(e) => tracing::error!("Failed to partition {}: {}", config, e),
    }

    let tasks = ctx
        .store
        .initial_tasks(config.scan_kind, &config.contract)
        .await?;
    for task in &tasks {
        match executor::execute(ctx, config, task).await {
            Ok(TaskOutcome::Finished(_)) => summary.tasks_finished += 1,
            Ok(TaskOutcome::Retry(_)) => summary.tasks_retried += 1,
            Ok(TaskOutcome::Skipped(_)) => {}
            Err(e) => {
                tracing::warn!("{} failed: {}", task, e);
                summary.task_errors += 1;
            }
        }
    }
    Ok(summary)
}
