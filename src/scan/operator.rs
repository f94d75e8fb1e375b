//! Commands for operators: config seeding, one-off scans and audits,
//! outstanding task listing and abandoning tasks.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};

use crate::db::DbError;
use crate::scan::reconciler::{self, AuditSummary};
use crate::scan::scheduler::{self, CycleSummary};
use crate::scan::{ScanContext, ScanError};
use crate::types::config::scan::validate_scan_config;
use crate::types::scan::{ConfigStatus, NewScanConfig, ScanConfig, ScanKind, ScanTask, TaskStatus};

/// `<kind>:<id>`, e.g. `event:42`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskRef {
    pub kind: ScanKind,
    pub id: i64,
}

impl FromStr for TaskRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| format!("expected <kind>:<id>, got '{}'", s))?;
        Ok(TaskRef {
            kind: kind.parse()?,
            id: id
                .trim()
                .parse()
                .map_err(|e| format!("invalid task id '{}': {}", id, e))?,
        })
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Save each seed config whose (contract, kind) has no config yet. Returns the
/// configs created.
pub async fn seed_scan_configs(
    ctx: &ScanContext,
    seeds: &[NewScanConfig],
) -> Result<Vec<ScanConfig>, ScanError> {
    let mut created = Vec::new();
    for seed in seeds {
        let entry = ctx.registry.catalog().get(&seed.contract)?;
        validate_scan_config(seed, &entry.abi)?;

        if !ctx
            .store
            .configs_for(&seed.contract, seed.scan_kind)
            .await?
            .is_empty()
        {
            tracing::debug!("{} {} scan already configured", seed.contract, seed.scan_kind);
            continue;
        }

        let config = ScanConfig::from_new(
            0,
            seed.clone(),
            ctx.settings.safe_block_num_offset,
            ctx.settings.default_max_deliver_retry,
        );
        let config = ctx.store.create_config(config).await?;
        tracing::info!(config_id = config.id, "Seeded {}", config);
        created.push(config);
    }
    Ok(created)
}

/// Enable a config. Any other enabled config for the same contract and kind
/// is disabled in the same write.
pub async fn enable_scan_config(ctx: &ScanContext, config_id: i64) -> Result<ScanConfig, ScanError> {
    let mut config = ctx
        .store
        .get_config(config_id)
        .await?
        .ok_or(ScanError::ConfigNotFound(config_id))?;
    ctx.registry.catalog().get(&config.contract)?;

    config.status = ConfigStatus::Enabled;
    ctx.store.update_config(&config).await?;
    tracing::info!(config_id, "Enabled {}", config);
    Ok(config)
}

/// Soft delete. The config's tasks and records stay auditable.
pub async fn disable_scan_config(ctx: &ScanContext, config_id: i64) -> Result<(), ScanError> {
    ctx.store.disable_config(config_id).await.map_err(|e| match e {
        DbError::NotFound(_) => ScanError::ConfigNotFound(config_id),
        other => ScanError::Db(other),
    })?;
    tracing::info!(config_id, "Disabled scan config");
    Ok(())
}

/// Partition and execute one config right away.
pub async fn trigger_scan(ctx: &ScanContext, config_id: i64) -> Result<CycleSummary, ScanError> {
    let config = ctx
        .store
        .get_config(config_id)
        .await?
        .ok_or(ScanError::ConfigNotFound(config_id))?;
    if !config.is_enabled() {
        tracing::warn!("Triggering scan of disabled {}", config);
    }
    scheduler::run_config(ctx, &config).await
}

/// Audit the tasks created on one UTC day.
pub async fn trigger_reconcile(ctx: &ScanContext, kind: ScanKind, day: NaiveDate) -> AuditSummary {
    reconciler::audit(ctx, kind, day_start(day), 24).await
}

pub fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}

pub fn previous_utc_day(now: DateTime<Utc>) -> NaiveDate {
    (now - Duration::days(1)).date_naive()
}

/// `Initial` tasks, oldest first.
pub async fn list_outstanding_tasks(
    ctx: &ScanContext,
    kind: ScanKind,
) -> Result<Vec<ScanTask>, ScanError> {
    Ok(ctx.store.outstanding_tasks(kind).await?)
}

/// Abandon an `Initial` task. Closed tasks are never scheduled again.
pub async fn force_close_task(ctx: &ScanContext, task: TaskRef) -> Result<ScanTask, ScanError> {
    let current = ctx
        .store
        .get_task(task.kind, task.id)
        .await?
        .ok_or(ScanError::TaskNotFound {
            kind: task.kind,
            id: task.id,
        })?;
    let invalid = |status| ScanError::InvalidTaskStatus {
        kind: task.kind,
        id: task.id,
        status,
        expected: TaskStatus::Initial,
    };
    if current.status != TaskStatus::Initial {
        return Err(invalid(current.status));
    }

    let closed = ctx
        .store
        .transition_task(task.kind, task.id, TaskStatus::Initial, TaskStatus::Closed)
        .await?;
    let updated = ctx
        .store
        .get_task(task.kind, task.id)
        .await?
        .ok_or(ScanError::TaskNotFound {
            kind: task.kind,
            id: task.id,
        })?;
    if !closed {
        return Err(invalid(updated.status));
    }
    tracing::info!("Closed {}", updated);
    Ok(updated)
}
