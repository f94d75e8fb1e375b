//! Periodic audit of finished tasks.
//!
//! Tasks created inside a time window are grouped by (config, contract). Each
//! group must tile its block span with `Finished` tasks (coverage) and every
//! record the chain holds for that span must be stored (detection). Groups
//! passing both checks are merged into a single `Archived` task. Gaps are
//! healed with new tasks and missed records reopen the task covering them, so
//! the next scan cycle repairs what the audit found.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Timelike, Utc};

use crate::db::DbError;
use crate::scan::coverage::Coverage;
use crate::scan::executor;
use crate::scan::{ScanContext, ScanError};
use crate::types::scan::{
    ArchivedTask, BlockRange, NewScanTask, RecordKey, ScanConfig, ScanKind, ScanTask, TaskStatus,
};

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverageVerdict {
    Covered,
    /// A task in the group has not finished; nothing can be merged yet.
    Unfinished(i64),
    Gaps(Vec<BlockRange>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupVerdict {
    Archived(ScanTask),
    Unfinished(i64),
    Gaps(Vec<BlockRange>),
    Missing { keys: Vec<RecordKey>, reopened: u64 },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AuditSummary {
    pub windows: usize,
    pub groups: usize,
    pub archived: usize,
    pub healing_tasks: usize,
    pub reopened_tasks: u64,
    pub aborted: usize,
}

impl AuditSummary {
    fn merge(&mut self, other: AuditSummary) {
        self.windows += other.windows;
        self.groups += other.groups;
        self.archived += other.archived;
        self.healing_tasks += other.healing_tasks;
        self.reopened_tasks += other.reopened_tasks;
        self.aborted += other.aborted;
    }
}

/// Split `[start, start + slice_hours)` into merge windows of
/// `merge_minutes`, after truncating `start` to the hour.
pub fn audit_windows(start: DateTime<Utc>, slice_hours: i64, merge_minutes: i64) -> Vec<AuditWindow> {
    let slice_minutes = slice_hours * 60;
    if merge_minutes <= 0 || slice_minutes <= 0 {
        tracing::error!(
            "Invalid audit slice of {} min with merge window of {} min",
            slice_minutes,
            merge_minutes
        );
        return Vec::new();
    }
    if slice_minutes < merge_minutes || slice_minutes % merge_minutes != 0 {
        tracing::error!(
            "Audit slice of {} min is not a multiple of the {} min merge window",
            slice_minutes,
            merge_minutes
        );
    }

    let start = truncate_to_hour(start);
    let end = start + Duration::minutes(slice_minutes);
    let step = Duration::minutes(merge_minutes);

    let mut windows = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = (cursor + step).min(end);
        windows.push(AuditWindow {
            start: cursor,
            end: next,
        });
        cursor = next;
    }
    windows
}

fn truncate_to_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    t.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}

/// Audit every merge window of a slice. A failing window is logged and the
/// rest still run.
pub async fn audit(
    ctx: &ScanContext,
    kind: ScanKind,
    start: DateTime<Utc>,
    slice_hours: i64,
) -> AuditSummary {
    let windows = audit_windows(start, slice_hours, ctx.settings.audit_task_merge_minutes);
    if let (Some(first), Some(last)) = (windows.first(), windows.last()) {
        tracing::info!("Starting {} audit of [{}, {})", kind, first.start, last.end);
    }

    let mut summary = AuditSummary::default();
    for window in windows {
        match reconcile_window(ctx, kind, window).await {
            Ok(window_summary) => summary.merge(window_summary),
            Err(e) => {
                tracing::error!(
                    "{} audit of [{}, {}) aborted: {}",
                    kind,
                    window.start,
                    window.end,
                    e
                );
                summary.windows += 1;
                summary.aborted += 1;
            }
        }
    }

    tracing::info!(
        "{} audit done: {} group(s), {} archived, {} healing task(s), {} reopened, {} aborted",
        kind,
        summary.groups,
        summary.archived,
        summary.healing_tasks,
        summary.reopened_tasks,
        summary.aborted
    );
    summary
}

/// Audit the tasks created in one merge window.
///
/// Check failures and per-group errors are contained to their group. A
/// failed archival merge aborts the window.
pub async fn reconcile_window(
    ctx: &ScanContext,
    kind: ScanKind,
    window: AuditWindow,
) -> Result<AuditSummary, ScanError> {
    let candidates = ctx
        .store
        .audit_candidates(kind, window.start, window.end)
        .await?;

    let mut groups: BTreeMap<(i64, String), Vec<ScanTask>> = BTreeMap::new();
    for task in candidates {
        groups
            .entry((task.config_id, task.contract.clone()))
            .or_default()
            .push(task);
    }

    let mut summary = AuditSummary {
        windows: 1,
        ..AuditSummary::default()
    };
    for ((config_id, contract), tasks) in groups {
        let Some(config) = ctx.store.get_config(config_id).await? else {
            tracing::warn!("Skipping audit of {} tasks of missing config {}", contract, config_id);
            continue;
        };
        if !config.audit_enabled() {
            continue;
        }
        summary.groups += 1;

        let verdict = match reconcile_group(ctx, &config, &tasks, window).await {
            Ok(verdict) => verdict,
            Err(ScanError::Db(e)) if matches!(e, DbError::Concurrent(_)) => {
                return Err(ScanError::Reconciliation(format!(
                    "archival of {} tasks for {} failed: {}",
                    tasks.len(),
                    config,
                    e
                )));
            }
            Err(e) => {
                tracing::error!("Audit of {} for {} aborted: {}", contract, config, e);
                summary.aborted += 1;
                continue;
            }
        };

        match verdict {
            GroupVerdict::Archived(_) => summary.archived += 1,
            GroupVerdict::Unfinished(_) => summary.aborted += 1,
            GroupVerdict::Gaps(gaps) => {
                summary.aborted += 1;
                if ctx.settings.audit_auto_fix_missing_task {
                    summary.healing_tasks += gaps.len();
                }
            }
            GroupVerdict::Missing { reopened, .. } => {
                summary.aborted += 1;
                summary.reopened_tasks += reopened;
            }
        }
    }
    Ok(summary)
}

/// Coverage of `span` by a group of tasks.
pub fn check_coverage(tasks: &[ScanTask], span: BlockRange) -> CoverageVerdict {
    if let Some(unfinished) = tasks.iter().find(|t| t.status != TaskStatus::Finished) {
        return CoverageVerdict::Unfinished(unfinished.id);
    }
    if tasks.len() <= 1 {
        return CoverageVerdict::Covered;
    }

    let mut coverage = Coverage::new(span);
    for task in tasks {
        coverage.cover(task.range);
    }
    if coverage.is_full() {
        CoverageVerdict::Covered
    } else {
        CoverageVerdict::Gaps(coverage.gaps())
    }
}

/// Run both checks on one (config, contract) group and archive it when they
/// pass. `tasks` is ordered by end block; the first one is the template.
pub async fn reconcile_group(
    ctx: &ScanContext,
    config: &ScanConfig,
    tasks: &[ScanTask],
    window: AuditWindow,
) -> Result<GroupVerdict, ScanError> {
    let Some(template) = tasks.first() else {
        return Err(ScanError::Reconciliation("empty task group".to_string()));
    };
    let kind = template.kind;
    let span = BlockRange::new(
        tasks.iter().map(|t| t.range.start).min().unwrap_or(template.range.start),
        tasks.iter().map(|t| t.range.end).max().unwrap_or(template.range.end),
    );

    match check_coverage(tasks, span) {
        CoverageVerdict::Covered => {}
        CoverageVerdict::Unfinished(id) => {
            tracing::error!(
                "{} task {} in span {} of {} is unfinished, abort merge",
                kind,
                id,
                span,
                config
            );
            return Ok(GroupVerdict::Unfinished(id));
        }
        CoverageVerdict::Gaps(gaps) => {
            tracing::error!(
                "Uncovered block range(s) {:?} in span {} of {}",
                gaps.iter().map(|g| g.to_string()).collect::<Vec<_>>(),
                span,
                config
            );
            if ctx.settings.audit_auto_fix_missing_task {
                heal_gaps(ctx, template, &gaps).await?;
            }
            return Ok(GroupVerdict::Gaps(gaps));
        }
    }

    let (missing, reopened) = detect_missing(ctx, config, tasks, span).await?;
    if !missing.is_empty() {
        return Ok(GroupVerdict::Missing {
            keys: missing,
            reopened,
        });
    }

    let merged: Vec<i64> = tasks.iter().map(|t| t.id).collect();
    let archived = ctx
        .store
        .archive_tasks(
            kind,
            template.config_id,
            &template.contract,
            &merged,
            ArchivedTask {
                template_id: template.id,
                range: span,
                created_at: window.start,
                updated_at: window.end,
            },
        )
        .await?;
    tracing::info!("Archived {} task(s) of {} into {}", merged.len(), config, archived);
    Ok(GroupVerdict::Archived(archived))
}

async fn heal_gaps(
    ctx: &ScanContext,
    template: &ScanTask,
    gaps: &[BlockRange],
) -> Result<Vec<ScanTask>, ScanError> {
    let healing: Vec<NewScanTask> = gaps
        .iter()
        .map(|gap| NewScanTask {
            kind: template.kind,
            config_id: template.config_id,
            contract: template.contract.clone(),
            range: *gap,
            created_at: Some(template.created_at),
        })
        .collect();
    let created = ctx.store.insert_tasks(&healing).await?;
    for task in &created {
        tracing::info!("Created healing {}", task);
    }
    Ok(created)
}

/// Keys the chain holds for `span` that are not stored, and how many tasks
/// were reopened for them. Tasks are only reopened with auto-fix on.
async fn detect_missing(
    ctx: &ScanContext,
    config: &ScanConfig,
    tasks: &[ScanTask],
    span: BlockRange,
) -> Result<(Vec<RecordKey>, u64), ScanError> {
    let facade = ctx.registry.facade(&config.contract).await?;
    let collected = executor::collect(config, &facade, span).await?;
    if collected.decode_failures > 0 {
        return Err(ScanError::Reconciliation(format!(
            "{} undecodable record(s) in span {} of {}",
            collected.decode_failures, span, config
        )));
    }
    if collected.records.is_empty() {
        return Ok((Vec::new(), 0));
    }

    let keys: Vec<RecordKey> = collected.records.iter().map(|r| r.key()).collect();
    let stored = ctx.store.existing_keys(&keys).await?;
    let missing: Vec<_> = collected
        .records
        .iter()
        .filter(|r| !stored.contains(&r.key()))
        .collect();
    if missing.is_empty() {
        return Ok((Vec::new(), 0));
    }

    tracing::error!(
        "{} undetected record(s) in span {} of {}: {:?}",
        missing.len(),
        span,
        config,
        missing.iter().map(|r| r.key().to_string()).collect::<Vec<_>>()
    );

    let mut reopened = 0;
    if ctx.settings.audit_auto_fix_missing_task {
        let task_ids: Vec<i64> = tasks.iter().map(|t| t.id).collect();
        for record in &missing {
            reopened += ctx
                .store
                .reopen_tasks_covering(config.scan_kind, &task_ids, record.block_number())
                .await?;
        }
        tracing::info!("Reopened {} task(s) of {}", reopened, config);
    }

    Ok((missing.into_iter().map(|r| r.key()).collect(), reopened))
}
