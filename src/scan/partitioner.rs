//! Splits the unscanned block range of a config into bounded tasks.

use crate::scan::{ScanContext, ScanError};
use crate::types::scan::{BlockRange, NewScanTask, ScanConfig, ScanTask};

/// Ranges to scan next.
///
/// The scan ends `offset` blocks behind `head`. It resumes at `last_end` when
/// the config has scanned before, otherwise it looks back at most
/// `default_batch` blocks. The result tiles `[start, end)` in chunks of at
/// most `batch` blocks and is empty when there is nothing new.
pub fn plan(
    last_end: Option<u64>,
    head: u64,
    offset: u64,
    default_batch: u64,
    batch: u64,
) -> Vec<BlockRange> {
    let end = head.saturating_sub(offset);
    let start = last_end.unwrap_or_else(|| end.saturating_sub(default_batch));
    BlockRange::new(start, end).chunks(batch)
}

/// Create `Initial` tasks for everything between the config's last task and
/// the stable head, in one bulk write.
pub async fn partition(
    ctx: &ScanContext,
    config: &ScanConfig,
    head: u64,
) -> Result<Vec<ScanTask>, ScanError> {
    let last = ctx
        .store
        .last_task(config.scan_kind, config.id, &config.contract)
        .await?;
    let ranges = plan(
        last.map(|t| t.range.end),
        head,
        config.stable_block_offset,
        ctx.settings.default_batch,
        ctx.settings.task_batch_scan_block,
    );
    if ranges.is_empty() {
        return Ok(Vec::new());
    }

    let new_tasks: Vec<NewScanTask> = ranges
        .into_iter()
        .map(|range| NewScanTask {
            kind: config.scan_kind,
            config_id: config.id,
            contract: config.contract.clone(),
            range,
            created_at: None,
        })
        .collect();
    let created = ctx.store.insert_tasks(&new_tasks).await?;

    tracing::debug!(
        "Created {} {} task(s) for {} up to block {}",
        created.len(),
        config.scan_kind,
        config,
        head.saturating_sub(config.stable_block_offset)
    );
    Ok(created)
}
