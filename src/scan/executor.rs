//! Runs one scan task: fetch, decode, filter and persist its block range.

use std::collections::{HashMap, HashSet};

use alloy::primitives::{Address, B256};

use crate::chain::abi::DecodedEvent;
use crate::chain::{ContractFacade, RawLog, RawTransaction};
use crate::db::{DbError, ScanStore};
use crate::scan::{ScanContext, ScanError};
use crate::types::scan::{
    BlockRange, EventRecord, IndexedRecord, InsertOutcome, ScanConfig, ScanKind, ScanTask,
    TaskStatus, TransactionRecord,
};

/// Decoded records of a block range plus the number that failed to decode.
#[derive(Debug, Default)]
pub struct Collected {
    pub records: Vec<IndexedRecord>,
    pub decode_failures: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecordStats {
    pub created: usize,
    pub conflicts: usize,
    pub failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The task was no longer `Initial` when re-read.
    Skipped(TaskStatus),
    Finished(RecordStats),
    /// Some records failed; the task stays `Initial` for a whole-task retry.
    Retry(RecordStats),
}

/// Fetch and decode everything `config` matches in `range`.
///
/// Transport errors abort the collection. Records that fail to decode are
/// counted and skipped.
pub async fn collect(
    config: &ScanConfig,
    facade: &ContractFacade,
    range: BlockRange,
) -> Result<Collected, ScanError> {
    match config.scan_kind {
        ScanKind::Event => collect_events(config, facade, range).await,
        ScanKind::Transaction => collect_transactions(config, facade, range).await,
    }
}

async fn collect_events(
    config: &ScanConfig,
    facade: &ContractFacade,
    range: BlockRange,
) -> Result<Collected, ScanError> {
    let logs = facade
        .event_logs(range, &config.topic_filter, &config.to_address_filter)
        .await?;

    let from_filter: HashSet<Address> = config.from_address_filter.iter().copied().collect();
    let mut senders: HashMap<B256, Option<Address>> = HashMap::new();
    let mut collected = Collected::default();

    for log in logs {
        let mut from_address = None;
        if !from_filter.is_empty() {
            let sender = match senders.get(&log.transaction_hash) {
                Some(sender) => *sender,
                None => {
                    let sender = facade.sender_of(log.transaction_hash).await?;
                    senders.insert(log.transaction_hash, sender);
                    sender
                }
            };
            match sender {
                Some(sender) if from_filter.contains(&sender) => from_address = Some(sender),
                _ => continue,
            }
        }

        match facade.abi().decode_log(&log.topics, &log.data) {
            Ok(decoded) => collected.records.push(IndexedRecord::Event(event_record(
                &config.contract,
                &log,
                decoded,
                from_address,
            ))),
            Err(e) => {
                tracing::warn!(
                    "Failed to decode log {}:{} for {}: {}",
                    log.transaction_hash,
                    log.log_index,
                    config,
                    e
                );
                collected.decode_failures += 1;
            }
        }
    }
    Ok(collected)
}

async fn collect_transactions(
    config: &ScanConfig,
    facade: &ContractFacade,
    range: BlockRange,
) -> Result<Collected, ScanError> {
    let txs = facade
        .transactions_to(range, &config.to_address_filter)
        .await?;

    let from_filter: HashSet<Address> = config.from_address_filter.iter().copied().collect();
    let mut collected = Collected::default();

    for tx in txs {
        if !from_filter.is_empty() && !from_filter.contains(&tx.from) {
            continue;
        }
        let function_name = match facade
            .abi()
            .resolve_function_name(&tx.input, &config.function_filter)
        {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(
                    "Failed to decode input of transaction {} for {}: {}",
                    tx.hash,
                    config,
                    e
                );
                collected.decode_failures += 1;
                continue;
            }
        };
        if !config.function_filter.is_empty() && !config.function_filter.contains(&function_name)
        {
            continue;
        }
        collected.records.push(IndexedRecord::Transaction(transaction_record(
            &config.contract,
            tx,
            function_name,
        )));
    }
    Ok(collected)
}

pub fn event_record(
    contract: &str,
    log: &RawLog,
    decoded: DecodedEvent,
    from_address: Option<Address>,
) -> EventRecord {
    EventRecord {
        contract: contract.to_string(),
        event_name: decoded.name,
        block_hash: log.block_hash,
        block_number: log.block_number,
        address: log.address,
        from_address,
        transaction_hash: log.transaction_hash,
        transaction_index: log.transaction_index,
        log_index: log.log_index,
        data: decoded.params,
    }
}

fn transaction_record(contract: &str, tx: RawTransaction, function_name: String) -> TransactionRecord {
    TransactionRecord {
        contract: contract.to_string(),
        function_name,
        block_hash: tx.block_hash,
        block_number: tx.block_number,
        from_address: tx.from,
        to_address: tx.to,
        transaction_hash: tx.hash,
        transaction_index: tx.transaction_index,
        value: tx.value,
        input: tx.input,
    }
}

/// Insert-or-ignore a record. Shared by the polling, realtime and
/// reconciliation paths so all of them honour the same idempotency key.
pub async fn persist_record(
    store: &dyn ScanStore,
    record: &IndexedRecord,
    touch_count_remain: i32,
) -> Result<InsertOutcome, DbError> {
    let outcome = store.insert_record(record, touch_count_remain).await?;
    if outcome == InsertOutcome::Conflict {
        tracing::debug!(
            "Ignoring duplicate {} record {} at block {}",
            record.kind(),
            record.key(),
            record.block_number()
        );
    }
    Ok(outcome)
}

/// Execute `task` under `config`.
///
/// The task is re-read first and left alone unless it is still `Initial`. It
/// moves to `Finished` only when every record was decoded and stored. A
/// transport error returns early and leaves the task `Initial`.
pub async fn execute(
    ctx: &ScanContext,
    config: &ScanConfig,
    task: &ScanTask,
) -> Result<TaskOutcome, ScanError> {
    let current = ctx
        .store
        .get_task(task.kind, task.id)
        .await?
        .ok_or(ScanError::TaskNotFound {
            kind: task.kind,
            id: task.id,
        })?;
    if current.status != TaskStatus::Initial {
        return Ok(TaskOutcome::Skipped(current.status));
    }

    let facade = ctx.registry.facade(&current.contract).await?;
    let collected = collect(config, &facade, current.range).await?;

    let mut stats = RecordStats {
        failures: collected.decode_failures,
        ..RecordStats::default()
    };
    for record in &collected.records {
        match persist_record(ctx.store.as_ref(), record, config.max_deliver_retry).await {
            Ok(InsertOutcome::Created(_)) => stats.created += 1,
            Ok(InsertOutcome::Conflict) => stats.conflicts += 1,
            Err(e) => {
                tracing::warn!("Failed to store {} record {}: {}", record.kind(), record.key(), e);
                stats.failures += 1;
            }
        }
    }

    if stats.failures > 0 {
        tracing::warn!(
            "{} left initial after {} failure(s), {} stored",
            current,
            stats.failures,
            stats.created
        );
        return Ok(TaskOutcome::Retry(stats));
    }

    let moved = ctx
        .store
        .transition_task(current.kind, current.id, TaskStatus::Initial, TaskStatus::Finished)
        .await?;
    if !moved {
        tracing::warn!("{} changed status while executing", current);
        return Ok(TaskOutcome::Retry(stats));
    }

    tracing::debug!(
        "{} finished: {} stored, {} duplicate(s)",
        current,
        stats.created,
        stats.conflicts
    );
    Ok(TaskOutcome::Finished(stats))
}

#[cfg(test)]
mod tests {
    use alloy::dyn_abi::DynSolValue;

    use super::*;
    use crate::chain::mock::{swap_input, swap_transaction, transfer_abi, transfer_log, MockChain};
    use crate::db::ScanStore;
    use crate::scan::fixtures::{harness, saved, scan_config, Harness};
    use crate::types::scan::NewScanTask;

    async fn task(h: &Harness, config: &ScanConfig, start: u64, end: u64) -> ScanTask {
        h.store
            .insert_tasks(&[NewScanTask {
                kind: config.scan_kind,
                config_id: config.id,
                contract: config.contract.clone(),
                range: BlockRange::new(start, end),
                created_at: None,
            }])
            .await
            .unwrap()
            .remove(0)
    }

    async fn status(h: &Harness, task: &ScanTask) -> TaskStatus {
        h.store
            .get_task(task.kind, task.id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn test_execute_is_idempotent() {
        let h = harness();
        h.chain.push_log(transfer_log(10, 0));
        h.chain.push_log(transfer_log(20, 1));
        let config = saved(&h, scan_config("token", ScanKind::Event)).await;
        let t = task(&h, &config, 0, 100).await;

        let first = execute(&h.ctx, &config, &t).await.unwrap();
        assert_eq!(
            first,
            TaskOutcome::Finished(RecordStats {
                created: 2,
                conflicts: 0,
                failures: 0
            })
        );

        // Force a replay of the same range.
        h.store
            .transition_task(t.kind, t.id, TaskStatus::Finished, TaskStatus::Initial)
            .await
            .unwrap();
        let second = execute(&h.ctx, &config, &t).await.unwrap();
        assert_eq!(
            second,
            TaskOutcome::Finished(RecordStats {
                created: 0,
                conflicts: 2,
                failures: 0
            })
        );
        assert_eq!(h.store.records(ScanKind::Event).len(), 2);
    }

    #[tokio::test]
    async fn test_stored_event_fields() {
        let h = harness();
        h.chain.push_log(transfer_log(42, 3));
        let config = saved(&h, scan_config("token", ScanKind::Event)).await;
        let t = task(&h, &config, 0, 100).await;
        execute(&h.ctx, &config, &t).await.unwrap();

        let records = h.store.records(ScanKind::Event);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].touch_count_remain, 15);
        let IndexedRecord::Event(event) = &records[0].record else {
            panic!("expected an event record");
        };
        assert_eq!(event.event_name, "Transfer");
        assert_eq!(event.block_number, 42);
        assert_eq!(event.log_index, 3);
        assert_eq!(event.from_address, None);
        assert_eq!(event.data["value"], "1000");
    }

    #[tokio::test]
    async fn test_transport_error_leaves_task_initial() {
        let h = harness();
        h.chain.push_log(transfer_log(10, 0));
        let config = saved(&h, scan_config("token", ScanKind::Event)).await;
        let t = task(&h, &config, 0, 100).await;

        h.chain.fail_next_log_requests(1);
        let result = execute(&h.ctx, &config, &t).await;
        assert!(matches!(result, Err(ScanError::Transport(_))));
        assert_eq!(status(&h, &t).await, TaskStatus::Initial);

        // Next cycle succeeds.
        let retried = execute(&h.ctx, &config, &t).await.unwrap();
        assert!(matches!(retried, TaskOutcome::Finished(_)));
    }

    #[tokio::test]
    async fn test_decode_failure_forces_task_retry() {
        let h = harness();
        h.chain.push_log(transfer_log(10, 0));
        let mut broken = transfer_log(11, 0);
        broken.topics.truncate(1);
        h.chain.push_log(broken);
        let config = saved(&h, scan_config("token", ScanKind::Event)).await;
        let t = task(&h, &config, 0, 100).await;

        let outcome = execute(&h.ctx, &config, &t).await.unwrap();
        assert_eq!(
            outcome,
            TaskOutcome::Retry(RecordStats {
                created: 1,
                conflicts: 0,
                failures: 1
            })
        );
        assert_eq!(status(&h, &t).await, TaskStatus::Initial);
    }

    #[tokio::test]
    async fn test_non_initial_task_skipped() {
        let h = harness();
        let config = saved(&h, scan_config("token", ScanKind::Event)).await;
        let t = task(&h, &config, 0, 100).await;
        h.store
            .transition_task(t.kind, t.id, TaskStatus::Initial, TaskStatus::Closed)
            .await
            .unwrap();

        let outcome = execute(&h.ctx, &config, &t).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Skipped(TaskStatus::Closed));
    }

    #[tokio::test]
    async fn test_from_filter_resolves_senders() {
        let h = harness();
        h.chain.push_log(transfer_log(10, 0));
        h.chain.push_log(transfer_log(10, 1));

        let mut other = scan_config("token", ScanKind::Event);
        other.from_address_filter = vec![Address::repeat_byte(0x99)];
        let other = saved(&h, other).await;
        let t = task(&h, &other, 0, 100).await;
        let outcome = execute(&h.ctx, &other, &t).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Finished(RecordStats { created: 0, .. })));

        let mut matching = scan_config("token", ScanKind::Event);
        matching.from_address_filter = vec![MockChain::SENDER];
        let matching = saved(&h, matching).await;
        let t = task(&h, &matching, 0, 100).await;
        execute(&h.ctx, &matching, &t).await.unwrap();

        let records = h.store.records(ScanKind::Event);
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| matches!(
            &r.record,
            IndexedRecord::Event(e) if e.from_address == Some(MockChain::SENDER)
        )));
    }

    #[tokio::test]
    async fn test_transactions_resolved_through_multicall() {
        let h = harness();
        let abi = transfer_abi();
        let multicall = abi.functions().find(|f| f.name == "multicall").unwrap();
        let mut wrapped = multicall.selector.to_vec();
        wrapped.extend(
            DynSolValue::Tuple(vec![DynSolValue::Array(vec![DynSolValue::Bytes(
                swap_input(7).to_vec(),
            )])])
            .abi_encode_params(),
        );

        h.chain.push_transaction(swap_transaction(10, 0, swap_input(5)));
        h.chain.push_transaction(swap_transaction(11, 0, wrapped.into()));
        let mut elsewhere = swap_transaction(12, 0, swap_input(9));
        elsewhere.to = Some(MockChain::RECEIVER);
        h.chain.push_transaction(elsewhere);

        let mut config = scan_config("token", ScanKind::Transaction);
        config.function_filter = vec!["swap".to_string()];
        let config = saved(&h, config).await;
        let t = task(&h, &config, 0, 100).await;

        let outcome = execute(&h.ctx, &config, &t).await.unwrap();
        assert!(matches!(outcome, TaskOutcome::Finished(RecordStats { created: 2, .. })));

        let names: Vec<String> = h
            .store
            .records(ScanKind::Transaction)
            .into_iter()
            .filter_map(|r| match r.record {
                IndexedRecord::Transaction(t) => Some(t.function_name),
                IndexedRecord::Event(_) => None,
            })
            .collect();
        assert_eq!(names, vec!["swap".to_string(), "swap".to_string()]);
    }
}
