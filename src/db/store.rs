use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::DbError;
use crate::types::scan::{
    ArchivedTask, CompletionFlags, ConsumerSlot, IndexedRecord, InsertOutcome, NewScanTask,
    RecordKey, RecordRef, RecordStatus, ScanConfig, ScanKind, ScanTask, TaskStatus,
};

/// Persistence for scan configs, scan tasks and indexed records.
///
/// Every method is a single atomic unit of work. Implementations must enforce
/// record idempotency keys at the storage level so that concurrent inserts of
/// the same record from the polling and realtime paths leave exactly one row.
#[async_trait]
pub trait ScanStore: Send + Sync {
    /// Insert a config, ignoring `config.id`. If the new config is enabled,
    /// every other config for the same (contract, kind) is disabled in the
    /// same transaction.
    async fn create_config(&self, config: ScanConfig) -> Result<ScanConfig, DbError>;

    /// Persist changes to an existing config with the same sibling rule as
    /// [`ScanStore::create_config`].
    async fn update_config(&self, config: &ScanConfig) -> Result<(), DbError>;

    /// Soft delete: the row stays so its tasks keep resolving.
    async fn disable_config(&self, id: i64) -> Result<(), DbError>;

    async fn get_config(&self, id: i64) -> Result<Option<ScanConfig>, DbError>;

    async fn configs_for(&self, contract: &str, kind: ScanKind) -> Result<Vec<ScanConfig>, DbError>;

    /// Enabled configs of one kind, ascending by id.
    async fn enabled_configs(&self, kind: ScanKind) -> Result<Vec<ScanConfig>, DbError>;

    /// Task with the highest end block for a (config, contract) pair.
    async fn last_task(
        &self,
        kind: ScanKind,
        config_id: i64,
        contract: &str,
    ) -> Result<Option<ScanTask>, DbError>;

    /// Bulk insert in one transaction. Tasks start out `Initial`.
    async fn insert_tasks(&self, tasks: &[NewScanTask]) -> Result<Vec<ScanTask>, DbError>;

    async fn get_task(&self, kind: ScanKind, id: i64) -> Result<Option<ScanTask>, DbError>;

    /// `Initial` tasks for a contract, ascending by start block.
    async fn initial_tasks(&self, kind: ScanKind, contract: &str) -> Result<Vec<ScanTask>, DbError>;

    /// Every `Initial` task of a kind, oldest first.
    async fn outstanding_tasks(&self, kind: ScanKind) -> Result<Vec<ScanTask>, DbError>;

    /// Compare-and-set on task status. Returns false when the task was not in
    /// `from`.
    async fn transition_task(
        &self,
        kind: ScanKind,
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool, DbError>;

    /// `Initial` and `Finished` tasks created in `[start, end)`, ascending by
    /// end block.
    async fn audit_candidates(
        &self,
        kind: ScanKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScanTask>, DbError>;

    /// Move the tasks among `task_ids` whose range contains `block` from
    /// `Finished` back to `Initial`. Returns how many were reopened.
    async fn reopen_tasks_covering(
        &self,
        kind: ScanKind,
        task_ids: &[i64],
        block: u64,
    ) -> Result<u64, DbError>;

    /// Atomically delete `merged` and write the archived replacement, which
    /// keeps the id of `archived.template_id`.
    async fn archive_tasks(
        &self,
        kind: ScanKind,
        config_id: i64,
        contract: &str,
        merged: &[i64],
        archived: ArchivedTask,
    ) -> Result<ScanTask, DbError>;

    /// Insert-or-ignore on the record's idempotency key.
    async fn insert_record(
        &self,
        record: &IndexedRecord,
        touch_count_remain: i32,
    ) -> Result<InsertOutcome, DbError>;

    /// Subset of `keys` already stored.
    async fn existing_keys(&self, keys: &[RecordKey]) -> Result<HashSet<RecordKey>, DbError>;

    /// `Initial` records of both kinds with touches left, created before
    /// `created_before`, oldest first.
    async fn records_due_for_touch(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<RecordRef>, DbError>;

    /// Decrement the remaining touch count. Only the counter changes.
    async fn touch_record(&self, kind: ScanKind, id: i64) -> Result<(), DbError>;

    async fn set_record_status(
        &self,
        kind: ScanKind,
        id: i64,
        status: RecordStatus,
    ) -> Result<(), DbError>;

    async fn set_completion_flags(
        &self,
        kind: ScanKind,
        id: i64,
        flags: CompletionFlags,
    ) -> Result<(), DbError>;

    /// Clear one consumer's flag; marks the record `ProcessedOnce` when no
    /// flag remains. Returns the remaining flags, or `None` for an unknown
    /// record.
    async fn clear_completion_flag(
        &self,
        kind: ScanKind,
        id: i64,
        slot: ConsumerSlot,
    ) -> Result<Option<CompletionFlags>, DbError>;
}
