//! In-memory [`ScanStore`] for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::store::ScanStore;
use crate::db::DbError;
use crate::types::scan::{
    ArchivedTask, CompletionFlags, ConsumerSlot, IndexedRecord, InsertOutcome, NewScanTask,
    RecordKey, RecordRef, RecordStatus, ScanConfig, ScanKind, ScanTask, TaskStatus,
};

#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub id: i64,
    pub record: IndexedRecord,
    pub status: RecordStatus,
    pub completion: CompletionFlags,
    pub touch_count_remain: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    next_id: i64,
    configs: BTreeMap<i64, ScanConfig>,
    tasks: BTreeMap<i64, ScanTask>,
    records: HashMap<RecordKey, StoredRecord>,
}

impl State {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn disable_siblings(&mut self, config: &ScanConfig) {
        if !config.is_enabled() {
            return;
        }
        for other in self.configs.values_mut() {
            if other.id != config.id
                && other.contract == config.contract
                && other.scan_kind == config.scan_kind
            {
                other.status = crate::types::scan::ConfigStatus::Disabled;
            }
        }
    }

    fn record_mut(&mut self, kind: ScanKind, id: i64) -> Option<&mut StoredRecord> {
        self.records
            .values_mut()
            .find(|r| r.id == id && r.record.kind() == kind)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configs_snapshot(&self) -> Vec<ScanConfig> {
        self.state.lock().unwrap().configs.values().cloned().collect()
    }

    pub fn tasks(&self, kind: ScanKind) -> Vec<ScanTask> {
        let state = self.state.lock().unwrap();
        let mut tasks: Vec<ScanTask> = state
            .tasks
            .values()
            .filter(|t| t.kind == kind)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.range.start, t.id));
        tasks
    }

    pub fn records(&self, kind: ScanKind) -> Vec<StoredRecord> {
        let state = self.state.lock().unwrap();
        let mut records: Vec<StoredRecord> = state
            .records
            .values()
            .filter(|r| r.record.kind() == kind)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Insert a task with an explicit status and timestamp.
    pub fn seed_task(
        &self,
        kind: ScanKind,
        config_id: i64,
        contract: &str,
        range: (u64, u64),
        status: TaskStatus,
        created_at: DateTime<Utc>,
    ) -> ScanTask {
        let mut state = self.state.lock().unwrap();
        let task = ScanTask {
            id: state.next_id(),
            kind,
            config_id,
            contract: contract.to_string(),
            range: crate::types::scan::BlockRange::new(range.0, range.1),
            status,
            created_at,
            updated_at: created_at,
        };
        state.tasks.insert(task.id, task.clone());
        task
    }

    pub fn backdate_record(&self, kind: ScanKind, id: i64, created_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.record_mut(kind, id) {
            record.created_at = created_at;
        }
    }
}

#[async_trait]
impl ScanStore for MemoryStore {
    async fn create_config(&self, mut config: ScanConfig) -> Result<ScanConfig, DbError> {
        let mut state = self.state.lock().unwrap();
        config.id = state.next_id();
        state.disable_siblings(&config);
        state.configs.insert(config.id, config.clone());
        Ok(config)
    }

    async fn update_config(&self, config: &ScanConfig) -> Result<(), DbError> {
        let mut state = self.state.lock().unwrap();
        if !state.configs.contains_key(&config.id) {
            return Err(DbError::NotFound(format!("scan config {}", config.id)));
        }
        state.disable_siblings(config);
        state.configs.insert(config.id, config.clone());
        Ok(())
    }

    async fn disable_config(&self, id: i64) -> Result<(), DbError> {
        let mut state = self.state.lock().unwrap();
        let config = state
            .configs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("scan config {}", id)))?;
        config.status = crate::types::scan::ConfigStatus::Disabled;
        Ok(())
    }

    async fn get_config(&self, id: i64) -> Result<Option<ScanConfig>, DbError> {
        Ok(self.state.lock().unwrap().configs.get(&id).cloned())
    }

    async fn configs_for(&self, contract: &str, kind: ScanKind) -> Result<Vec<ScanConfig>, DbError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .configs
            .values()
            .filter(|c| c.contract == contract && c.scan_kind == kind)
            .cloned()
            .collect())
    }

    async fn enabled_configs(&self, kind: ScanKind) -> Result<Vec<ScanConfig>, DbError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .configs
            .values()
            .filter(|c| c.scan_kind == kind && c.is_enabled())
            .cloned()
            .collect())
    }

    async fn last_task(
        &self,
        kind: ScanKind,
        config_id: i64,
        contract: &str,
    ) -> Result<Option<ScanTask>, DbError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.kind == kind && t.config_id == config_id && t.contract == contract)
            .max_by_key(|t| t.range.end)
            .cloned())
    }

    async fn insert_tasks(&self, tasks: &[NewScanTask]) -> Result<Vec<ScanTask>, DbError> {
        let mut state = self.state.lock().unwrap();
        let now = Utc::now();
        let mut created = Vec::with_capacity(tasks.len());
        for new in tasks {
            let task = ScanTask {
                id: state.next_id(),
                kind: new.kind,
                config_id: new.config_id,
                contract: new.contract.clone(),
                range: new.range,
                status: TaskStatus::Initial,
                created_at: new.created_at.unwrap_or(now),
                updated_at: now,
            };
            state.tasks.insert(task.id, task.clone());
            created.push(task);
        }
        Ok(created)
    }

    async fn get_task(&self, kind: ScanKind, id: i64) -> Result<Option<ScanTask>, DbError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .tasks
            .get(&id)
            .filter(|t| t.kind == kind)
            .cloned())
    }

    async fn initial_tasks(&self, kind: ScanKind, contract: &str) -> Result<Vec<ScanTask>, DbError> {
        let mut tasks: Vec<ScanTask> = self
            .state
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.kind == kind && t.contract == contract && t.status == TaskStatus::Initial)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.range.start);
        Ok(tasks)
    }

    async fn outstanding_tasks(&self, kind: ScanKind) -> Result<Vec<ScanTask>, DbError> {
        let mut tasks: Vec<ScanTask> = self
            .state
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| t.kind == kind && t.status == TaskStatus::Initial)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        Ok(tasks)
    }

    async fn transition_task(
        &self,
        kind: ScanKind,
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool, DbError> {
        let mut state = self.state.lock().unwrap();
        match state.tasks.get_mut(&id) {
            Some(task) if task.kind == kind && task.status == from => {
                task.status = to;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn audit_candidates(
        &self,
        kind: ScanKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScanTask>, DbError> {
        let mut tasks: Vec<ScanTask> = self
            .state
            .lock()
            .unwrap()
            .tasks
            .values()
            .filter(|t| {
                t.kind == kind
                    && t.created_at >= start
                    && t.created_at < end
                    && matches!(t.status, TaskStatus::Initial | TaskStatus::Finished)
            })
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.range.end, t.id));
        Ok(tasks)
    }

    async fn reopen_tasks_covering(
        &self,
        kind: ScanKind,
        task_ids: &[i64],
        block: u64,
    ) -> Result<u64, DbError> {
        let mut state = self.state.lock().unwrap();
        let mut reopened = 0;
        for id in task_ids {
            if let Some(task) = state.tasks.get_mut(id) {
                if task.kind == kind
                    && task.status == TaskStatus::Finished
                    && task.range.contains(block)
                {
                    task.status = TaskStatus::Initial;
                    reopened += 1;
                }
            }
        }
        Ok(reopened)
    }

    async fn archive_tasks(
        &self,
        kind: ScanKind,
        config_id: i64,
        contract: &str,
        merged: &[i64],
        archived: ArchivedTask,
    ) -> Result<ScanTask, DbError> {
        let mut state = self.state.lock().unwrap();
        let all_finished = merged.iter().all(|id| {
            state.tasks.get(id).is_some_and(|t| {
                t.kind == kind
                    && t.config_id == config_id
                    && t.contract == contract
                    && t.status == TaskStatus::Finished
            })
        });
        if !all_finished || !merged.contains(&archived.template_id) {
            return Err(DbError::Concurrent("merged tasks changed".to_string()));
        }

        for id in merged {
            state.tasks.remove(id);
        }
        let task = ScanTask {
            id: archived.template_id,
            kind,
            config_id,
            contract: contract.to_string(),
            range: archived.range,
            status: TaskStatus::Archived,
            created_at: archived.created_at,
            updated_at: archived.updated_at,
        };
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn insert_record(
        &self,
        record: &IndexedRecord,
        touch_count_remain: i32,
    ) -> Result<InsertOutcome, DbError> {
        let mut state = self.state.lock().unwrap();
        let key = record.key();
        if state.records.contains_key(&key) {
            return Ok(InsertOutcome::Conflict);
        }
        let id = state.next_id();
        state.records.insert(
            key,
            StoredRecord {
                id,
                record: record.clone(),
                status: RecordStatus::Initial,
                completion: CompletionFlags::default(),
                touch_count_remain,
                created_at: Utc::now(),
            },
        );
        Ok(InsertOutcome::Created(id))
    }

    async fn existing_keys(&self, keys: &[RecordKey]) -> Result<HashSet<RecordKey>, DbError> {
        let state = self.state.lock().unwrap();
        Ok(keys
            .iter()
            .filter(|k| state.records.contains_key(k))
            .cloned()
            .collect())
    }

    async fn records_due_for_touch(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<RecordRef>, DbError> {
        let state = self.state.lock().unwrap();
        let mut due: Vec<RecordRef> = state
            .records
            .values()
            .filter(|r| {
                r.status == RecordStatus::Initial
                    && r.touch_count_remain > 0
                    && r.created_at < created_before
            })
            .map(|r| RecordRef {
                kind: r.record.kind(),
                id: r.id,
                created_at: r.created_at,
                touch_count_remain: r.touch_count_remain,
            })
            .collect();
        due.sort_by_key(|r| (r.created_at, r.id));
        Ok(due)
    }

    async fn touch_record(&self, kind: ScanKind, id: i64) -> Result<(), DbError> {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.record_mut(kind, id) {
            if record.touch_count_remain > 0 {
                record.touch_count_remain -= 1;
            }
        }
        Ok(())
    }

    async fn set_record_status(
        &self,
        kind: ScanKind,
        id: i64,
        status: RecordStatus,
    ) -> Result<(), DbError> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .record_mut(kind, id)
            .ok_or_else(|| DbError::NotFound(format!("{} record {}", kind, id)))?;
        record.status = status;
        Ok(())
    }

    async fn set_completion_flags(
        &self,
        kind: ScanKind,
        id: i64,
        flags: CompletionFlags,
    ) -> Result<(), DbError> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .record_mut(kind, id)
            .ok_or_else(|| DbError::NotFound(format!("{} record {}", kind, id)))?;
        record.completion = flags;
        Ok(())
    }

    async fn clear_completion_flag(
        &self,
        kind: ScanKind,
        id: i64,
        slot: ConsumerSlot,
    ) -> Result<Option<CompletionFlags>, DbError> {
        let mut state = self.state.lock().unwrap();
        let Some(record) = state.record_mut(kind, id) else {
            return Ok(None);
        };
        record.completion = record.completion.mark_done(slot);
        if record.completion.is_complete() {
            record.status = RecordStatus::ProcessedOnce;
        }
        Ok(Some(record.completion))
    }
}
