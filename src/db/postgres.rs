//! PostgreSQL implementation of [`ScanStore`].

use std::collections::HashSet;

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::Row;

use crate::db::store::ScanStore;
use crate::db::{DbError, DbPool};
use crate::types::scan::{
    ArchivedTask, AuditLevel, BlockRange, CompletionFlags, ConfigStatus, ConsumerSlot,
    IndexedRecord, InsertOutcome, NewScanTask, RecordKey, RecordRef, RecordStatus, ScanConfig,
    ScanKind, ScanMode, ScanTask, TaskStatus,
};

const CONFIG_COLUMNS: &str = "id, contract, scan_kind, scan_mode, to_address_filter, \
    from_address_filter, topic_filter, function_filter, stable_block_offset, \
    max_deliver_retry, audit_level, scan_group, status";

const TASK_COLUMNS: &str =
    "id, scan_kind, config_id, contract, start_block, end_block, status, created_at, updated_at";

pub struct PgScanStore {
    pool: DbPool,
}

impl PgScanStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn record_table(kind: ScanKind) -> &'static str {
    match kind {
        ScanKind::Event => "contract_events",
        ScanKind::Transaction => "contract_transactions",
    }
}

fn addresses_to_sql(addresses: &[Address]) -> Vec<String> {
    addresses.iter().map(|a| a.to_checksum(None)).collect()
}

fn addresses_from_sql(values: Vec<String>, column: &'static str) -> Result<Vec<Address>, DbError> {
    values
        .into_iter()
        .map(|v| {
            v.parse::<Address>()
                .map_err(|_| DbError::invalid("scan_configs", column, &v))
        })
        .collect()
}

fn config_from_row(row: &Row) -> Result<ScanConfig, DbError> {
    let kind: i16 = row.try_get("scan_kind")?;
    let mode: i16 = row.try_get("scan_mode")?;
    let audit: i16 = row.try_get("audit_level")?;
    let status: i16 = row.try_get("status")?;
    let offset: i64 = row.try_get("stable_block_offset")?;

    Ok(ScanConfig {
        id: row.try_get("id")?,
        contract: row.try_get("contract")?,
        scan_kind: ScanKind::from_i16(kind)
            .ok_or_else(|| DbError::invalid("scan_configs", "scan_kind", kind))?,
        mode: ScanMode::from_i16(mode)
            .ok_or_else(|| DbError::invalid("scan_configs", "scan_mode", mode))?,
        to_address_filter: addresses_from_sql(row.try_get("to_address_filter")?, "to_address_filter")?,
        from_address_filter: addresses_from_sql(
            row.try_get("from_address_filter")?,
            "from_address_filter",
        )?,
        topic_filter: row.try_get("topic_filter")?,
        function_filter: row.try_get("function_filter")?,
        stable_block_offset: u64_from_sql(offset, "scan_configs", "stable_block_offset")?,
        max_deliver_retry: row.try_get("max_deliver_retry")?,
        audit_level: AuditLevel::from_i16(audit)
            .ok_or_else(|| DbError::invalid("scan_configs", "audit_level", audit))?,
        scan_group: row.try_get("scan_group")?,
        status: ConfigStatus::from_i16(status)
            .ok_or_else(|| DbError::invalid("scan_configs", "status", status))?,
    })
}

fn task_from_row(row: &Row) -> Result<ScanTask, DbError> {
    let kind: i16 = row.try_get("scan_kind")?;
    let status: i16 = row.try_get("status")?;
    let start: i64 = row.try_get("start_block")?;
    let end: i64 = row.try_get("end_block")?;

    Ok(ScanTask {
        id: row.try_get("id")?,
        kind: ScanKind::from_i16(kind)
            .ok_or_else(|| DbError::invalid("scan_tasks", "scan_kind", kind))?,
        config_id: row.try_get("config_id")?,
        contract: row.try_get("contract")?,
        range: BlockRange::new(
            u64_from_sql(start, "scan_tasks", "start_block")?,
            u64_from_sql(end, "scan_tasks", "end_block")?,
        ),
        status: TaskStatus::from_i16(status)
            .ok_or_else(|| DbError::invalid("scan_tasks", "status", status))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tasks_from_rows(rows: &[Row]) -> Result<Vec<ScanTask>, DbError> {
    rows.iter().map(task_from_row).collect()
}

/// Block numbers and indexes are BIGINT columns; a negative value is corrupt.
fn u64_from_sql(value: i64, table: &'static str, column: &'static str) -> Result<u64, DbError> {
    u64::try_from(value).map_err(|_| DbError::invalid(table, column, value))
}

fn b256_from_sql(bytes: &[u8], table: &'static str) -> Result<B256, DbError> {
    B256::try_from(bytes).map_err(|_| DbError::invalid(table, "transaction_hash", hex::encode(bytes)))
}

#[async_trait]
impl ScanStore for PgScanStore {
    async fn create_config(&self, config: ScanConfig) -> Result<ScanConfig, DbError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        if config.is_enabled() {
            tx.execute(
                "UPDATE scan_configs SET status = $3, updated_at = NOW()
                 WHERE contract = $1 AND scan_kind = $2 AND status = $4",
                &[
                    &config.contract,
                    &config.scan_kind.as_i16(),
                    &ConfigStatus::Disabled.as_i16(),
                    &ConfigStatus::Enabled.as_i16(),
                ],
            )
            .await?;
        }

        let sql = format!(
            "INSERT INTO scan_configs (contract, scan_kind, scan_mode, to_address_filter,
                from_address_filter, topic_filter, function_filter, stable_block_offset,
                max_deliver_retry, audit_level, scan_group, status)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             RETURNING {}",
            CONFIG_COLUMNS
        );
        let row = tx
            .query_one(
                &sql,
                &[
                    &config.contract,
                    &config.scan_kind.as_i16(),
                    &config.mode.as_i16(),
                    &addresses_to_sql(&config.to_address_filter),
                    &addresses_to_sql(&config.from_address_filter),
                    &config.topic_filter,
                    &config.function_filter,
                    &(config.stable_block_offset as i64),
                    &config.max_deliver_retry,
                    &config.audit_level.as_i16(),
                    &config.scan_group,
                    &config.status.as_i16(),
                ],
            )
            .await?;
        let created = config_from_row(&row)?;

        tx.commit().await?;
        Ok(created)
    }

    async fn update_config(&self, config: &ScanConfig) -> Result<(), DbError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        if config.is_enabled() {
            tx.execute(
                "UPDATE scan_configs SET status = $4, updated_at = NOW()
                 WHERE contract = $1 AND scan_kind = $2 AND id <> $3 AND status = $5",
                &[
                    &config.contract,
                    &config.scan_kind.as_i16(),
                    &config.id,
                    &ConfigStatus::Disabled.as_i16(),
                    &ConfigStatus::Enabled.as_i16(),
                ],
            )
            .await?;
        }

        let updated = tx
            .execute(
                "UPDATE scan_configs SET contract = $2, scan_kind = $3, scan_mode = $4,
                    to_address_filter = $5, from_address_filter = $6, topic_filter = $7,
                    function_filter = $8, stable_block_offset = $9, max_deliver_retry = $10,
                    audit_level = $11, scan_group = $12, status = $13, updated_at = NOW()
                 WHERE id = $1",
                &[
                    &config.id,
                    &config.contract,
                    &config.scan_kind.as_i16(),
                    &config.mode.as_i16(),
                    &addresses_to_sql(&config.to_address_filter),
                    &addresses_to_sql(&config.from_address_filter),
                    &config.topic_filter,
                    &config.function_filter,
                    &(config.stable_block_offset as i64),
                    &config.max_deliver_retry,
                    &config.audit_level.as_i16(),
                    &config.scan_group,
                    &config.status.as_i16(),
                ],
            )
            .await?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("scan config {}", config.id)));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn disable_config(&self, id: i64) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE scan_configs SET status = $2, updated_at = NOW() WHERE id = $1",
                &[&id, &ConfigStatus::Disabled.as_i16()],
            )
            .await?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("scan config {}", id)));
        }
        Ok(())
    }

    async fn get_config(&self, id: i64) -> Result<Option<ScanConfig>, DbError> {
        let client = self.pool.get().await?;
        let sql = format!("SELECT {} FROM scan_configs WHERE id = $1", CONFIG_COLUMNS);
        client
            .query_opt(&sql, &[&id])
            .await?
            .as_ref()
            .map(config_from_row)
            .transpose()
    }

    async fn configs_for(&self, contract: &str, kind: ScanKind) -> Result<Vec<ScanConfig>, DbError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {} FROM scan_configs WHERE contract = $1 AND scan_kind = $2 ORDER BY id",
            CONFIG_COLUMNS
        );
        let rows = client.query(&sql, &[&contract, &kind.as_i16()]).await?;
        rows.iter().map(config_from_row).collect()
    }

    async fn enabled_configs(&self, kind: ScanKind) -> Result<Vec<ScanConfig>, DbError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {} FROM scan_configs WHERE scan_kind = $1 AND status = $2 ORDER BY id",
            CONFIG_COLUMNS
        );
        let rows = client
            .query(&sql, &[&kind.as_i16(), &ConfigStatus::Enabled.as_i16()])
            .await?;
        rows.iter().map(config_from_row).collect()
    }

    async fn last_task(
        &self,
        kind: ScanKind,
        config_id: i64,
        contract: &str,
    ) -> Result<Option<ScanTask>, DbError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {} FROM scan_tasks
             WHERE scan_kind = $1 AND config_id = $2 AND contract = $3
             ORDER BY end_block DESC LIMIT 1",
            TASK_COLUMNS
        );
        client
            .query_opt(&sql, &[&kind.as_i16(), &config_id, &contract])
            .await?
            .as_ref()
            .map(task_from_row)
            .transpose()
    }

    async fn insert_tasks(&self, tasks: &[NewScanTask]) -> Result<Vec<ScanTask>, DbError> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let stmt = tx
            .prepare(&format!(
                "INSERT INTO scan_tasks (scan_kind, config_id, contract, start_block, end_block,
                    status, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, COALESCE($7, NOW()), NOW())
                 RETURNING {}",
                TASK_COLUMNS
            ))
            .await?;

        let mut created = Vec::with_capacity(tasks.len());
        for task in tasks {
            let row = tx
                .query_one(
                    &stmt,
                    &[
                        &task.kind.as_i16(),
                        &task.config_id,
                        &task.contract,
                        &(task.range.start as i64),
                        &(task.range.end as i64),
                        &TaskStatus::Initial.as_i16(),
                        &task.created_at,
                    ],
                )
                .await?;
            created.push(task_from_row(&row)?);
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn get_task(&self, kind: ScanKind, id: i64) -> Result<Option<ScanTask>, DbError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {} FROM scan_tasks WHERE scan_kind = $1 AND id = $2",
            TASK_COLUMNS
        );
        client
            .query_opt(&sql, &[&kind.as_i16(), &id])
            .await?
            .as_ref()
            .map(task_from_row)
            .transpose()
    }

    async fn initial_tasks(&self, kind: ScanKind, contract: &str) -> Result<Vec<ScanTask>, DbError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {} FROM scan_tasks
             WHERE scan_kind = $1 AND contract = $2 AND status = $3
             ORDER BY start_block",
            TASK_COLUMNS
        );
        let rows = client
            .query(
                &sql,
                &[&kind.as_i16(), &contract, &TaskStatus::Initial.as_i16()],
            )
            .await?;
        tasks_from_rows(&rows)
    }

    async fn outstanding_tasks(&self, kind: ScanKind) -> Result<Vec<ScanTask>, DbError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {} FROM scan_tasks WHERE scan_kind = $1 AND status = $2
             ORDER BY created_at, id",
            TASK_COLUMNS
        );
        let rows = client
            .query(&sql, &[&kind.as_i16(), &TaskStatus::Initial.as_i16()])
            .await?;
        tasks_from_rows(&rows)
    }

    async fn transition_task(
        &self,
        kind: ScanKind,
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<bool, DbError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE scan_tasks SET status = $4, updated_at = NOW()
                 WHERE scan_kind = $1 AND id = $2 AND status = $3",
                &[&kind.as_i16(), &id, &from.as_i16(), &to.as_i16()],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn audit_candidates(
        &self,
        kind: ScanKind,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ScanTask>, DbError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "SELECT {} FROM scan_tasks
             WHERE scan_kind = $1 AND created_at >= $2 AND created_at < $3
               AND status IN ($4, $5)
             ORDER BY end_block, id",
            TASK_COLUMNS
        );
        let rows = client
            .query(
                &sql,
                &[
                    &kind.as_i16(),
                    &start,
                    &end,
                    &TaskStatus::Initial.as_i16(),
                    &TaskStatus::Finished.as_i16(),
                ],
            )
            .await?;
        tasks_from_rows(&rows)
    }

    async fn reopen_tasks_covering(
        &self,
        kind: ScanKind,
        task_ids: &[i64],
        block: u64,
    ) -> Result<u64, DbError> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE scan_tasks SET status = $4, updated_at = NOW()
                 WHERE scan_kind = $1 AND id = ANY($2) AND status = $5
                   AND start_block <= $3 AND end_block > $3",
                &[
                    &kind.as_i16(),
                    &task_ids,
                    &(block as i64),
                    &TaskStatus::Initial.as_i16(),
                    &TaskStatus::Finished.as_i16(),
                ],
            )
            .await?;
        Ok(updated)
    }

    async fn archive_tasks(
        &self,
        kind: ScanKind,
        config_id: i64,
        contract: &str,
        merged: &[i64],
        archived: ArchivedTask,
    ) -> Result<ScanTask, DbError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // Lock the merged rows so a concurrent reopen waits for the merge.
        let locked = tx
            .query(
                "SELECT id FROM scan_tasks
                 WHERE scan_kind = $1 AND id = ANY($2) AND status = $3
                 FOR UPDATE",
                &[&kind.as_i16(), &merged, &TaskStatus::Finished.as_i16()],
            )
            .await?;
        if locked.len() != merged.len() {
            return Err(DbError::Concurrent(format!(
                "expected {} finished tasks to merge, locked {}",
                merged.len(),
                locked.len()
            )));
        }

        let others: Vec<i64> = merged
            .iter()
            .copied()
            .filter(|id| *id != archived.template_id)
            .collect();
        let deleted = tx
            .execute(
                "DELETE FROM scan_tasks
                 WHERE scan_kind = $1 AND id = ANY($2) AND config_id = $3 AND contract = $4
                   AND status = $5",
                &[
                    &kind.as_i16(),
                    &others,
                    &config_id,
                    &contract,
                    &TaskStatus::Finished.as_i16(),
                ],
            )
            .await?;
        if deleted as usize != others.len() {
            // Dropping the transaction rolls it back.
            return Err(DbError::Concurrent(format!(
                "expected to merge {} tasks, found {} still finished",
                others.len(),
                deleted
            )));
        }

        let sql = format!(
            "UPDATE scan_tasks
             SET start_block = $3, end_block = $4, status = $5, created_at = $6, updated_at = $7
             WHERE scan_kind = $1 AND id = $2 AND status = $8
             RETURNING {}",
            TASK_COLUMNS
        );
        let row = tx
            .query_opt(
                &sql,
                &[
                    &kind.as_i16(),
                    &archived.template_id,
                    &(archived.range.start as i64),
                    &(archived.range.end as i64),
                    &TaskStatus::Archived.as_i16(),
                    &archived.created_at,
                    &archived.updated_at,
                    &TaskStatus::Finished.as_i16(),
                ],
            )
            .await?
            .ok_or_else(|| {
                DbError::Concurrent(format!("template task {} changed", archived.template_id))
            })?;
        let task = task_from_row(&row)?;

        tx.commit().await?;
        Ok(task)
    }

    async fn insert_record(
        &self,
        record: &IndexedRecord,
        touch_count_remain: i32,
    ) -> Result<InsertOutcome, DbError> {
        let client = self.pool.get().await?;
        let row = match record {
            IndexedRecord::Event(e) => {
                client
                    .query_opt(
                        "INSERT INTO contract_events (contract, event_name, block_hash,
                            block_number, address, from_address, transaction_hash,
                            transaction_index, log_index, data, touch_count_remain)
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                         ON CONFLICT (transaction_hash, log_index) DO NOTHING
                         RETURNING id",
                        &[
                            &e.contract,
                            &e.event_name,
                            &e.block_hash.as_slice(),
                            &(e.block_number as i64),
                            &e.address.as_slice(),
                            &e.from_address.map(|a| a.to_vec()),
                            &e.transaction_hash.as_slice(),
                            &(e.transaction_index as i64),
                            &(e.log_index as i64),
                            &e.data,
                            &touch_count_remain,
                        ],
                    )
                    .await?
            }
            IndexedRecord::Transaction(t) => {
                client
                    .query_opt(
                        "INSERT INTO contract_transactions (contract, function_name, block_hash,
                            block_number, from_address, to_address, transaction_hash,
                            transaction_index, value, input, touch_count_remain)
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9::text::numeric, $10, $11)
                         ON CONFLICT (transaction_hash, function_name) DO NOTHING
                         RETURNING id",
                        &[
                            &t.contract,
                            &t.function_name,
                            &t.block_hash.as_slice(),
                            &(t.block_number as i64),
                            &t.from_address.as_slice(),
                            &t.to_address.map(|a| a.to_vec()),
                            &t.transaction_hash.as_slice(),
                            &(t.transaction_index as i64),
                            &t.value.to_string(),
                            &t.input.to_vec(),
                            &touch_count_remain,
                        ],
                    )
                    .await?
            }
        };

        Ok(match row {
            Some(row) => InsertOutcome::Created(row.try_get("id")?),
            None => InsertOutcome::Conflict,
        })
    }

    async fn existing_keys(&self, keys: &[RecordKey]) -> Result<HashSet<RecordKey>, DbError> {
        let wanted: HashSet<&RecordKey> = keys.iter().collect();
        let mut event_hashes: HashSet<Vec<u8>> = HashSet::new();
        let mut tx_hashes: HashSet<Vec<u8>> = HashSet::new();
        for key in keys {
            match key {
                RecordKey::Event { transaction_hash, .. } => {
                    event_hashes.insert(transaction_hash.to_vec());
                }
                RecordKey::Transaction { transaction_hash, .. } => {
                    tx_hashes.insert(transaction_hash.to_vec());
                }
            }
        }

        let client = self.pool.get().await?;
        let mut found = HashSet::new();

        if !event_hashes.is_empty() {
            let hashes: Vec<Vec<u8>> = event_hashes.into_iter().collect();
            let rows = client
                .query(
                    "SELECT transaction_hash, log_index FROM contract_events
                     WHERE transaction_hash = ANY($1)",
                    &[&hashes],
                )
                .await?;
            for row in rows {
                let hash: Vec<u8> = row.try_get("transaction_hash")?;
                let log_index: i64 = row.try_get("log_index")?;
                let key = RecordKey::Event {
                    transaction_hash: b256_from_sql(&hash, "contract_events")?,
                    log_index: u64_from_sql(log_index, "contract_events", "log_index")?,
                };
                if wanted.contains(&key) {
                    found.insert(key);
                }
            }
        }

        if !tx_hashes.is_empty() {
            let hashes: Vec<Vec<u8>> = tx_hashes.into_iter().collect();
            let rows = client
                .query(
                    "SELECT transaction_hash, function_name FROM contract_transactions
                     WHERE transaction_hash = ANY($1)",
                    &[&hashes],
                )
                .await?;
            for row in rows {
                let hash: Vec<u8> = row.try_get("transaction_hash")?;
                let key = RecordKey::Transaction {
                    transaction_hash: b256_from_sql(&hash, "contract_transactions")?,
                    function_name: row.try_get("function_name")?,
                };
                if wanted.contains(&key) {
                    found.insert(key);
                }
            }
        }

        Ok(found)
    }

    async fn records_due_for_touch(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<Vec<RecordRef>, DbError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT $2::SMALLINT AS kind, id, created_at, touch_count_remain
                   FROM contract_events
                  WHERE status = $4 AND touch_count_remain > 0 AND created_at < $1
                 UNION ALL
                 SELECT $3::SMALLINT AS kind, id, created_at, touch_count_remain
                   FROM contract_transactions
                  WHERE status = $4 AND touch_count_remain > 0 AND created_at < $1
                 ORDER BY created_at, id",
                &[
                    &created_before,
                    &ScanKind::Event.as_i16(),
                    &ScanKind::Transaction.as_i16(),
                    &RecordStatus::Initial.as_i16(),
                ],
            )
            .await?;

        rows.iter()
            .map(|row| {
                let kind: i16 = row.try_get("kind")?;
                Ok::<_, DbError>(RecordRef {
                    kind: ScanKind::from_i16(kind)
                        .ok_or_else(|| DbError::invalid("records", "kind", kind))?,
                    id: row.try_get("id")?,
                    created_at: row.try_get("created_at")?,
                    touch_count_remain: row.try_get("touch_count_remain")?,
                })
            })
            .collect()
    }

    async fn touch_record(&self, kind: ScanKind, id: i64) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "UPDATE {} SET touch_count_remain = touch_count_remain - 1
             WHERE id = $1 AND touch_count_remain > 0",
            record_table(kind)
        );
        client.execute(&sql, &[&id]).await?;
        Ok(())
    }

    async fn set_record_status(
        &self,
        kind: ScanKind,
        id: i64,
        status: RecordStatus,
    ) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "UPDATE {} SET status = $2, updated_at = NOW() WHERE id = $1",
            record_table(kind)
        );
        let updated = client.execute(&sql, &[&id, &status.as_i16()]).await?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("{} record {}", kind, id)));
        }
        Ok(())
    }

    async fn set_completion_flags(
        &self,
        kind: ScanKind,
        id: i64,
        flags: CompletionFlags,
    ) -> Result<(), DbError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "UPDATE {} SET completion = $2, updated_at = NOW() WHERE id = $1",
            record_table(kind)
        );
        let updated = client
            .execute(&sql, &[&id, &(flags.bits() as i16)])
            .await?;
        if updated == 0 {
            return Err(DbError::NotFound(format!("{} record {}", kind, id)));
        }
        Ok(())
    }

    async fn clear_completion_flag(
        &self,
        kind: ScanKind,
        id: i64,
        slot: ConsumerSlot,
    ) -> Result<Option<CompletionFlags>, DbError> {
        let client = self.pool.get().await?;
        let sql = format!(
            "UPDATE {} SET
                completion = completion & ~$2::SMALLINT,
                status = CASE WHEN (completion & ~$2::SMALLINT) = 0 THEN $3 ELSE status END,
                updated_at = NOW()
             WHERE id = $1
             RETURNING completion",
            record_table(kind)
        );
        let mask = (1i16) << slot.index();
        let row = client
            .query_opt(&sql, &[&id, &mask, &RecordStatus::ProcessedOnce.as_i16()])
            .await?;
        row.map(|row| {
            let bits: i16 = row.try_get("completion")?;
            let bits = u8::try_from(bits)
                .map_err(|_| DbError::invalid(record_table(kind), "completion", bits))?;
            Ok::<_, DbError>(CompletionFlags::from_bits(bits))
        })
        .transpose()
    }
}
