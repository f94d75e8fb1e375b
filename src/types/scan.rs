//! Core scan-engine data model: configs, block-range tasks and indexed records.

use std::fmt;

use alloy::primitives::{Address, Bytes, B256, U256};
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// What a scan config ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanKind {
    Transaction,
    Event,
}

impl ScanKind {
    pub const ALL: [ScanKind; 2] = [ScanKind::Event, ScanKind::Transaction];

    pub fn as_i16(self) -> i16 {
        match self {
            ScanKind::Transaction => 0,
            ScanKind::Event => 1,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(ScanKind::Transaction),
            1 => Some(ScanKind::Event),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanKind::Transaction => "transaction",
            ScanKind::Event => "event",
        }
    }
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScanKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "event" | "events" => Ok(ScanKind::Event),
            "transaction" | "transactions" | "tx" => Ok(ScanKind::Transaction),
            other => Err(format!("unknown scan kind '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    #[default]
    Polling,
    Realtime,
}

impl ScanMode {
    pub fn as_i16(self) -> i16 {
        match self {
            ScanMode::Polling => 0,
            ScanMode::Realtime => 1,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(ScanMode::Polling),
            1 => Some(ScanMode::Realtime),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    #[default]
    Disabled,
    Enabled,
}

impl AuditLevel {
    pub fn as_i16(self) -> i16 {
        match self {
            AuditLevel::Disabled => 0,
            AuditLevel::Enabled => 1,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(AuditLevel::Disabled),
            1 => Some(AuditLevel::Enabled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigStatus {
    #[default]
    Disabled,
    Enabled,
}

impl ConfigStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            ConfigStatus::Disabled => 0,
            ConfigStatus::Enabled => 1,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(ConfigStatus::Disabled),
            1 => Some(ConfigStatus::Enabled),
            _ => None,
        }
    }
}

/// Task lifecycle:
/// `Initial -> Finished -> Archived`, `Finished -> Initial` on a failed
/// detection check, `Initial -> Closed` by an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Initial,
    Finished,
    Archived,
    Closed,
}

impl TaskStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            TaskStatus::Initial => 0,
            TaskStatus::Finished => 1,
            TaskStatus::Archived => 2,
            TaskStatus::Closed => -1,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(TaskStatus::Initial),
            1 => Some(TaskStatus::Finished),
            2 => Some(TaskStatus::Archived),
            -1 => Some(TaskStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordStatus {
    #[default]
    Initial,
    ProcessedOnce,
}

impl RecordStatus {
    pub fn as_i16(self) -> i16 {
        match self {
            RecordStatus::Initial => 0,
            RecordStatus::ProcessedOnce => 1,
        }
    }

    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(RecordStatus::Initial),
            1 => Some(RecordStatus::ProcessedOnce),
            _ => None,
        }
    }
}

/// Half-open block range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, block: u64) -> bool {
        self.start <= block && block < self.end
    }

    /// Split into consecutive sub-ranges of at most `batch` blocks.
    pub fn chunks(&self, batch: u64) -> Vec<BlockRange> {
        if self.is_empty() {
            return Vec::new();
        }
        let batch = batch.max(1);
        let mut out = Vec::with_capacity(self.len().div_ceil(batch) as usize);
        let mut cursor = self.start;
        while cursor < self.end {
            let next = cursor.saturating_add(batch).min(self.end);
            out.push(BlockRange::new(cursor, next));
            cursor = next;
        }
        out
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Operator-defined scan definition before it has been persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct NewScanConfig {
    pub contract: String,
    pub scan_kind: ScanKind,
    #[serde(default)]
    pub mode: ScanMode,
    /// Replaces the contract's own address as the address/recipient filter.
    #[serde(default)]
    pub to_address_filter: Vec<Address>,
    #[serde(default)]
    pub from_address_filter: Vec<Address>,
    /// Event names; empty means every event the ABI declares.
    #[serde(default)]
    pub topic_filter: Vec<String>,
    #[serde(default)]
    pub function_filter: Vec<String>,
    pub stable_block_offset: Option<u64>,
    pub max_deliver_retry: Option<i32>,
    #[serde(default)]
    pub audit_level: AuditLevel,
    #[serde(default)]
    pub scan_group: Option<String>,
    #[serde(default)]
    pub status: ConfigStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanConfig {
    pub id: i64,
    pub contract: String,
    pub scan_kind: ScanKind,
    pub mode: ScanMode,
    pub to_address_filter: Vec<Address>,
    pub from_address_filter: Vec<Address>,
    pub topic_filter: Vec<String>,
    pub function_filter: Vec<String>,
    pub stable_block_offset: u64,
    pub max_deliver_retry: i32,
    pub audit_level: AuditLevel,
    pub scan_group: Option<String>,
    pub status: ConfigStatus,
}

impl ScanConfig {
    pub fn from_new(id: i64, new: NewScanConfig, default_offset: u64, default_retry: i32) -> Self {
        Self {
            id,
            contract: new.contract,
            scan_kind: new.scan_kind,
            mode: new.mode,
            to_address_filter: new.to_address_filter,
            from_address_filter: new.from_address_filter,
            topic_filter: new.topic_filter,
            function_filter: new.function_filter,
            stable_block_offset: new.stable_block_offset.unwrap_or(default_offset),
            max_deliver_retry: new.max_deliver_retry.unwrap_or(default_retry),
            audit_level: new.audit_level,
            scan_group: new.scan_group,
            status: new.status,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status == ConfigStatus::Enabled
    }

    pub fn audit_enabled(&self) -> bool {
        self.audit_level == AuditLevel::Enabled
    }
}

impl fmt::Display for ScanConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScanConfig-{}-{}-{}", self.id, self.contract, self.scan_kind)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanTask {
    pub id: i64,
    pub kind: ScanKind,
    pub config_id: i64,
    pub contract: String,
    pub range: BlockRange,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Display for ScanTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ScanTask-{} {}", self.kind, self.id, self.range)
    }
}

/// Task row to be inserted. `created_at` overrides the insertion time, used
/// when a healing task must land in the audit window of the task it repairs.
#[derive(Debug, Clone, PartialEq)]
pub struct NewScanTask {
    pub kind: ScanKind,
    pub config_id: i64,
    pub contract: String,
    pub range: BlockRange,
    pub created_at: Option<DateTime<Utc>>,
}

/// Replacement row written by an archival merge.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedTask {
    pub template_id: i64,
    pub range: BlockRange,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Idempotency key of a decoded record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    Event { transaction_hash: B256, log_index: u64 },
    Transaction { transaction_hash: B256, function_name: String },
}

impl RecordKey {
    pub fn kind(&self) -> ScanKind {
        match self {
            RecordKey::Event { .. } => ScanKind::Event,
            RecordKey::Transaction { .. } => ScanKind::Transaction,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Event { transaction_hash, log_index } => {
                write!(f, "{}-{}", transaction_hash, log_index)
            }
            RecordKey::Transaction { transaction_hash, function_name } => {
                write!(f, "{}-{}", transaction_hash, function_name)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub contract: String,
    pub event_name: String,
    pub block_hash: B256,
    pub block_number: u64,
    /// Address that emitted the log.
    pub address: Address,
    /// Transaction sender, only resolved when a sender filter is configured.
    pub from_address: Option<Address>,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub log_index: u64,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    pub contract: String,
    pub function_name: String,
    pub block_hash: B256,
    pub block_number: u64,
    pub from_address: Address,
    pub to_address: Option<Address>,
    pub transaction_hash: B256,
    pub transaction_index: u64,
    pub value: U256,
    pub input: Bytes,
}

/// A decoded record as produced by either ingestion path. Immutable once stored.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexedRecord {
    Event(EventRecord),
    Transaction(TransactionRecord),
}

impl IndexedRecord {
    pub fn key(&self) -> RecordKey {
        match self {
            IndexedRecord::Event(e) => RecordKey::Event {
                transaction_hash: e.transaction_hash,
                log_index: e.log_index,
            },
            IndexedRecord::Transaction(t) => RecordKey::Transaction {
                transaction_hash: t.transaction_hash,
                function_name: t.function_name.clone(),
            },
        }
    }

    pub fn kind(&self) -> ScanKind {
        match self {
            IndexedRecord::Event(_) => ScanKind::Event,
            IndexedRecord::Transaction(_) => ScanKind::Transaction,
        }
    }

    pub fn block_number(&self) -> u64 {
        match self {
            IndexedRecord::Event(e) => e.block_number,
            IndexedRecord::Transaction(t) => t.block_number,
        }
    }
}

/// Result of an insert-or-ignore write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created(i64),
    Conflict,
}

/// Reference to a stored record awaiting downstream delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRef {
    pub kind: ScanKind,
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub touch_count_remain: i32,
}

/// Per-record completion flags for fan-out to several downstream consumers.
///
/// A set bit means the consumer in that slot has not finished yet. The record
/// is complete once every armed slot has been cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionFlags(u8);

impl CompletionFlags {
    pub const MAX_CONSUMERS: u8 = 8;

    /// Arm the first `consumers` slots as pending.
    pub fn pending(consumers: u8) -> Self {
        let consumers = consumers.min(Self::MAX_CONSUMERS);
        if consumers == Self::MAX_CONSUMERS {
            Self(u8::MAX)
        } else {
            Self((1u8 << consumers) - 1)
        }
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_pending(self, slot: ConsumerSlot) -> bool {
        self.0 & slot.mask() != 0
    }

    pub fn mark_done(self, slot: ConsumerSlot) -> Self {
        Self(self.0 & !slot.mask())
    }

    pub fn is_complete(self) -> bool {
        self.0 == 0
    }

    pub fn pending_slots(self) -> impl Iterator<Item = ConsumerSlot> {
        (0..Self::MAX_CONSUMERS)
            .map(ConsumerSlot)
            .filter(move |slot| self.is_pending(*slot))
    }
}

/// Index of one downstream consumer in a [`CompletionFlags`] set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerSlot(u8);

impl ConsumerSlot {
    pub fn new(index: u8) -> Option<Self> {
        (index < CompletionFlags::MAX_CONSUMERS).then_some(Self(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }

    fn mask(self) -> u8 {
        1u8 << self.0
    }
}
