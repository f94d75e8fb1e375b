//! Delivery bookkeeping for stored records.
//!
//! Downstream consumers follow the record tables. A record nobody has
//! processed gets "touched" periodically: its remaining retry budget is
//! decremented, which consumers observe as a redelivery signal. Touching stops
//! once the budget is spent or the record is marked processed.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::db::{DbError, ScanStore};
use crate::scan::{ScanContext, ScanError};
use crate::types::scan::{CompletionFlags, ConsumerSlot, RecordStatus, ScanKind};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TouchSummary {
    pub touched: usize,
    pub failed: usize,
}

pub struct DeliveryRetryMarker {
    store: Arc<dyn ScanStore>,
    touch_offset: Duration,
}

impl DeliveryRetryMarker {
    pub fn new(ctx: &ScanContext) -> Self {
        Self {
            store: ctx.store.clone(),
            touch_offset: Duration::minutes(ctx.settings.entity_touch_offset_minutes),
        }
    }

    /// Touch every unprocessed record older than the touch offset, oldest
    /// first across both kinds.
    pub async fn touch_unprocessed(&self, now: DateTime<Utc>) -> Result<TouchSummary, ScanError> {
        let due = self
            .store
            .records_due_for_touch(now - self.touch_offset)
            .await?;

        let mut summary = TouchSummary::default();
        for record in due {
            match self.store.touch_record(record.kind, record.id).await {
                Ok(()) => summary.touched += 1,
                Err(e) => {
                    tracing::warn!("Failed to touch {} record {}: {}", record.kind, record.id, e);
                    summary.failed += 1;
                }
            }
        }
        if summary.touched > 0 || summary.failed > 0 {
            tracing::info!(
                "Touched {} unprocessed record(s), {} failed",
                summary.touched,
                summary.failed
            );
        }
        Ok(summary)
    }

    pub async fn mark_processed(&self, kind: ScanKind, id: i64) -> Result<(), ScanError> {
        self.store
            .set_record_status(kind, id, RecordStatus::ProcessedOnce)
            .await?;
        Ok(())
    }

    /// Arm the first `consumers` completion flags of a record.
    pub async fn init_completion(
        &self,
        kind: ScanKind,
        id: i64,
        consumers: u8,
    ) -> Result<CompletionFlags, ScanError> {
        let flags = CompletionFlags::pending(consumers);
        self.store.set_completion_flags(kind, id, flags).await?;
        Ok(flags)
    }

    /// Clear one consumer's flag. The record becomes processed when the last
    /// pending flag is cleared.
    pub async fn mark_consumer_done(
        &self,
        kind: ScanKind,
        id: i64,
        slot: ConsumerSlot,
    ) -> Result<CompletionFlags, ScanError> {
        self.store
            .clear_completion_flag(kind, id, slot)
            .await?
            .ok_or_else(|| ScanError::Db(DbError::NotFound(format!("{} record {}", kind, id))))
    }
}
