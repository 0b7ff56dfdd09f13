use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{AppResult, ReconciliationError};
use crate::ledger::models::{is_valid_amount, PaymentEntry};
use crate::ledger::{LedgerStore, LedgerUnit};

/// Append-only record of collection events per settlement
pub struct PaymentJournal {
    store: Arc<dyn LedgerStore>,
}

impl PaymentJournal {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Write one entry inside the caller's unit of work. The entry only becomes
    /// visible when that unit commits.
    pub async fn append(
        &self,
        unit: &mut dyn LedgerUnit,
        settlement_id: Uuid,
        amount: Decimal,
        paid_by: Uuid,
        notes: Option<String>,
        paid_at: DateTime<Utc>,
    ) -> AppResult<PaymentEntry> {
        if !is_valid_amount(amount) {
            return Err(ReconciliationError::InvalidAmount(amount).into());
        }

        let entry = PaymentEntry {
            id: Uuid::new_v4(),
            settlement_id,
            amount,
            paid_by,
            paid_at,
            notes: notes.filter(|n| !n.trim().is_empty()),
        };
        unit.append_payment(&entry).await?;

        debug!("Journal entry {} for settlement {}: {}", entry.id, settlement_id, amount);
        Ok(entry)
    }

    /// Entries ordered by `paid_at`. Each call re-reads committed state.
    pub async fn list_for(&self, settlement_id: Uuid) -> AppResult<Vec<PaymentEntry>> {
        self.store.list_payments(settlement_id).await
    }

    pub async fn sum_for(&self, settlement_id: Uuid) -> AppResult<Decimal> {
        self.store.sum_payments(settlement_id).await
    }
}
