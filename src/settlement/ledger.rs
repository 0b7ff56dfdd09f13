use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::error::{AppResult, ReconciliationError};
use crate::ledger::models::{LockState, Settlement};
use crate::ledger::LedgerStore;

/// Result of re-summing a settlement's journal against its stored total
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerCheck {
    pub sale_id: Uuid,
    pub settlement_id: Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    pub settled_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub journal_total: Decimal,
    pub payment_count: usize,
    pub consistent: bool,
}

/// Read side of settlements. All writes go through the reconciliation engine.
pub struct SettlementLedger {
    store: Arc<dyn LedgerStore>,
}

impl SettlementLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn get_settlement(&self, sale_id: Uuid) -> AppResult<Settlement> {
        self.store
            .get_settlement_by_sale(sale_id)
            .await?
            .ok_or_else(|| {
                ReconciliationError::NotFound(format!("settlement for sale {}", sale_id)).into()
            })
    }

    pub async fn find_by_id(&self, settlement_id: Uuid) -> AppResult<Settlement> {
        self.store
            .get_settlement(settlement_id)
            .await?
            .ok_or_else(|| {
                ReconciliationError::NotFound(format!("settlement {}", settlement_id)).into()
            })
    }

    pub async fn lock_state(&self, sale_id: Uuid) -> AppResult<LockState> {
        let settlement = self.store.get_settlement_by_sale(sale_id).await?;
        Ok(LockState::of(settlement.as_ref()))
    }

    pub async fn verify(&self, sale_id: Uuid) -> AppResult<LedgerCheck> {
        let settlement = self.get_settlement(sale_id).await?;
        let payments = self.store.list_payments(settlement.id).await?;
        let journal_total: Decimal = payments.iter().map(|p| p.amount).sum();

        let check = LedgerCheck {
            sale_id,
            settlement_id: settlement.id,
            settled_amount: settlement.settled_amount,
            journal_total,
            payment_count: payments.len(),
            consistent: journal_total == settlement.settled_amount,
        };

        if !check.consistent {
            warn!(
                "⚠️ Settlement {} records {} but its journal sums to {}",
                settlement.id, settlement.settled_amount, journal_total
            );
        }

        Ok(check)
    }

    /// Settlements by creation time. `Unsettled` sales have no settlement row,
    /// so asking for them yields nothing.
    pub async fn list(&self, state: Option<LockState>) -> AppResult<Vec<Settlement>> {
        let is_settled = match state {
            None => None,
            Some(LockState::Unsettled) => return Ok(Vec::new()),
            Some(LockState::PartiallySettled) => Some(false),
            Some(LockState::FullySettled) => Some(true),
        };

        self.store.list_settlements(is_settled).await
    }
}
