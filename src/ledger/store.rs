use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use uuid::Uuid;

use super::models::{AuditRecord, EntityType, PaymentEntry, SaleRecord, Settlement};
use crate::error::{AppError, AppResult};

/// Filters accepted by audit queries. Every field is optional; `from` is
/// inclusive and `to` exclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AuditFilter {
    #[serde(alias = "entityType")]
    pub entity_type: Option<EntityType>,
    pub actor: Option<Uuid>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn validate(&self) -> AppResult<()> {
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(AppError::InvalidInput(format!(
                    "audit range start {} is after its end {}",
                    from, to
                )));
            }
        }
        Ok(())
    }

    pub fn matches(&self, record: &AuditRecord) -> bool {
        self.entity_type.map_or(true, |t| record.entity_type == t)
            && self.actor.map_or(true, |a| record.changed_by == a)
            && self.from.map_or(true, |from| record.changed_at >= from)
            && self.to.map_or(true, |to| record.changed_at < to)
    }
}

/// Keyset position in the audit log, which is ordered by `(changed_at, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditCursor {
    pub changed_at: DateTime<Utc>,
    pub id: Uuid,
}

impl AuditCursor {
    pub fn after(record: &AuditRecord) -> Self {
        Self {
            changed_at: record.changed_at,
            id: record.id,
        }
    }

    pub fn is_before(&self, record: &AuditRecord) -> bool {
        (record.changed_at, record.id) > (self.changed_at, self.id)
    }
}

/// Persistent state behind the reconciliation core.
///
/// Reads outside a unit of work only ever observe committed data.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open a unit of work for one sale. Units for the same sale are
    /// serialized; units for different sales run independently.
    async fn begin(&self, sale_id: Uuid) -> AppResult<Box<dyn LedgerUnit>>;

    async fn get_sale(&self, sale_id: Uuid) -> AppResult<Option<SaleRecord>>;

    async fn get_settlement_by_sale(&self, sale_id: Uuid) -> AppResult<Option<Settlement>>;

    async fn get_settlement(&self, settlement_id: Uuid) -> AppResult<Option<Settlement>>;

    /// Settlements ordered by creation time, optionally only settled or only open ones
    async fn list_settlements(&self, is_settled: Option<bool>) -> AppResult<Vec<Settlement>>;

    /// Journal entries ordered by `paid_at` ascending
    async fn list_payments(&self, settlement_id: Uuid) -> AppResult<Vec<PaymentEntry>>;

    async fn sum_payments(&self, settlement_id: Uuid) -> AppResult<Decimal>;

    async fn append_audit(&self, record: &AuditRecord) -> AppResult<()>;

    async fn audit_page(
        &self,
        filter: &AuditFilter,
        after: Option<AuditCursor>,
        limit: usize,
    ) -> AppResult<Vec<AuditRecord>>;
}

/// Atomic unit of work scoped to one sale.
///
/// Nothing written through a unit is visible to other readers until `commit`
/// succeeds. Dropping an uncommitted unit discards its writes.
#[async_trait]
pub trait LedgerUnit: Send {
    async fn sale(&mut self) -> AppResult<Option<SaleRecord>>;

    async fn settlement(&mut self) -> AppResult<Option<Settlement>>;

    async fn save_sale(&mut self, sale: &SaleRecord) -> AppResult<()>;

    /// Insert or update the sale's settlement row
    async fn save_settlement(&mut self, settlement: &Settlement) -> AppResult<()>;

    async fn append_payment(&mut self, entry: &PaymentEntry) -> AppResult<()>;

    /// Journal total for a settlement, including entries appended in this unit
    async fn payment_total(&mut self, settlement_id: Uuid) -> AppResult<Decimal>;

    async fn append_audit(&mut self, record: &AuditRecord) -> AppResult<()>;

    async fn commit(&mut self) -> AppResult<()>;
}
