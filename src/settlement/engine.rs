use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::correction::SaleCorrection;
use super::journal::PaymentJournal;
use crate::audit::AuditLog;
use crate::error::{AppError, AppResult, ReconciliationError};
use crate::ledger::models::{
    is_valid_amount, Actor, EntityType, FieldChange, LockState, NewAuditRecord, SaleRecord,
    Settlement,
};
use crate::ledger::{LedgerStore, LedgerUnit};

/// Drives settlements through unsettled -> partially settled -> fully settled.
///
/// Every mutation of a sale runs inside one `LedgerUnit`, which serializes
/// work per sale and publishes all of its writes or none of them.
pub struct ReconciliationEngine {
    store: Arc<dyn LedgerStore>,
    journal: Arc<PaymentJournal>,
    audit: Arc<AuditLog>,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        journal: Arc<PaymentJournal>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            store,
            journal,
            audit,
        }
    }

    pub async fn sale(&self, sale_id: Uuid) -> AppResult<SaleRecord> {
        self.store
            .get_sale(sale_id)
            .await?
            .ok_or_else(|| ReconciliationError::NotFound(format!("sale {}", sale_id)).into())
    }

    /// Collect a payment against a sale, opening its settlement on first use
    pub async fn apply_payment(
        &self,
        sale_id: Uuid,
        amount: Decimal,
        actor: &Actor,
        notes: Option<String>,
    ) -> AppResult<Settlement> {
        if !is_valid_amount(amount) {
            warn!("Rejected payment of {} for sale {}: not a positive cent amount", amount, sale_id);
            return Err(ReconciliationError::InvalidAmount(amount).into());
        }

        let mut unit = self.store.begin(sale_id).await?;

        let sale = unit
            .sale()
            .await?
            .ok_or_else(|| ReconciliationError::NotFound(format!("sale {}", sale_id)))?;

        let now = Utc::now();
        let current = match unit.settlement().await? {
            Some(existing) => existing,
            // First collection freezes the sale's expected amount
            None => Settlement::open(sale.id, sale.expected_amount, now),
        };

        let next = current
            .with_payment(amount, actor.user_id, now)
            .map_err(|e| {
                warn!("Rejected payment of {} for sale {}: {}", amount, sale_id, e);
                e
            })?;

        unit.save_settlement(&next).await?;
        let entry = self
            .journal
            .append(unit.as_mut(), next.id, amount, actor.user_id, notes, now)
            .await?;

        let reason = entry
            .notes
            .clone()
            .unwrap_or_else(|| format!("payment {}", entry.id));
        let mut changes = vec![FieldChange::new(
            "settled_amount",
            current.settled_amount,
            next.settled_amount,
        )];
        if next.is_settled {
            changes.push(FieldChange::new("is_settled", current.is_settled, next.is_settled));
        }
        for change in changes {
            let draft = NewAuditRecord::change(
                EntityType::Settlement,
                next.id,
                change,
                actor.user_id,
                &reason,
            );
            self.audit.record_in(unit.as_mut(), draft).await?;
        }

        let journal_total = unit.payment_total(next.id).await?;
        if journal_total != next.settled_amount {
            error!(
                "❌ Journal for settlement {} sums to {} but settled amount is {}",
                next.id, journal_total, next.settled_amount
            );
            return Err(AppError::Internal(format!(
                "journal total {} does not match settled amount {} for settlement {}",
                journal_total, next.settled_amount, next.id
            )));
        }

        unit.commit().await?;

        if next.is_settled {
            info!(
                "✅ Sale {} fully settled at {} by {}",
                sale_id, next.settled_amount, actor.user_id
            );
        } else {
            info!(
                "💰 Payment {} of {} on sale {}: {} remaining",
                entry.id, amount, sale_id, next.remaining_balance
            );
        }

        Ok(next)
    }

    /// Edit one sale field. Refused once collection has started for the sale.
    pub async fn correct_sale_field(
        &self,
        sale_id: Uuid,
        correction: SaleCorrection,
        actor: &Actor,
        reason: &str,
    ) -> AppResult<SaleRecord> {
        if reason.trim().is_empty() {
            return Err(ReconciliationError::MissingReason.into());
        }

        let mut unit = self.store.begin(sale_id).await?;

        let mut sale = unit
            .sale()
            .await?
            .ok_or_else(|| ReconciliationError::NotFound(format!("sale {}", sale_id)))?;

        let settlement = unit.settlement().await?;
        if LockState::of(settlement.as_ref()) != LockState::Unsettled {
            warn!(
                "Rejected correction of {} on sale {}: settlement exists",
                correction.field_name(),
                sale_id
            );
            return Err(ReconciliationError::LockedSettlement(
                "cannot update entry after settlement has started".to_string(),
            )
            .into());
        }

        let changes = correction.apply(&mut sale)?;
        unit.save_sale(&sale).await?;
        for change in changes {
            let draft = NewAuditRecord::change(EntityType::Sale, sale.id, change, actor.user_id, reason);
            self.audit.record_in(unit.as_mut(), draft).await?;
        }

        unit.commit().await?;
        info!(
            "✏️ Sale {} corrected: {} by {} ({})",
            sale_id,
            correction.field_name(),
            actor.user_id,
            actor.role.as_str()
        );

        Ok(sale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::models::{PriceTier, Role};
    use crate::ledger::{AuditFilter, MemoryLedgerStore};
    use chrono::NaiveDate;
    use futures::TryStreamExt;
    use rust_decimal::prelude::ToPrimitive;
    use rust_decimal_macros::dec;

    struct Harness {
        store: Arc<MemoryLedgerStore>,
        engine: Arc<ReconciliationEngine>,
        journal: Arc<PaymentJournal>,
        audit: Arc<AuditLog>,
        actor: Actor,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryLedgerStore::new());
        let dyn_store: Arc<dyn LedgerStore> = store.clone();
        let journal = Arc::new(PaymentJournal::new(dyn_store.clone()));
        let audit = Arc::new(AuditLog::new(dyn_store.clone()));
        let engine = Arc::new(ReconciliationEngine::new(
            dyn_store,
            journal.clone(),
            audit.clone(),
        ));

        Harness {
            store,
            engine,
            journal,
            audit,
            actor: Actor::new(Uuid::new_v4(), Role::Staff),
        }
    }

    /// One tier at 1,000 per bag
    fn sale_worth(store: &MemoryLedgerStore, expected: Decimal) -> SaleRecord {
        let bags = (expected / dec!(1000)).trunc().to_i32().unwrap();
        let sale = SaleRecord::new(
            Uuid::new_v4(),
            NaiveDate::from_ymd_opt(2024, 3, 14).unwrap(),
            "cement",
            vec![PriceTier {
                tier_id: "std".to_string(),
                unit_price: dec!(1000),
                bag_count: bags,
                label: "Standard".to_string(),
            }],
        )
        .unwrap();
        store.insert_sale(sale.clone());
        sale
    }

    fn is_locked(result: &AppResult<impl std::fmt::Debug>) -> bool {
        matches!(
            result,
            Err(AppError::Reconciliation(ReconciliationError::LockedSettlement(_)))
        )
    }

    #[tokio::test]
    async fn test_partial_then_full_settlement() {
        let h = harness();
        let sale = sale_worth(&h.store, dec!(100000));

        let first = h
            .engine
            .apply_payment(sale.id, dec!(60000), &h.actor, None)
            .await
            .unwrap();
        assert_eq!(first.settled_amount, dec!(60000));
        assert_eq!(first.remaining_balance, dec!(40000));
        assert!(!first.is_settled);
        assert_eq!(first.lock_state(), LockState::PartiallySettled);

        let second = h
            .engine
            .apply_payment(sale.id, dec!(40000), &h.actor, Some("balance".into()))
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.settled_amount, dec!(100000));
        assert_eq!(second.remaining_balance, Decimal::ZERO);
        assert!(second.is_settled);
        assert!(second.settled_at.is_some());
        assert_eq!(second.settled_by, Some(h.actor.user_id));

        assert_eq!(h.journal.sum_for(second.id).await.unwrap(), dec!(100000));
        assert_eq!(h.journal.list_for(second.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_payment_after_full_settlement_is_locked() {
        let h = harness();
        let sale = sale_worth(&h.store, dec!(100000));
        h.engine.apply_payment(sale.id, dec!(60000), &h.actor, None).await.unwrap();
        let settled = h
            .engine
            .apply_payment(sale.id, dec!(40000), &h.actor, None)
            .await
            .unwrap();

        let result = h.engine.apply_payment(sale.id, dec!(1), &h.actor, None).await;
        assert!(is_locked(&result));

        let after = h.store.get_settlement_by_sale(sale.id).await.unwrap().unwrap();
        assert_eq!(after, settled);
        assert_eq!(h.journal.list_for(settled.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_first_overpayment_creates_nothing() {
        let h = harness();
        let sale = sale_worth(&h.store, dec!(50000));

        let result = h.engine.apply_payment(sale.id, dec!(60000), &h.actor, None).await;
        assert!(matches!(
            result,
            Err(AppError::Reconciliation(ReconciliationError::OverpaymentRejected {
                remaining,
                ..
            })) if remaining == dec!(50000)
        ));

        assert!(h.store.get_settlement_by_sale(sale.id).await.unwrap().is_none());
        let audit: Vec<_> = h.audit.query(AuditFilter::default()).try_collect().await.unwrap();
        assert!(audit.is_empty());
    }

    #[tokio::test]
    async fn test_zero_expected_sale_rejects_first_payment_as_overpayment() {
        let h = harness();
        let sale = SaleRecord::new(
            Uuid::new_v4(),
            NaiveDate::from_ymd_opt(2024, 3, 14).unwrap(),
            "cement",
            vec![],
        )
        .unwrap();
        h.store.insert_sale(sale.clone());

        let result = h.engine.apply_payment(sale.id, dec!(1), &h.actor, None).await;
        assert!(matches!(
            result,
            Err(AppError::Reconciliation(ReconciliationError::OverpaymentRejected {
                remaining,
                ..
            })) if remaining == Decimal::ZERO
        ));
        assert!(h.store.get_settlement_by_sale(sale.id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_payments_serialize() {
        let h = harness();
        let sale_id = sale_worth(&h.store, dec!(100000)).id;

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let engine = h.engine.clone();
                let actor = h.actor;
                tokio::spawn(async move {
                    engine.apply_payment(sale_id, dec!(30000), &actor, None).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let settlement = h.store.get_settlement_by_sale(sale_id).await.unwrap().unwrap();
        assert_eq!(settlement.settled_amount, dec!(60000));
        assert_eq!(settlement.remaining_balance, dec!(40000));
        assert_eq!(h.journal.sum_for(settlement.id).await.unwrap(), dec!(60000));
    }

    #[tokio::test]
    async fn test_invalid_and_unknown_sale() {
        let h = harness();
        let sale = sale_worth(&h.store, dec!(1000));

        assert!(matches!(
            h.engine.apply_payment(sale.id, Decimal::ZERO, &h.actor, None).await,
            Err(AppError::Reconciliation(ReconciliationError::InvalidAmount(_)))
        ));
        assert!(matches!(
            h.engine.apply_payment(sale.id, dec!(0.005), &h.actor, None).await,
            Err(AppError::Reconciliation(ReconciliationError::InvalidAmount(_)))
        ));
        assert!(h.store.get_settlement_by_sale(sale.id).await.unwrap().is_none());
        assert!(matches!(
            h.engine.apply_payment(Uuid::new_v4(), dec!(10), &h.actor, None).await,
            Err(AppError::Reconciliation(ReconciliationError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_expected_amount_is_frozen_at_first_payment() {
        let h = harness();
        let sale = sale_worth(&h.store, dec!(10000));
        h.engine.apply_payment(sale.id, dec!(4000), &h.actor, None).await.unwrap();

        // Intake republishes the sale with a bigger total
        let mut revised = sale.clone();
        revised.price_breakdown[0].bag_count = 20;
        revised.recompute_totals().unwrap();
        h.store.insert_sale(revised);

        let result = h.engine.apply_payment(sale.id, dec!(7000), &h.actor, None).await;
        assert!(matches!(
            result,
            Err(AppError::Reconciliation(ReconciliationError::OverpaymentRejected { .. }))
        ));
    }

    #[tokio::test]
    async fn test_payment_writes_settlement_audit() {
        let h = harness();
        let sale = sale_worth(&h.store, dec!(5000));
        let settlement = h
            .engine
            .apply_payment(sale.id, dec!(5000), &h.actor, Some("paid in full".into()))
            .await
            .unwrap();

        let records: Vec<_> = h
            .audit
            .query(AuditFilter {
                entity_type: Some(EntityType::Settlement),
                ..Default::default()
            })
            .try_collect()
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.entity_id == settlement.id));
        assert!(records.iter().all(|r| r.reason == "paid in full"));
        assert!(records
            .iter()
            .any(|r| r.field.as_deref() == Some("is_settled") && r.new_value.as_deref() == Some("true")));
    }

    #[tokio::test]
    async fn test_correction_before_settlement_is_audited() {
        let h = harness();
        let sale = sale_worth(&h.store, dec!(10000));
        let correction = SaleCorrection::BagCount {
            tier_id: "std".to_string(),
            bag_count: 12,
        };

        let updated = h
            .engine
            .correct_sale_field(sale.id, correction, &h.actor, "miscounted at the gate")
            .await
            .unwrap();
        assert_eq!(updated.total_bags, 12);
        assert_eq!(updated.expected_amount, dec!(12000));
        assert_eq!(h.engine.sale(sale.id).await.unwrap(), updated);

        let records: Vec<_> = h
            .audit
            .query(AuditFilter {
                entity_type: Some(EntityType::Sale),
                actor: Some(h.actor.user_id),
                ..Default::default()
            })
            .try_collect()
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.reason == "miscounted at the gate"));

        // The new total is what the first payment freezes
        let settlement = h
            .engine
            .apply_payment(sale.id, dec!(2000), &h.actor, None)
            .await
            .unwrap();
        assert_eq!(settlement.expected_amount, dec!(12000));
    }

    #[tokio::test]
    async fn test_correction_rules() {
        let h = harness();
        let sale = sale_worth(&h.store, dec!(10000));
        let category = || SaleCorrection::Category("sand".to_string());

        assert!(matches!(
            h.engine.correct_sale_field(sale.id, category(), &h.actor, "  ").await,
            Err(AppError::Reconciliation(ReconciliationError::MissingReason))
        ));
        assert!(matches!(
            h.engine
                .correct_sale_field(Uuid::new_v4(), category(), &h.actor, "typo")
                .await,
            Err(AppError::Reconciliation(ReconciliationError::NotFound(_)))
        ));

        h.engine.apply_payment(sale.id, dec!(100), &h.actor, None).await.unwrap();
        let result = h
            .engine
            .correct_sale_field(sale.id, category(), &h.actor, "typo")
            .await;
        assert!(is_locked(&result));
        assert_eq!(h.engine.sale(sale.id).await.unwrap().category, "cement");
    }
}
