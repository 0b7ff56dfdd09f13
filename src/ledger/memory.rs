use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use super::models::*;
use super::store::{AuditCursor, AuditFilter, LedgerStore, LedgerUnit};
use crate::error::{AppError, AppResult};

/// Settlement row plus the ids of the journal entries it owns
#[derive(Debug, Clone)]
struct SettlementSlot {
    settlement: Settlement,
    payment_ids: Vec<Uuid>,
}

#[derive(Debug, Default)]
struct MemoryState {
    sales: HashMap<Uuid, SaleRecord>,
    /// Arena keyed by settlement id
    settlements: HashMap<Uuid, SettlementSlot>,
    settlement_by_sale: HashMap<Uuid, Uuid>,
    payments: HashMap<Uuid, PaymentEntry>,
    audit: Vec<AuditRecord>,
}

impl MemoryState {
    fn settlement_for_sale(&self, sale_id: Uuid) -> Option<&SettlementSlot> {
        self.settlement_by_sale
            .get(&sale_id)
            .and_then(|id| self.settlements.get(id))
    }

    /// Entries owned by a settlement, ordered by `paid_at`
    fn journal(&self, settlement_id: Uuid) -> Vec<PaymentEntry> {
        let mut entries: Vec<PaymentEntry> = self
            .settlements
            .get(&settlement_id)
            .map(|slot| {
                slot.payment_ids
                    .iter()
                    .filter_map(|id| self.payments.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by_key(|p| p.paid_at);
        entries
    }
}

type SaleLocks = Arc<Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>>;

/// In-process ledger store, used for tests and local development.
pub struct MemoryLedgerStore {
    state: Arc<RwLock<MemoryState>>,
    /// One entry per sale with a unit open or waiting
    sale_locks: SaleLocks,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState::default())),
            sale_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a sale as if sales intake had produced it
    pub fn insert_sale(&self, sale: SaleRecord) {
        self.state.write().sales.insert(sale.id, sale);
    }

    /// Seed sales from a JSON array of sale records
    pub fn load_sales_file(&self, path: impl AsRef<Path>) -> AppResult<usize> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read sales file {}: {}", path.display(), e))
        })?;
        let sales: Vec<SaleRecord> = serde_json::from_str(&raw)?;
        let count = sales.len();

        let mut state = self.state.write();
        for sale in sales {
            state.sales.insert(sale.id, sale);
        }

        Ok(count)
    }

    fn sale_lock(&self, sale_id: Uuid) -> Arc<AsyncMutex<()>> {
        self.sale_locks
            .lock()
            .entry(sale_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self, sale_id: Uuid) -> AppResult<Box<dyn LedgerUnit>> {
        let lock = self.sale_lock(sale_id);
        let guard = lock.clone().lock_owned().await;

        Ok(Box::new(MemoryLedgerUnit {
            sale_id,
            state: self.state.clone(),
            sale_locks: self.sale_locks.clone(),
            lock,
            _guard: guard,
            pending: PendingWrites::default(),
            committed: false,
        }))
    }

    async fn get_sale(&self, sale_id: Uuid) -> AppResult<Option<SaleRecord>> {
        Ok(self.state.read().sales.get(&sale_id).cloned())
    }

    async fn get_settlement_by_sale(&self, sale_id: Uuid) -> AppResult<Option<Settlement>> {
        Ok(self
            .state
            .read()
            .settlement_for_sale(sale_id)
            .map(|slot| slot.settlement.clone()))
    }

    async fn get_settlement(&self, settlement_id: Uuid) -> AppResult<Option<Settlement>> {
        Ok(self
            .state
            .read()
            .settlements
            .get(&settlement_id)
            .map(|slot| slot.settlement.clone()))
    }

    async fn list_settlements(&self, is_settled: Option<bool>) -> AppResult<Vec<Settlement>> {
        let state = self.state.read();
        let mut settlements: Vec<Settlement> = state
            .settlements
            .values()
            .map(|slot| slot.settlement.clone())
            .filter(|s| is_settled.map_or(true, |flag| s.is_settled == flag))
            .collect();
        settlements.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));

        Ok(settlements)
    }

    async fn list_payments(&self, settlement_id: Uuid) -> AppResult<Vec<PaymentEntry>> {
        Ok(self.state.read().journal(settlement_id))
    }

    async fn sum_payments(&self, settlement_id: Uuid) -> AppResult<Decimal> {
        Ok(self
            .state
            .read()
            .journal(settlement_id)
            .iter()
            .map(|p| p.amount)
            .sum())
    }

    async fn append_audit(&self, record: &AuditRecord) -> AppResult<()> {
        self.state.write().audit.push(record.clone());
        Ok(())
    }

    async fn audit_page(
        &self,
        filter: &AuditFilter,
        after: Option<AuditCursor>,
        limit: usize,
    ) -> AppResult<Vec<AuditRecord>> {
        let state = self.state.read();
        let mut records: Vec<AuditRecord> = state
            .audit
            .iter()
            .filter(|r| filter.matches(r))
            .filter(|r| after.map_or(true, |cursor| cursor.is_before(r)))
            .cloned()
            .collect();
        records.sort_by(|a, b| (a.changed_at, a.id).cmp(&(b.changed_at, b.id)));
        records.truncate(limit);

        Ok(records)
    }
}

#[derive(Debug, Default)]
struct PendingWrites {
    sale: Option<SaleRecord>,
    settlement: Option<Settlement>,
    payments: Vec<PaymentEntry>,
    audit: Vec<AuditRecord>,
}

/// Holds the sale's lock for its whole life and buffers writes until commit
pub struct MemoryLedgerUnit {
    sale_id: Uuid,
    state: Arc<RwLock<MemoryState>>,
    sale_locks: SaleLocks,
    lock: Arc<AsyncMutex<()>>,
    _guard: OwnedMutexGuard<()>,
    pending: PendingWrites,
    committed: bool,
}

impl Drop for MemoryLedgerUnit {
    fn drop(&mut self) {
        // Map entry, `lock` and `_guard` are the only holders when nobody waits
        let mut locks = self.sale_locks.lock();
        let idle = locks
            .get(&self.sale_id)
            .map_or(false, |entry| Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(entry) <= 3);
        if idle {
            locks.remove(&self.sale_id);
        }
    }
}

impl MemoryLedgerUnit {
    fn ensure_open(&self) -> AppResult<()> {
        if self.committed {
            return Err(AppError::Internal("ledger unit already committed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerUnit for MemoryLedgerUnit {
    async fn sale(&mut self) -> AppResult<Option<SaleRecord>> {
        self.ensure_open()?;
        if let Some(sale) = &self.pending.sale {
            return Ok(Some(sale.clone()));
        }
        Ok(self.state.read().sales.get(&self.sale_id).cloned())
    }

    async fn settlement(&mut self) -> AppResult<Option<Settlement>> {
        self.ensure_open()?;
        if let Some(settlement) = &self.pending.settlement {
            return Ok(Some(settlement.clone()));
        }
        Ok(self
            .state
            .read()
            .settlement_for_sale(self.sale_id)
            .map(|slot| slot.settlement.clone()))
    }

    async fn save_sale(&mut self, sale: &SaleRecord) -> AppResult<()> {
        self.ensure_open()?;
        if sale.id != self.sale_id {
            return Err(AppError::Internal(format!(
                "unit for sale {} cannot write sale {}",
                self.sale_id, sale.id
            )));
        }
        self.pending.sale = Some(sale.clone());
        Ok(())
    }

    async fn save_settlement(&mut self, settlement: &Settlement) -> AppResult<()> {
        self.ensure_open()?;
        if settlement.sale_id != self.sale_id {
            return Err(AppError::Internal(format!(
                "settlement {} belongs to sale {}, not {}",
                settlement.id, settlement.sale_id, self.sale_id
            )));
        }
        self.pending.settlement = Some(settlement.clone());
        Ok(())
    }

    async fn append_payment(&mut self, entry: &PaymentEntry) -> AppResult<()> {
        self.ensure_open()?;
        self.pending.payments.push(entry.clone());
        Ok(())
    }

    async fn payment_total(&mut self, settlement_id: Uuid) -> AppResult<Decimal> {
        self.ensure_open()?;
        let committed: Decimal = self
            .state
            .read()
            .journal(settlement_id)
            .iter()
            .map(|p| p.amount)
            .sum();
        let pending: Decimal = self
            .pending
            .payments
            .iter()
            .filter(|p| p.settlement_id == settlement_id)
            .map(|p| p.amount)
            .sum();

        Ok(committed + pending)
    }

    async fn append_audit(&mut self, record: &AuditRecord) -> AppResult<()> {
        self.ensure_open()?;
        self.pending.audit.push(record.clone());
        Ok(())
    }

    async fn commit(&mut self) -> AppResult<()> {
        self.ensure_open()?;
        let pending = std::mem::take(&mut self.pending);
        let mut state = self.state.write();

        // Check every constraint before touching anything so a failed commit
        // leaves the store untouched.
        if let Some(settlement) = &pending.settlement {
            if let Some(existing) = state.settlement_by_sale.get(&settlement.sale_id) {
                if *existing != settlement.id {
                    return Err(AppError::Internal(format!(
                        "sale {} already has settlement {}",
                        settlement.sale_id, existing
                    )));
                }
            }
        }
        for payment in &pending.payments {
            let known = state.settlements.contains_key(&payment.settlement_id)
                || pending
                    .settlement
                    .as_ref()
                    .map_or(false, |s| s.id == payment.settlement_id);
            if !known {
                return Err(AppError::Internal(format!(
                    "payment {} references unknown settlement {}",
                    payment.id, payment.settlement_id
                )));
            }
        }

        if let Some(sale) = pending.sale {
            state.sales.insert(sale.id, sale);
        }

        if let Some(settlement) = pending.settlement {
            state.settlement_by_sale.insert(settlement.sale_id, settlement.id);
            state
                .settlements
                .entry(settlement.id)
                .and_modify(|slot| slot.settlement = settlement.clone())
                .or_insert_with(|| SettlementSlot {
                    settlement,
                    payment_ids: Vec::new(),
                });
        }

        for payment in pending.payments {
            if let Some(slot) = state.settlements.get_mut(&payment.settlement_id) {
                slot.payment_ids.push(payment.id);
            }
            state.payments.insert(payment.id, payment);
        }

        state.audit.extend(pending.audit);
        self.committed = true;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};
    use rust_decimal_macros::dec;

    fn sale(expected_bags: i32) -> SaleRecord {
        SaleRecord::new(
            Uuid::new_v4(),
            NaiveDate::from_ymd_opt(2024, 4, 10).unwrap(),
            "cement",
            vec![PriceTier {
                tier_id: "std".to_string(),
                unit_price: dec!(1000),
                bag_count: expected_bags,
                label: "Standard".to_string(),
            }],
        )
        .unwrap()
    }

    fn payment(settlement_id: Uuid, amount: Decimal) -> PaymentEntry {
        PaymentEntry {
            id: Uuid::new_v4(),
            settlement_id,
            amount,
            paid_by: Uuid::new_v4(),
            paid_at: Utc::now(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_uncommitted_unit_is_discarded() {
        let store = MemoryLedgerStore::new();
        let sale = sale(10);
        store.insert_sale(sale.clone());

        {
            let mut unit = store.begin(sale.id).await.unwrap();
            let settlement = Settlement::open(sale.id, sale.expected_amount, Utc::now());
            unit.save_settlement(&settlement).await.unwrap();
            unit.append_payment(&payment(settlement.id, dec!(500))).await.unwrap();
        }

        assert!(store.get_settlement_by_sale(sale.id).await.unwrap().is_none());
        assert!(store.list_settlements(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_publishes_writes_atomically() {
        let store = MemoryLedgerStore::new();
        let sale = sale(10);
        store.insert_sale(sale.clone());

        let mut unit = store.begin(sale.id).await.unwrap();
        let settlement = Settlement::open(sale.id, sale.expected_amount, Utc::now());
        unit.save_settlement(&settlement).await.unwrap();
        unit.append_payment(&payment(settlement.id, dec!(500))).await.unwrap();
        unit.append_payment(&payment(settlement.id, dec!(250))).await.unwrap();

        assert_eq!(unit.payment_total(settlement.id).await.unwrap(), dec!(750));
        assert_eq!(store.sum_payments(settlement.id).await.unwrap(), Decimal::ZERO);

        unit.commit().await.unwrap();

        assert_eq!(store.sum_payments(settlement.id).await.unwrap(), dec!(750));
        let journal = store.list_payments(settlement.id).await.unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal[0].amount, dec!(500));
        assert!(unit.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_payment_for_unknown_settlement_fails_commit() {
        let store = MemoryLedgerStore::new();
        let sale = sale(1);
        store.insert_sale(sale.clone());

        let mut unit = store.begin(sale.id).await.unwrap();
        unit.append_payment(&payment(Uuid::new_v4(), dec!(1))).await.unwrap();

        assert!(matches!(unit.commit().await, Err(AppError::Internal(_))));
    }

    #[tokio::test]
    async fn test_sale_locks_are_released_with_their_units() {
        let store = MemoryLedgerStore::new();

        for _ in 0..3 {
            let unit = store.begin(Uuid::new_v4()).await.unwrap();
            assert_eq!(store.sale_locks.lock().len(), 1);
            drop(unit);
        }
        assert!(store.sale_locks.lock().is_empty());

        let sale = sale(2);
        store.insert_sale(sale.clone());
        let mut unit = store.begin(sale.id).await.unwrap();
        unit.save_settlement(&Settlement::open(sale.id, sale.expected_amount, Utc::now()))
            .await
            .unwrap();
        unit.commit().await.unwrap();
        drop(unit);
        assert!(store.sale_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_waiting_unit_keeps_the_sale_lock() {
        let store = Arc::new(MemoryLedgerStore::new());
        let sale_id = Uuid::new_v4();

        let first = store.begin(sale_id).await.unwrap();
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.begin(sale_id).await.map(|_| ()) })
        };
        while Arc::strong_count(&store.sale_lock(sale_id)) < 5 {
            tokio::task::yield_now().await;
        }

        drop(first);
        assert_eq!(store.sale_locks.lock().len(), 1);

        waiter.await.unwrap().unwrap();
        assert!(store.sale_locks.lock().is_empty());
    }
}
