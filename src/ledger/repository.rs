use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::{types::Json, PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::models::*;
use super::store::{AuditCursor, AuditFilter, LedgerStore, LedgerUnit};
use crate::error::{AppError, AppResult};

const SETTLEMENT_COLUMNS: &str = "id, sale_id, expected_amount, settled_amount, remaining_balance, \
     is_settled, settled_at, settled_by, created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, settlement_id, amount, paid_by, paid_at, notes";

const SALE_COLUMNS: &str = "id, sale_date, category, total_bags, expected_amount, price_breakdown";

#[derive(sqlx::FromRow)]
struct SaleRow {
    id: Uuid,
    sale_date: NaiveDate,
    category: String,
    total_bags: i32,
    expected_amount: Decimal,
    price_breakdown: Json<Vec<PriceTier>>,
}

impl From<SaleRow> for SaleRecord {
    fn from(row: SaleRow) -> Self {
        SaleRecord {
            id: row.id,
            date: row.sale_date,
            category: row.category,
            total_bags: row.total_bags,
            expected_amount: row.expected_amount,
            price_breakdown: row.price_breakdown.0,
        }
    }
}

/// Advisory lock key for a sale. Collisions only cost extra serialization.
fn sale_lock_key(sale_id: Uuid) -> i64 {
    let (hi, lo) = sale_id.as_u64_pair();
    (hi ^ lo) as i64
}

/// Ledger repository - THE source of truth for all state
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    async fn begin(&self, sale_id: Uuid) -> AppResult<Box<dyn LedgerUnit>> {
        let mut tx = self.begin_tx().await?;

        // Held until commit or rollback
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(sale_lock_key(sale_id))
            .execute(&mut *tx)
            .await?;

        debug!("Opened ledger unit for sale {}", sale_id);
        Ok(Box::new(PgLedgerUnit {
            sale_id,
            tx: Some(tx),
        }))
    }

    async fn get_sale(&self, sale_id: Uuid) -> AppResult<Option<SaleRecord>> {
        let row = sqlx::query_as::<_, SaleRow>(&format!(
            "SELECT {} FROM sales WHERE id = $1",
            SALE_COLUMNS
        ))
        .bind(sale_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SaleRecord::from))
    }

    async fn get_settlement_by_sale(&self, sale_id: Uuid) -> AppResult<Option<Settlement>> {
        let settlement = sqlx::query_as::<_, Settlement>(&format!(
            "SELECT {} FROM settlements WHERE sale_id = $1",
            SETTLEMENT_COLUMNS
        ))
        .bind(sale_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(settlement)
    }

    async fn get_settlement(&self, settlement_id: Uuid) -> AppResult<Option<Settlement>> {
        let settlement = sqlx::query_as::<_, Settlement>(&format!(
            "SELECT {} FROM settlements WHERE id = $1",
            SETTLEMENT_COLUMNS
        ))
        .bind(settlement_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(settlement)
    }

    async fn list_settlements(&self, is_settled: Option<bool>) -> AppResult<Vec<Settlement>> {
        let settlements = sqlx::query_as::<_, Settlement>(&format!(
            r#"
            SELECT {}
            FROM settlements
            WHERE ($1::boolean IS NULL OR is_settled = $1)
            ORDER BY created_at, id
            "#,
            SETTLEMENT_COLUMNS
        ))
        .bind(is_settled)
        .fetch_all(&self.pool)
        .await?;

        Ok(settlements)
    }

    async fn list_payments(&self, settlement_id: Uuid) -> AppResult<Vec<PaymentEntry>> {
        let payments = sqlx::query_as::<_, PaymentEntry>(&format!(
            r#"
            SELECT {}
            FROM settlement_payments
            WHERE settlement_id = $1
            ORDER BY paid_at, id
            "#,
            PAYMENT_COLUMNS
        ))
        .bind(settlement_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(payments)
    }

    async fn sum_payments(&self, settlement_id: Uuid) -> AppResult<Decimal> {
        let total = sqlx::query_scalar::<_, Decimal>(
            "SELECT COALESCE(SUM(amount), 0) FROM settlement_payments WHERE settlement_id = $1",
        )
        .bind(settlement_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    async fn append_audit(&self, record: &AuditRecord) -> AppResult<()> {
        insert_audit(&self.pool, record).await
    }

    async fn audit_page(
        &self,
        filter: &AuditFilter,
        after: Option<AuditCursor>,
        limit: usize,
    ) -> AppResult<Vec<AuditRecord>> {
        let records = sqlx::query_as::<_, AuditRecord>(
            r#"
            SELECT id, entity_type, entity_id, field, old_value, new_value,
                   changed_by, changed_at, reason
            FROM audit_log
            WHERE ($1::audit_entity_type IS NULL OR entity_type = $1)
              AND ($2::uuid IS NULL OR changed_by = $2)
              AND ($3::timestamptz IS NULL OR changed_at >= $3)
              AND ($4::timestamptz IS NULL OR changed_at < $4)
              AND ($5::timestamptz IS NULL OR (changed_at, id) > ($5, $6::uuid))
            ORDER BY changed_at, id
            LIMIT $7
            "#,
        )
        .bind(filter.entity_type)
        .bind(filter.actor)
        .bind(filter.from)
        .bind(filter.to)
        .bind(after.map(|c| c.changed_at))
        .bind(after.map(|c| c.id))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

async fn insert_audit<'e, E>(executor: E, record: &AuditRecord) -> AppResult<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO audit_log (
            id, entity_type, entity_id, field, old_value, new_value,
            changed_by, changed_at, reason
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(record.id)
    .bind(record.entity_type)
    .bind(record.entity_id)
    .bind(&record.field)
    .bind(&record.old_value)
    .bind(&record.new_value)
    .bind(record.changed_by)
    .bind(record.changed_at)
    .bind(&record.reason)
    .execute(executor)
    .await?;

    Ok(())
}

/// Postgres unit of work: one transaction holding the sale's advisory lock.
/// Dropping it before `commit` rolls the transaction back.
pub struct PgLedgerUnit {
    sale_id: Uuid,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgLedgerUnit {
    fn tx(&mut self) -> AppResult<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| AppError::Internal("ledger unit already committed".to_string()))
    }
}

#[async_trait]
impl LedgerUnit for PgLedgerUnit {
    async fn sale(&mut self) -> AppResult<Option<SaleRecord>> {
        let sale_id = self.sale_id;
        let tx = self.tx()?;
        let row = sqlx::query_as::<_, SaleRow>(&format!(
            "SELECT {} FROM sales WHERE id = $1",
            SALE_COLUMNS
        ))
        .bind(sale_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(SaleRecord::from))
    }

    async fn settlement(&mut self) -> AppResult<Option<Settlement>> {
        let sale_id = self.sale_id;
        let tx = self.tx()?;
        let settlement = sqlx::query_as::<_, Settlement>(&format!(
            "SELECT {} FROM settlements WHERE sale_id = $1",
            SETTLEMENT_COLUMNS
        ))
        .bind(sale_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(settlement)
    }

    async fn save_sale(&mut self, sale: &SaleRecord) -> AppResult<()> {
        let tx = self.tx()?;
        let result = sqlx::query(
            r#"
            UPDATE sales
            SET sale_date = $2, category = $3, total_bags = $4,
                expected_amount = $5, price_breakdown = $6
            WHERE id = $1
            "#,
        )
        .bind(sale.id)
        .bind(sale.date)
        .bind(&sale.category)
        .bind(sale.total_bags)
        .bind(sale.expected_amount)
        .bind(Json(&sale.price_breakdown))
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::Internal(format!("sale {} vanished during update", sale.id)));
        }

        Ok(())
    }

    async fn save_settlement(&mut self, settlement: &Settlement) -> AppResult<()> {
        if settlement.sale_id != self.sale_id {
            return Err(AppError::Internal(format!(
                "settlement {} belongs to sale {}, not {}",
                settlement.id, settlement.sale_id, self.sale_id
            )));
        }

        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO settlements (
                id, sale_id, expected_amount, settled_amount, remaining_balance,
                is_settled, settled_at, settled_by, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                settled_amount = EXCLUDED.settled_amount,
                remaining_balance = EXCLUDED.remaining_balance,
                is_settled = EXCLUDED.is_settled,
                settled_at = COALESCE(settlements.settled_at, EXCLUDED.settled_at),
                settled_by = COALESCE(settlements.settled_by, EXCLUDED.settled_by),
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(settlement.id)
        .bind(settlement.sale_id)
        .bind(settlement.expected_amount)
        .bind(settlement.settled_amount)
        .bind(settlement.remaining_balance)
        .bind(settlement.is_settled)
        .bind(settlement.settled_at)
        .bind(settlement.settled_by)
        .bind(settlement.created_at)
        .bind(settlement.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn append_payment(&mut self, entry: &PaymentEntry) -> AppResult<()> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO settlement_payments (id, settlement_id, amount, paid_by, paid_at, notes)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id)
        .bind(entry.settlement_id)
        .bind(entry.amount)
        .bind(entry.paid_by)
        .bind(entry.paid_at)
        .bind(&entry.notes)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn payment_total(&mut self, settlement_id: Uuid) -> AppResult<Decimal> {
        let tx = self.tx()?;
        let total = sqlx::query_scalar::<_, Decimal>(
            "SELECT COALESCE(SUM(amount), 0) FROM settlement_payments WHERE settlement_id = $1",
        )
        .bind(settlement_id)
        .fetch_one(&mut **tx)
        .await?;

        Ok(total)
    }

    async fn append_audit(&mut self, record: &AuditRecord) -> AppResult<()> {
        let tx = self.tx()?;
        insert_audit(&mut **tx, record).await
    }

    async fn commit(&mut self) -> AppResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| AppError::Internal("ledger unit already committed".to_string()))?;
        tx.commit().await?;
        Ok(())
    }
}
