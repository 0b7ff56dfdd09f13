use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

use crate::error::{AppError, AppResult, ReconciliationError};

/// Decimal places kept for money, matching the `NUMERIC(20, 2)` columns
pub const MONEY_SCALE: u32 = 2;

/// Largest amount a `NUMERIC(20, 2)` column holds
pub fn max_money() -> Decimal {
    Decimal::from_i128_with_scale(99_999_999_999_999_999_999, MONEY_SCALE)
}

/// Positive, at most cent precision and storable
pub fn is_valid_amount(amount: Decimal) -> bool {
    amount > Decimal::ZERO && amount.normalize().scale() <= MONEY_SCALE && amount <= max_money()
}

/// Role carried by the actor identity the session layer hands us.
/// Not enforced here; recorded so audit readers know who acted in what capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Staff,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Staff => "staff",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "manager" => Some(Role::Manager),
            "staff" => Some(Role::Staff),
            _ => None,
        }
    }
}

/// Whoever performed an action. Passed explicitly into every engine call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Uuid,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }
}

/// One price tier applied to a sale
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTier {
    pub tier_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub unit_price: Decimal,
    pub bag_count: i32,
    pub label: String,
}

impl PriceTier {
    /// `None` when the product does not fit in a `Decimal`
    pub fn subtotal(&self) -> Option<Decimal> {
        Decimal::from(self.bag_count).checked_mul(self.unit_price)
    }
}

/// Sale snapshot produced by sales intake.
///
/// Read-only to reconciliation except through sale-field corrections, which are
/// refused once a settlement exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleRecord {
    pub id: Uuid,
    pub date: NaiveDate,
    pub category: String,
    pub total_bags: i32,
    #[serde(with = "rust_decimal::serde::float")]
    pub expected_amount: Decimal,
    pub price_breakdown: Vec<PriceTier>,
}

impl SaleRecord {
    /// Build a sale whose totals are derived from its price breakdown.
    pub fn new(
        id: Uuid,
        date: NaiveDate,
        category: impl Into<String>,
        price_breakdown: Vec<PriceTier>,
    ) -> AppResult<Self> {
        let mut sale = Self {
            id,
            date,
            category: category.into(),
            total_bags: 0,
            expected_amount: Decimal::ZERO,
            price_breakdown,
        };
        sale.recompute_totals()?;
        Ok(sale)
    }

    /// Recalculate `total_bags` and `expected_amount` from the price breakdown.
    /// Totals that cannot be represented or stored leave the sale untouched.
    pub fn recompute_totals(&mut self) -> AppResult<()> {
        let too_large = || {
            AppError::InvalidInput(format!("price breakdown totals of sale {} are too large", self.id))
        };

        let mut total_bags: i32 = 0;
        let mut expected_amount = Decimal::ZERO;
        for tier in &self.price_breakdown {
            total_bags = total_bags.checked_add(tier.bag_count).ok_or_else(too_large)?;
            expected_amount = tier
                .subtotal()
                .and_then(|subtotal| expected_amount.checked_add(subtotal))
                .ok_or_else(too_large)?;
        }
        if expected_amount > max_money() {
            return Err(too_large());
        }

        self.total_bags = total_bags;
        self.expected_amount = expected_amount;
        Ok(())
    }

    pub fn tier_mut(&mut self, tier_id: &str) -> Option<&mut PriceTier> {
        self.price_breakdown.iter_mut().find(|t| t.tier_id == tier_id)
    }
}

/// Reconciliation state of a sale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Unsettled,
    PartiallySettled,
    FullySettled,
}

impl LockState {
    /// No settlement row means nothing has been collected yet.
    pub fn of(settlement: Option<&Settlement>) -> Self {
        settlement.map_or(LockState::Unsettled, Settlement::lock_state)
    }
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LockState::Unsettled => "unsettled",
            LockState::PartiallySettled => "partially_settled",
            LockState::FullySettled => "fully_settled",
        };
        write!(f, "{}", s)
    }
}

/// Settlement entity - collection progress against one sale
///
/// INVARIANTS:
/// - remaining_balance == expected_amount - settled_amount, never negative
/// - is_settled == (remaining_balance == 0), and never reverts
/// - settled_amount == sum of the settlement's journal entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Settlement {
    pub id: Uuid,
    pub sale_id: Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    pub expected_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub settled_amount: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub remaining_balance: Decimal,
    pub is_settled: bool,
    pub settled_at: Option<DateTime<Utc>>,
    pub settled_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Settlement {
    /// A settlement that has not collected anything yet. The expected amount is
    /// frozen here for the life of the settlement.
    pub fn open(sale_id: Uuid, expected_amount: Decimal, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sale_id,
            expected_amount,
            settled_amount: Decimal::ZERO,
            remaining_balance: expected_amount,
            is_settled: false,
            settled_at: None,
            settled_by: None,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn lock_state(&self) -> LockState {
        if self.remaining_balance.is_zero() {
            LockState::FullySettled
        } else {
            LockState::PartiallySettled
        }
    }

    /// Next state after collecting `amount`, or the reason it cannot be collected.
    pub fn with_payment(
        &self,
        amount: Decimal,
        paid_by: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Settlement, ReconciliationError> {
        if !is_valid_amount(amount) {
            return Err(ReconciliationError::InvalidAmount(amount));
        }

        // A freshly opened settlement is never locked, even when it expects nothing
        if self.is_settled {
            return Err(ReconciliationError::LockedSettlement(format!(
                "settlement for sale {} is fully settled",
                self.sale_id
            )));
        }

        let overpayment = ReconciliationError::OverpaymentRejected {
            amount,
            remaining: self.remaining_balance,
        };
        let (settled_amount, remaining_balance) = match self
            .settled_amount
            .checked_add(amount)
            .and_then(|settled| Some((settled, self.expected_amount.checked_sub(settled)?)))
        {
            Some((settled, remaining)) if remaining >= Decimal::ZERO => (settled, remaining),
            _ => return Err(overpayment),
        };

        let is_settled = remaining_balance.is_zero();
        let mut next = self.clone();
        next.settled_amount = settled_amount;
        next.remaining_balance = remaining_balance;
        next.is_settled = is_settled;
        next.updated_at = at;
        if is_settled {
            next.settled_at = Some(at);
            next.settled_by = Some(paid_by);
        }

        Ok(next)
    }
}

/// One collection event. Never edited after it is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PaymentEntry {
    pub id: Uuid,
    pub settlement_id: Uuid,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub paid_by: Uuid,
    pub paid_at: DateTime<Utc>,
    pub notes: Option<String>,
}

/// Audited entity kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "audit_entity_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Sale,
    Settlement,
    Other,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Sale => "sale",
            EntityType::Settlement => "settlement",
            EntityType::Other => "other",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct AuditRecord {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub field: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_by: Uuid,
    pub changed_at: DateTime<Utc>,
    pub reason: String,
}

/// A change to audit, before it is stamped with an id and timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditRecord {
    pub entity_type: EntityType,
    pub entity_id: Uuid,
    pub field: Option<String>,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub changed_by: Uuid,
    pub reason: String,
}

impl NewAuditRecord {
    pub fn change(entity_type: EntityType, entity_id: Uuid, change: FieldChange, changed_by: Uuid, reason: &str) -> Self {
        Self {
            entity_type,
            entity_id,
            field: Some(change.field),
            old_value: change.old_value,
            new_value: change.new_value,
            changed_by,
            reason: reason.to_string(),
        }
    }

    pub fn stamp(self, changed_at: DateTime<Utc>) -> Result<AuditRecord, ReconciliationError> {
        if self.reason.trim().is_empty() {
            return Err(ReconciliationError::MissingReason);
        }

        Ok(AuditRecord {
            id: Uuid::new_v4(),
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            field: self.field,
            old_value: self.old_value,
            new_value: self.new_value,
            changed_by: self.changed_by,
            changed_at,
            reason: self.reason,
        })
    }
}

/// Old and new rendering of a single field
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl FieldChange {
    pub fn new(field: impl Into<String>, old_value: impl ToString, new_value: impl ToString) -> Self {
        Self {
            field: field.into(),
            old_value: Some(old_value.to_string()),
            new_value: Some(new_value.to_string()),
        }
    }
}
