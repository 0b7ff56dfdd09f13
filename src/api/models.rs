use crate::ledger::models::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

// ========== REQUEST MODELS ==========

/// Collect a payment against a sale
#[derive(Debug, Deserialize, Validate)]
pub struct RecordPaymentRequest {
    #[serde(alias = "saleId")]
    pub sale_id: Uuid,

    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,

    /// Free text from the collector, kept as-is
    #[validate(length(max = 1000, message = "notes must be at most 1000 characters"))]
    pub notes: Option<String>,
}

/// Correct one field of a sale that has no settlement yet
#[derive(Debug, Deserialize, Validate)]
pub struct CorrectSaleRequest {
    #[validate(length(min = 1, max = 128, message = "field is required"))]
    pub field: String,

    pub value: serde_json::Value,

    // Emptiness is a domain error, checked by the engine
    #[serde(default)]
    #[validate(length(max = 1000, message = "reason must be at most 1000 characters"))]
    pub reason: String,
}

/// `GET /settlements?state=`
#[derive(Debug, Default, Deserialize)]
pub struct SettlementListQuery {
    pub state: Option<LockState>,
}

// ========== RESPONSE MODELS ==========

/// Settlement with its derived lock state
#[derive(Debug, Serialize)]
pub struct SettlementView {
    #[serde(flatten)]
    pub settlement: Settlement,
    pub lock_state: LockState,
}

impl From<Settlement> for SettlementView {
    fn from(settlement: Settlement) -> Self {
        Self {
            lock_state: settlement.lock_state(),
            settlement,
        }
    }
}

/// Journal of one settlement
#[derive(Debug, Serialize)]
pub struct PaymentsResponse {
    pub settlement_id: Uuid,
    pub payments: Vec<PaymentEntry>,
    #[serde(with = "rust_decimal::serde::float")]
    pub total: Decimal,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub storage: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
