use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::Utc;
use futures::TryStreamExt;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::models::*;
use crate::{
    audit::AuditLog,
    error::AppResult,
    ledger::{
        models::{Actor, AuditRecord, SaleRecord},
        AuditFilter, LedgerStore,
    },
    settlement::{LedgerCheck, PaymentJournal, ReconciliationEngine, SaleCorrection, SettlementLedger},
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
    pub ledger: Arc<SettlementLedger>,
    pub journal: Arc<PaymentJournal>,
    pub audit: Arc<AuditLog>,
    /// Backend name reported by the health check
    pub storage: &'static str,
}

impl AppState {
    /// Wire every component over one store
    pub fn new(store: Arc<dyn LedgerStore>, storage: &'static str) -> Self {
        let journal = Arc::new(PaymentJournal::new(store.clone()));
        let audit = Arc::new(AuditLog::new(store.clone()));
        let ledger = Arc::new(SettlementLedger::new(store.clone()));
        let engine = Arc::new(ReconciliationEngine::new(
            store,
            journal.clone(),
            audit.clone(),
        ));

        Self {
            engine,
            ledger,
            journal,
            audit,
            storage,
        }
    }
}

/// Record a collection against a sale
/// POST /settlement/payment
pub async fn record_payment(
    State(state): State<AppState>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<RecordPaymentRequest>,
) -> AppResult<Json<SettlementView>> {
    info!(
        "Recording payment of {} for sale {} by {}",
        request.amount, request.sale_id, actor.user_id
    );

    let settlement = state
        .engine
        .apply_payment(request.sale_id, request.amount, &actor, request.notes)
        .await?;

    Ok(Json(SettlementView::from(settlement)))
}

/// GET /settlement/:sale_id
pub async fn get_settlement(
    State(state): State<AppState>,
    Path(sale_id): Path<Uuid>,
) -> AppResult<Json<SettlementView>> {
    let settlement = state.ledger.get_settlement(sale_id).await?;
    Ok(Json(SettlementView::from(settlement)))
}

/// Journal entries of a settlement, oldest first
/// GET /settlement/:settlement_id/payments
pub async fn get_settlement_payments(
    State(state): State<AppState>,
    Path(settlement_id): Path<Uuid>,
) -> AppResult<Json<PaymentsResponse>> {
    let settlement = state.ledger.find_by_id(settlement_id).await?;
    let payments = state.journal.list_for(settlement.id).await?;
    let total = payments.iter().map(|p| p.amount).sum();

    Ok(Json(PaymentsResponse {
        settlement_id: settlement.id,
        payments,
        total,
    }))
}

/// GET /settlement/:sale_id/verify
pub async fn verify_settlement(
    State(state): State<AppState>,
    Path(sale_id): Path<Uuid>,
) -> AppResult<Json<LedgerCheck>> {
    Ok(Json(state.ledger.verify(sale_id).await?))
}

/// GET /settlements?state=partially_settled
pub async fn list_settlements(
    State(state): State<AppState>,
    Query(query): Query<SettlementListQuery>,
) -> AppResult<Json<Vec<SettlementView>>> {
    let settlements = state.ledger.list(query.state).await?;
    Ok(Json(settlements.into_iter().map(SettlementView::from).collect()))
}

/// GET /sale/:id
pub async fn get_sale(
    State(state): State<AppState>,
    Path(sale_id): Path<Uuid>,
) -> AppResult<Json<SaleRecord>> {
    Ok(Json(state.engine.sale(sale_id).await?))
}

/// Correct a sale field before any collection has started
/// PATCH /sale/:id
pub async fn correct_sale(
    State(state): State<AppState>,
    Path(sale_id): Path<Uuid>,
    Extension(actor): Extension<Actor>,
    Json(request): Json<CorrectSaleRequest>,
) -> AppResult<Json<SaleRecord>> {
    info!("Correcting {} on sale {} by {}", request.field, sale_id, actor.user_id);

    let correction = SaleCorrection::parse(&request.field, &request.value)?;
    let sale = state
        .engine
        .correct_sale_field(sale_id, correction, &actor, &request.reason)
        .await?;

    Ok(Json(sale))
}

/// GET /audit?entity_type=&actor=&from=&to=
pub async fn query_audit(
    State(state): State<AppState>,
    Query(filter): Query<AuditFilter>,
) -> AppResult<Json<Vec<AuditRecord>>> {
    let records: Vec<AuditRecord> = state.audit.query(filter).try_collect().await?;
    Ok(Json(records))
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        storage: state.storage.to_string(),
        timestamp: Utc::now(),
    })
}
