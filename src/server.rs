use axum::{
    middleware::from_fn,
    routing::{get, patch, post},
    Router,
};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;
use crate::{
    api::{
        handler::{
            correct_sale, get_sale, get_settlement, get_settlement_payments, health_check,
            list_settlements, query_audit, record_payment, verify_settlement, AppState,
        },
        models::{CorrectSaleRequest, RecordPaymentRequest},
    },
    middleware::{create_cors_layer, require_actor, validate_json},
};

pub async fn create_app(state: AppState, cors_origins: &[String]) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))

        // API v1 routes, all of which need an actor identity
        .nest("/api/v1",
            Router::new()
                // Settlement endpoints
                .route(
                    "/settlement/payment",
                    post(record_payment).route_layer(from_fn(validate_json::<RecordPaymentRequest>)),
                )
                .route("/settlement/:id", get(get_settlement))
                .route("/settlement/:id/payments", get(get_settlement_payments))
                .route("/settlement/:id/verify", get(verify_settlement))
                .route("/settlements", get(list_settlements))

                // Sale endpoints
                .route(
                    "/sale/:id",
                    get(get_sale).merge(
                        patch(correct_sale).route_layer(from_fn(validate_json::<CorrectSaleRequest>)),
                    ),
                )

                // Audit endpoints
                .route("/audit", get(query_audit))
                .route_layer(from_fn(require_actor))
        )
        .layer(CompressionLayer::new())
        .layer(create_cors_layer(cors_origins))
        // Add request tracing
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server(app: Router, bind_address: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app).await
}
