mod error;
mod api;
mod audit;
mod ledger;
mod settlement;
mod server;
mod bootstrap;
mod middleware;
mod config;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use tracing::{error, info};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,settlement_ledger=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before anything reads the environment
    dotenv::dotenv().ok();

    // Initialize tracing
    init_tracing();

    info!("🚀 Starting Settlement Reconciliation Service");

    // Load configuration
    let config = config::Config::from_env().map_err(|e| {
        error!("❌ Invalid configuration: {}", e);
        e
    })?;

    let state = bootstrap::initialize_app_state(&config).await?;

    // Create HTTP server
    let app = server::create_app(state, &config.cors_origins()).await;

    // Run the Server
    server::run_server(app, &config.bind_address).await?;

    info!("🌐 Server stopped");

    Ok(())
}
