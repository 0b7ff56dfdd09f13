use std::{sync::Arc, time::Duration};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tracing::{info, warn};
use crate::{
    api::handler::AppState,
    config::{Config, StorageBackend},
    error::{AppError, AppResult},
    ledger::{LedgerRepository, LedgerStore, MemoryLedgerStore},
};

pub async fn initialize_app_state(config: &Config) -> AppResult<AppState> {
    info!("Initializing application components ...");

    let store: Arc<dyn LedgerStore> = match config.storage_backend {
        StorageBackend::Postgres => {
            let database_url = config.database_url().ok_or_else(|| {
                AppError::Config("DATABASE_URL must be set for the postgres backend".to_string())
            })?;
            let pool = initialize_database(database_url, config.db_max_connections).await?;
            Arc::new(LedgerRepository::new(pool))
        }
        StorageBackend::Memory => {
            warn!("⚠️  Using in-memory storage - data is lost on restart");
            let store = MemoryLedgerStore::new();
            if let Some(path) = &config.seed_sales_path {
                let count = store.load_sales_file(path)?;
                info!("✅ Seeded {} sales from {}", count, path);
            }
            Arc::new(store)
        }
    };

    let state = AppState::new(store, config.storage_backend.as_str());

    info!("✅ Reconciliation engine ready ({} storage)", state.storage);
    Ok(state)
}

async fn initialize_database(database_url: &str, max_connections: u32) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: {} max connections", max_connections);

    // Run migrations
    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("✓ Database initialized");
    Ok(pool)
}
