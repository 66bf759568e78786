use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use billing_rs::{
    billing_router, db, AppState, BillingStore, Config, GatewayType, MemoryStore, MockGateway,
    PaymentGateway, PgStore, StoreType, WhopClient,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let store: Arc<dyn BillingStore> = match config.store_type {
        StoreType::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set when STORE_TYPE=postgres")?;

            tracing::info!("Connecting to database...");
            let pool = db::init_pool(database_url)
                .await
                .context("Failed to connect to database")?;

            tracing::info!("Running migrations...");
            db::run_migrations(&pool)
                .await
                .context("Failed to run migrations")?;

            Arc::new(PgStore::new(pool))
        }
        StoreType::Memory => {
            tracing::info!("Using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let gateway: Arc<dyn PaymentGateway> = match config.gateway_type {
        GatewayType::Whop => {
            let client = WhopClient::from_env().context("Failed to build Whop client")?;
            Arc::new(client)
        }
        GatewayType::Mock => {
            tracing::info!("Using mock payment gateway");
            Arc::new(MockGateway::new())
        }
    };

    let state = AppState::new(store, gateway, config.webhook_secret.clone());
    let app = billing_router(state).layer(
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    );

    let addr = SocketAddr::new(config.host.parse()?, config.port);
    tracing::info!("Billing module listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind")?;

    axum::serve(listener, app).await.context("Server failed")?;

    Ok(())
}
