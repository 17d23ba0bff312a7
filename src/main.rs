use std::sync::Arc;

use anyhow::Context;
use axum::{Router, debug_handler, response::IntoResponse, routing::get};
use roomsync::{
    AppState, ServerConfig, StoreGateway,
    gateway::{MemoryGateway, SqliteGateway},
    rooms,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,roomsync=debug")),
        )
        .init();

    let config = ServerConfig::from_env()?;

    let gateway: Arc<dyn StoreGateway> = match &config.database_url {
        Some(url) => Arc::new(
            SqliteGateway::connect(url, config.max_connections)
                .await
                .with_context(|| format!("connecting to {url}"))?,
        ),
        None => {
            tracing::warn!("DATABASE_URL not set, rows live in memory only");
            Arc::new(MemoryGateway::new())
        }
    };

    let app_state = AppState {
        gateway,
        sync: config.sync.clone(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .nest("/r", rooms::router())
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

#[debug_handler]
async fn health() -> impl IntoResponse {
    "ok"
}
