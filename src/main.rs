use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::{Router, routing::get};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use epi_data_api::AppState;
use epi_data_api::config::Settings;
use epi_data_api::count_cache::CountCache;
use epi_data_api::handlers;
use epi_data_api::release::ReleaseTracker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("epi_data_api=debug,tower_http=debug")
        }))
        .init();

    let settings = Settings::from_env()?;
    let port = settings.port;

    // Statement templates differ per partition, so server-side prepared
    // statement caching is disabled.
    let connect_options = PgConnectOptions::from_str(&settings.connection_string)?
        .statement_cache_capacity(0)
        .options([("statement_timeout", "60s")]);

    let pool = PgPoolOptions::new()
        .max_connections(settings.pool_max_connections)
        .acquire_timeout(settings.pool_acquire_timeout)
        .connect_with(connect_options)
        .await?;

    tracing::info!(environment = ?settings.environment, "database pool ready");

    let state = AppState {
        pool,
        counts: Arc::new(CountCache::default()),
        release: Arc::new(ReleaseTracker::new()),
        settings: Arc::new(settings),
    };

    let app = Router::new()
        .route("/v1/data", get(handlers::data::query_data))
        .route("/v1/healthcheck", get(handlers::health::probe))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("epi-data-api listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
