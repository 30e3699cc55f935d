use std::{panic, process, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{Router, routing::get};
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api;
use crate::config::Config;
use crate::middleware;
use crate::repos::memory::MemoryRefreshTokenStore;
use crate::repos::refresh_token_repo::PgRefreshTokenStore;
use crate::repos::store::RefreshTokenStore;
use crate::services::auth::retry::StorePolicy;
use crate::services::auth::{TokenCodec, TokenService, TokenServiceSettings};
use crate::state::AppState;

fn init_tracing() {
    // Prefer RUST_LOG if set; otherwise use a sensible default.
    // Ex:
    // RUST_LOG=info,refresh_auth=debug,tower_http=debug cargo run
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn init_panic_hook(abort_on_panic: bool) {
    // Keep the default hook as a fallback (prints to stderr with location/payload).
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        // Always surface panics via tracing so they don't get "lost"
        // (stderr can be hidden depending on how the process is launched.)
        tracing::error!(?info, "panic");

        // Development: crash the whole process so we notice immediately.
        // Production: default behavior (stderr), the server keeps running.
        if abort_on_panic {
            process::abort();
        } else {
            default_hook(info);
        }
    }))
}

pub async fn run() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env().context("loading configuration")?;

    let abort_on_panic = !config.app_env.is_production();
    init_panic_hook(abort_on_panic);

    tracing::info!(
        "starting refresh-token service in {:?} mode on {}",
        config.app_env,
        config.addr
    );

    let state = build_state(&config).await?;
    spawn_purge_task(state.tokens.clone(), config.purge_interval);

    let app = build_router(state, &config);
    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("binding {}", config.addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn build_store(config: &Config) -> anyhow::Result<Arc<dyn RefreshTokenStore>> {
    let Some(url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set; using in-memory refresh token store");
        return Ok(Arc::new(MemoryRefreshTokenStore::new()));
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .acquire_timeout(config.store_timeout)
        .connect(url)
        .await
        .context("connecting to postgres")?;

    let store = PgRefreshTokenStore::new(pool);
    store.migrate().await.context("running migrations")?;
    Ok(Arc::new(store))
}

/// Build process-level services and inject them into the shared application state.
pub async fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let codec = TokenCodec::from_pem(
        &config.access_jwt_private_key_pem,
        &config.access_jwt_public_key_pem,
        &config.issuer,
        &config.audience,
    )
    .context("loading access token keys")?;

    let store = build_store(config).await?;

    let settings = TokenServiceSettings {
        access_token_ttl_seconds: config.access_token_ttl_seconds,
        refresh_token_ttl_seconds: config.refresh_token_ttl_seconds,
        revocation_scope: config.revocation_scope,
        store_policy: StorePolicy::default()
            .with_timeout(config.store_timeout)
            .with_max_retries(config.store_read_retries),
    };

    let tokens = Arc::new(TokenService::new(codec, store, settings));
    Ok(AppState::new(tokens))
}

pub fn build_router(state: AppState, config: &Config) -> Router {
    async fn health() -> &'static str {
        "ok"
    }

    let router = Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api::v1::routes())
        .with_state(state);

    middleware::http::apply(router, config.request_timeout)
}

fn spawn_purge_task(tokens: Arc<TokenService>, interval: Duration) {
    if interval.is_zero() {
        return;
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = tokens.purge_expired(Utc::now()).await {
                tracing::warn!(error = %e, "purge of expired refresh tokens failed");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
