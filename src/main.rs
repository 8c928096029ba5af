use anyhow::Result;
use std::sync::Arc;

mod allocator;
mod auth;
mod config;
mod converters;
mod crypto;
mod custom_api;
mod error;
mod health;
mod http;
mod models;
mod routes;
mod store;
mod streaming;
mod thinking_parser;
mod tokenizer;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::load()?;
    config.validate()?;

    // Initialize logging with the configured level
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    tracing::info!("🚀 KiroGate starting...");
    if config.is_production() {
        tracing::info!("Running in production mode");
    }

    // Persistence and secret handling
    let secrets = crypto::SecretBox::new(&config.token_encrypt_key);
    let store = Arc::new(store::Store::open(&config.database_path, secrets)?);
    tracing::info!("✅ Store opened at {}", config.database_path.display());

    match store.purge_expired_sessions() {
        Ok(0) => {}
        Ok(n) => tracing::info!("Purged {} expired sessions", n),
        Err(e) => tracing::warn!("Session purge failed: {}", e),
    }

    // Shared outbound HTTP client (proxy-aware)
    let http_client = http::build_client(&config)?;

    let auth_cache = Arc::new(auth::AuthManagerCache::new(http_client.clone()));
    let allocator = Arc::new(allocator::TokenAllocator::new(
        store.clone(),
        auth_cache.clone(),
        config.fallback.profile_arn.clone(),
    ));
    let dispatcher = Arc::new(custom_api::CustomApiDispatcher::new(http_client.clone()));
    let oauth_states = Arc::new(auth::oauth_state::OAuthStateRegistry::new());

    if config.fallback.refresh_token.is_some() {
        tracing::info!("Global fallback identity configured from environment");
    }

    // Background health checks
    let health_checker = Arc::new(health::HealthChecker::new(
        store.clone(),
        auth_cache.clone(),
        config.health_check_interval,
        config.fallback.profile_arn.clone(),
    ));
    let _health_task = health_checker.spawn();

    let config = Arc::new(config);
    let app_state = routes::AppState {
        store,
        auth_cache,
        allocator,
        dispatcher,
        oauth_states,
        http_client,
        config: config.clone(),
    };

    let app = routes::build_app(app_state)
        .layer(tower_http::cors::CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any));

    let addr = format!("{}:{}", config.server_host, config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🚀 Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("👋 Server shutdown complete");
    Ok(())
}

/// Handle graceful shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown...");
        },
    }
}
