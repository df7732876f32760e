use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::{net::TcpListener, sync::watch};
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod errors;
mod handlers;
mod models;
mod providers;
mod routes;
mod services;
mod state;

use providers::{ProviderRegistry, b2::B2Provider, r2::R2Provider};
use services::{
    reaper::ExpiryReaper,
    session_repository::{SqliteSessionRepository, apply_schema},
    upload_service::UploadService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting upload-broker with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    // Create parent directory if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database url `{}`", db_url))?
        .create_if_missing(true);
    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?,
    );

    // --- Handle migration mode ---
    if migrate {
        let count = apply_schema(&db).await?;
        tracing::info!("Database migration complete ({} statements).", count);
        return Ok(()); // exit after migration
    }

    // --- Storage backends ---
    let mut providers = ProviderRegistry::new();
    match cfg.b2.clone() {
        Some(b2) => providers = providers.with(Arc::new(B2Provider::new(b2))),
        None => tracing::warn!("B2 credentials missing, small uploads will fail"),
    }
    match cfg.r2.clone() {
        Some(r2) => providers = providers.with(Arc::new(R2Provider::new(r2))),
        None => tracing::warn!("R2 credentials missing, large uploads will fail"),
    }

    // --- Initialize core services ---
    let repo = Arc::new(SqliteSessionRepository::new(db.clone()));
    let uploads = UploadService::new(repo.clone(), providers.clone(), cfg.session_settings()?);

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let reaper = ExpiryReaper::new(repo, providers, cfg.reap_interval);
    let reaper_handle = tokio::spawn(reaper.run(shutdown_rx));

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state::AppState {
        uploads,
        auth: auth::JwtVerifier::new(&cfg.jwt_secret),
        db,
    });

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for shutdown signal: {}", err);
            }
        })
        .await?;

    shutdown_tx.send(()).ok();
    reaper_handle.await.ok();
    tracing::info!("Shutdown complete");

    Ok(())
}
