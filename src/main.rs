use anyhow::Result;
use axum::Router;
use cloud_backup::{
    config, db, routes,
    services::{
        identity::{IdentityConfig, SqliteIdentityProvider},
        ledger::SqliteLedger,
        object_store::LocalObjectStore,
    },
    state::AppState,
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting cloud-backup with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = db::connect(&cfg.database_url).await?;

    // --- Handle migration mode ---
    if migrate {
        let applied = db::run_migrations(&db).await?;
        tracing::info!("Database migration complete ({} statements).", applied);
        return Ok(()); // exit after migration
    }
    db::run_migrations(&db).await?;

    // --- Initialize core services ---
    let identity = SqliteIdentityProvider::new(
        db.clone(),
        IdentityConfig {
            session_ttl: chrono::Duration::hours(cfg.session_ttl_hours),
            min_password_len: cfg.min_password_len,
        },
    );
    let store = LocalObjectStore::new(cfg.storage_dir.clone());
    let ledger = SqliteLedger::new(db.clone());
    let state = AppState::new(
        cfg.clone(),
        Arc::new(identity),
        Arc::new(store),
        Arc::new(ledger),
    );

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

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
    axum::serve(listener, app).await?;

    Ok(())
}
