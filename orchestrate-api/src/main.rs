use anyhow::Result;
use orchestrate_api::{create_app, start_event_pump_task, start_watchdog_task, AppState, Config};
use orchestrate_engine::db::{backup_database, create_pool, run_migrations};
use orchestrate_engine::WorkflowEngine;
use orchestrate_identity::{LocalIam, TrustStore};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = orchestrate_logging::init_subscriber();

    info!("Starting orchestrate-api service...");

    let config = Config::from_env();
    config.validate()?;
    info!(
        "Configuration loaded: bind_addr={}, db_path={}, project={}",
        config.bind_addr,
        config.db_path.display(),
        config.orchestrate_project
    );

    // Backup before migrations
    let db_path = &config.db_path;
    if db_path.exists() {
        let backup_path = backup_database(db_path)?;
        info!("Database backed up to: {}", backup_path.display());
    }

    let pool = create_pool(db_path).await?;
    info!("Running database migrations...");
    run_migrations(&pool).await?;
    info!("Migrations complete");

    let trust = TrustStore::open(
        pool.clone(),
        Arc::new(LocalIam::new()),
        &config.secret_passphrase,
        &config.orchestrate_project,
        &config.operator_key,
    )
    .await?;
    let engine = WorkflowEngine::new(pool, config.retry_policy()).with_kinds(&config.kinds);

    tokio::spawn(start_event_pump_task(engine.clone(), config.poll_interval_ms));
    tokio::spawn(start_watchdog_task(
        engine.clone(),
        config.watchdog_interval_secs,
        config.retention_secs,
    ));
    info!(
        "Background tasks started (watchdog interval: {}s, poll interval: {}ms)",
        config.watchdog_interval_secs, config.poll_interval_ms
    );

    let app = create_app(AppState::new(engine, Arc::new(trust)));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
