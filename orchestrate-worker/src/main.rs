use anyhow::Result;
use orchestrate_engine::db::{create_pool, run_migrations};
use orchestrate_engine::{EventBus, SqliteEventBus};
use orchestrate_identity::{LocalIam, TrustStore};
use orchestrate_worker::{
    start_worker_task, ComputeProvider, DryRunProvider, ImageEndHandler, ImageStartHandler,
    InstanceEndHandler, InstancePlanner, InstanceStartHandler, StageHandler, TemplateEndHandler,
    TemplateStartHandler, Worker, WorkerConfig,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = orchestrate_logging::init_subscriber();

    info!("Starting orchestrate-worker...");

    let config = WorkerConfig::from_env();
    config.validate()?;
    info!(
        "Configuration loaded: db_path={}, project={}",
        config.db_path.display(),
        config.orchestrate_project
    );

    let pool = create_pool(&config.db_path).await?;
    run_migrations(&pool).await?;

    let trust = Arc::new(
        TrustStore::open(
            pool.clone(),
            Arc::new(LocalIam::new()),
            &config.secret_passphrase,
            &config.orchestrate_project,
            &config.operator_key,
        )
        .await?,
    );
    let bus: Arc<dyn EventBus> = Arc::new(SqliteEventBus::new(pool.clone()));
    let provider: Arc<dyn ComputeProvider> = Arc::new(DryRunProvider::new());
    info!("Using compute provider: {}", provider.name());

    let planner = Arc::new(InstancePlanner::new(
        provider.clone(),
        config.orchestrate_project.clone(),
    ));
    let handlers: Vec<Arc<dyn StageHandler>> = vec![
        Arc::new(ImageStartHandler::new(
            provider.clone(),
            config.orchestrate_project.clone(),
        )),
        Arc::new(ImageEndHandler::new(provider.clone())),
        Arc::new(TemplateStartHandler::new(provider.clone())),
        Arc::new(TemplateEndHandler::new(provider)),
        Arc::new(InstanceStartHandler::new(planner.clone())),
        Arc::new(InstanceEndHandler::new(planner)),
    ];

    let mut tasks = Vec::new();
    for handler in handlers {
        let worker = Worker::new(pool.clone(), bus.clone(), trust.clone(), handler);
        info!("Worker subscribed to {}", worker.topic());
        tasks.push(tokio::spawn(start_worker_task(
            worker,
            config.poll_interval_ms,
        )));
    }

    for task in tasks {
        task.await?;
    }

    Ok(())
}
