use orchestrate_engine::{pump_once, EventBus, WorkflowEngine};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

/// Feed stage events from the bus into the engine.
pub async fn start_event_pump_task(engine: WorkflowEngine, poll_interval_ms: u64) {
    let bus = engine.bus().clone();
    let mut interval = interval(Duration::from_millis(poll_interval_ms.max(10)));

    info!("Event pump running (polls every {} ms)", poll_interval_ms);

    loop {
        interval.tick().await;

        match drain(&engine, &bus).await {
            Ok(0) => {}
            Ok(applied) => debug!(applied, "Applied stage events"),
            Err(e) => error!("Event pump error: {}", e),
        }
    }
}

/// Apply everything currently on the bus.
pub async fn drain(engine: &WorkflowEngine, bus: &dyn EventBus) -> anyhow::Result<usize> {
    Ok(pump_once(engine, bus).await?)
}
