use chrono::Utc;
use orchestrate_engine::{PruneStats, WorkflowEngine};
use tokio::time::{interval, Duration};
use tracing::{error, info};

/// Periodically fail overdue stages, re-dispatch due retries and prune
/// history older than `retention_secs`.
pub async fn start_watchdog_task(engine: WorkflowEngine, interval_secs: u64, retention_secs: u64) {
    let mut interval = interval(Duration::from_secs(interval_secs.max(1)));

    info!(
        "Watchdog task running (checks every {} seconds)",
        interval_secs
    );

    loop {
        interval.tick().await;

        if let Err(e) = run_watchdog_once(&engine).await {
            error!("Watchdog pass failed: {}", e);
        }
        if let Err(e) = prune_history(&engine, retention_secs).await {
            error!("History pruning failed: {}", e);
        }
    }
}

/// One pass: returns `(expired, retried)`.
pub async fn run_watchdog_once(engine: &WorkflowEngine) -> anyhow::Result<(usize, usize)> {
    let (expired, retried) = engine.tick(Utc::now()).await?;

    if expired > 0 || retried > 0 {
        info!(expired, retried, "Watchdog pass");
    }

    Ok((expired, retried))
}

/// Remove acknowledged bus messages and dedup rows of requests that settled
/// more than `retention_secs` ago.
pub async fn prune_history(engine: &WorkflowEngine, retention_secs: u64) -> anyhow::Result<PruneStats> {
    let retention = chrono::Duration::try_seconds(i64::try_from(retention_secs)?)
        .ok_or_else(|| anyhow::anyhow!("retention of {}s is out of range", retention_secs))?;
    let cutoff = Utc::now()
        .checked_sub_signed(retention)
        .ok_or_else(|| anyhow::anyhow!("retention of {}s is out of range", retention_secs))?;

    Ok(engine.prune_history(cutoff).await?)
}
