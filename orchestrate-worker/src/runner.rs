//! Binds a stage handler to its topic.

use crate::error::{Result, WorkerError};
use crate::handler::{StageContext, StageHandler, StageOutcome};
use crate::ledger::OutcomeLedger;
use orchestrate_engine::{stage, ErrorCode, EventBus, StageError, StageEvent, StageStatus};
use orchestrate_identity::TrustStore;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, instrument, warn};

pub struct Worker {
    topic: String,
    subscriber: String,
    bus: Arc<dyn EventBus>,
    trust: Arc<TrustStore>,
    ledger: OutcomeLedger,
    handler: Arc<dyn StageHandler>,
}

impl Worker {
    pub fn new(
        pool: SqlitePool,
        bus: Arc<dyn EventBus>,
        trust: Arc<TrustStore>,
        handler: Arc<dyn StageHandler>,
    ) -> Self {
        let topic = stage::topic(handler.kind(), handler.stage());
        Self {
            subscriber: format!("worker:{}", topic),
            topic,
            bus,
            trust,
            ledger: OutcomeLedger::new(pool),
            handler,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Handle every dispatch waiting on the topic. Returns how many were
    /// handled.
    ///
    /// The worker's own terminal events share the topic and are skipped. A
    /// delivery is acknowledged once its outcome is published; storage errors
    /// leave it for the next pass.
    pub async fn poll_once(&self) -> Result<usize> {
        let mut subscription = self.bus.subscribe(&self.subscriber, &self.topic).await?;
        let mut handled = 0;

        while let Some(delivery) = subscription.next().await? {
            match delivery.event() {
                Ok(event) if event.status == StageStatus::Dispatched => {
                    self.process(&event).await?;
                    handled += 1;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(topic = %self.topic, seq = delivery.seq, error = %e, "Dropping malformed event");
                }
            }
            subscription.ack(delivery.seq).await?;
        }

        Ok(handled)
    }

    /// Run one dispatched attempt and publish its terminal event.
    ///
    /// A redelivered dispatch republishes the outcome on record instead of
    /// running the stage again.
    #[instrument(skip(self, event), fields(request_id = %event.request_id, stage = %event.stage, attempt = event.attempt))]
    pub async fn process(&self, event: &StageEvent) -> Result<StageEvent> {
        if let Some(recorded) = self
            .ledger
            .recorded(&event.request_id, event.stage, event.attempt)
            .await?
        {
            info!("Duplicate dispatch, republishing recorded outcome");
            self.bus.publish(&self.topic, &recorded).await?;
            return Ok(recorded);
        }

        let outcome = self.run_handler(event).await?;
        if let StageOutcome::Failed(e) = &outcome {
            warn!(code = %e.code.as_str(), error = %e.message, "Stage failed");
        }

        let terminal = self
            .ledger
            .record(&outcome.into_event(&event.request_id, event.stage, event.attempt))
            .await?;
        self.bus.publish(&self.topic, &terminal).await?;

        debug!(status = %terminal.status, "Published stage outcome");
        Ok(terminal)
    }

    async fn run_handler(&self, event: &StageEvent) -> Result<StageOutcome> {
        let context = match event.dispatch_context() {
            Ok(context) => context,
            Err(e) => {
                return Ok(StageOutcome::Failed(StageError::new(
                    ErrorCode::InvalidParameters,
                    e.to_string(),
                )))
            }
        };

        let credentials = match self.trust.credentials(&context.target_project).await {
            Ok(credentials) => credentials,
            Err(e) => {
                let e = WorkerError::from(e);
                if e.is_infrastructure() {
                    return Err(e);
                }
                return Ok(StageOutcome::Failed(e.to_stage_error()));
            }
        };

        let ctx = StageContext {
            request_id: event.request_id.clone(),
            stage: event.stage,
            attempt: event.attempt,
            target_project: context.target_project,
            parameters: context.parameters,
            credentials,
        };

        Ok(self.handler.handle(&ctx).await)
    }
}

pub async fn start_worker_task(worker: Worker, poll_interval_ms: u64) {
    let mut interval = interval(Duration::from_millis(poll_interval_ms.max(10)));

    info!(
        "Worker for {} running (polls every {} ms)",
        worker.topic(),
        poll_interval_ms
    );

    loop {
        interval.tick().await;

        match worker.poll_once().await {
            Ok(0) => {}
            Ok(handled) => debug!(topic = %worker.topic(), handled, "Handled dispatches"),
            Err(e) => error!("Worker error on {}: {}", worker.topic(), e),
        }
    }
}
