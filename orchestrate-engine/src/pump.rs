//! Drains stage events from the bus into the workflow engine.

use crate::bus::EventBus;
use crate::engine::{ApplyResult, WorkflowEngine};
use crate::error::Result;
use crate::stage;
use tracing::warn;

/// Subscriber name of the engine on every topic.
pub const ENGINE_SUBSCRIBER: &str = "workflow-engine";

/// Apply everything waiting on the bus. Returns how many events changed a
/// request.
///
/// A message is acknowledged only after it has been applied, so a database
/// error leaves it to be redelivered on the next pass. Malformed messages are
/// logged and acknowledged.
pub async fn pump_once(engine: &WorkflowEngine, bus: &dyn EventBus) -> Result<usize> {
    let mut applied = 0;

    for topic in stage::all_topics() {
        let mut subscription = bus.subscribe(ENGINE_SUBSCRIBER, &topic).await?;

        while let Some(delivery) = subscription.next().await? {
            match delivery.event() {
                Ok(event) => {
                    if let ApplyResult::Applied(_) = engine.apply_event(&event).await? {
                        applied += 1;
                    }
                }
                Err(e) => {
                    warn!(topic = %topic, seq = delivery.seq, error = %e, "Dropping malformed event");
                }
            }
            subscription.ack(delivery.seq).await?;
        }
    }

    Ok(applied)
}
