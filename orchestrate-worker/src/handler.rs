//! Contract between the worker runner and the code performing a stage.

use crate::error::WorkerError;
use async_trait::async_trait;
use orchestrate_engine::{RequestKind, Stage, StageError, StageEvent, StageStatus};
use orchestrate_identity::Credentials;
use serde_json::Value;

/// Everything a handler gets to know about one dispatched stage attempt.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub request_id: String,
    pub stage: Stage,
    pub attempt: u32,
    pub target_project: String,
    pub parameters: Value,
    /// Credentials of the tenant's service account.
    pub credentials: Credentials,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Succeeded(Value),
    Failed(StageError),
}

impl StageOutcome {
    pub fn status(&self) -> StageStatus {
        match self {
            StageOutcome::Succeeded(_) => StageStatus::Succeeded,
            StageOutcome::Failed(_) => StageStatus::Failed,
        }
    }

    pub fn into_event(self, request_id: &str, stage: Stage, attempt: u32) -> StageEvent {
        match self {
            StageOutcome::Succeeded(result) => {
                StageEvent::succeeded(request_id, stage, attempt, result)
            }
            StageOutcome::Failed(error) => StageEvent::failed(request_id, stage, attempt, &error),
        }
    }
}

impl From<Result<Value, WorkerError>> for StageOutcome {
    fn from(result: Result<Value, WorkerError>) -> Self {
        match result {
            Ok(value) => StageOutcome::Succeeded(value),
            Err(e) => StageOutcome::Failed(e.to_stage_error()),
        }
    }
}

/// Performs the side effect of one stage for one request kind.
#[async_trait]
pub trait StageHandler: Send + Sync {
    fn kind(&self) -> RequestKind;

    fn stage(&self) -> Stage;

    /// Run the stage. Never panics on bad input; every failure becomes a
    /// `Failed` outcome.
    async fn handle(&self, ctx: &StageContext) -> StageOutcome;
}
