use crate::error::OrchestratorError;
use crate::stage::{Stage, StageError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Image,
    Template,
    Instance,
    System,
}

impl RequestKind {
    pub const ALL: [RequestKind; 4] = [
        RequestKind::Image,
        RequestKind::Template,
        RequestKind::Instance,
        RequestKind::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Image => "image",
            RequestKind::Template => "template",
            RequestKind::Instance => "instance",
            RequestKind::System => "system",
        }
    }
}

impl FromStr for RequestKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| OrchestratorError::InvalidParameters(format!("unknown kind: {}", s)))
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    StartDispatched,
    StartSucceeded,
    StartFailed,
    EndDispatched,
    EndSucceeded,
    EndFailed,
    Cancelling,
    Cancelled,
}

impl RequestState {
    pub fn dispatched(stage: Stage) -> Self {
        match stage {
            Stage::Start => RequestState::StartDispatched,
            Stage::End => RequestState::EndDispatched,
        }
    }

    pub fn succeeded(stage: Stage) -> Self {
        match stage {
            Stage::Start => RequestState::StartSucceeded,
            Stage::End => RequestState::EndSucceeded,
        }
    }

    pub fn failed(stage: Stage) -> Self {
        match stage {
            Stage::Start => RequestState::StartFailed,
            Stage::End => RequestState::EndFailed,
        }
    }

    /// Stage this state belongs to. `Cancelling` is only entered while the
    /// first stage is in flight.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            RequestState::Pending | RequestState::Cancelled => None,
            RequestState::StartDispatched
            | RequestState::StartSucceeded
            | RequestState::StartFailed
            | RequestState::Cancelling => Some(Stage::Start),
            RequestState::EndDispatched | RequestState::EndSucceeded | RequestState::EndFailed => {
                Some(Stage::End)
            }
        }
    }

    /// States in which a stage has been handed to a worker and no terminal
    /// event has been applied yet.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            RequestState::StartDispatched | RequestState::EndDispatched | RequestState::Cancelling
        )
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RequestState::StartFailed | RequestState::EndFailed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestState::Pending => "pending",
            RequestState::StartDispatched => "start_dispatched",
            RequestState::StartSucceeded => "start_succeeded",
            RequestState::StartFailed => "start_failed",
            RequestState::EndDispatched => "end_dispatched",
            RequestState::EndSucceeded => "end_succeeded",
            RequestState::EndFailed => "end_failed",
            RequestState::Cancelling => "cancelling",
            RequestState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What became of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Cancellation {
    Requested,
    Effective,
    Ineffective,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ProvisioningRequest {
    pub id: String,
    pub kind: RequestKind,
    pub target_project: String,
    #[schema(value_type = Object)]
    pub parameters: serde_json::Value,
    pub state: RequestState,
    pub start_attempt: u32,
    pub end_attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<StageError>,
    pub cancellation: Option<Cancellation>,
}

impl ProvisioningRequest {
    pub fn attempt(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Start => self.start_attempt,
            Stage::End => self.end_attempt,
        }
    }

    /// Dispatch counter of the stage the request is currently in.
    pub fn current_attempt(&self) -> u32 {
        self.state.stage().map(|s| self.attempt(s)).unwrap_or(0)
    }

    /// A failed state is terminal unless a retry has been scheduled.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            RequestState::EndSucceeded | RequestState::Cancelled => true,
            RequestState::StartFailed | RequestState::EndFailed => self.retry_at.is_none(),
            _ => false,
        }
    }

    pub fn status(&self) -> RequestStatus {
        RequestStatus {
            request_id: self.id.clone(),
            kind: self.kind,
            target_project: self.target_project.clone(),
            state: self.state,
            stage: self.state.stage(),
            attempt: self.current_attempt(),
            terminal: self.is_terminal(),
            retry_at: self.retry_at,
            last_error: self.last_error.clone(),
            cancellation: self.cancellation,
            updated_at: self.updated_at,
        }
    }
}

/// Caller-facing view returned by `GetStatus`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RequestStatus {
    pub request_id: String,
    pub kind: RequestKind,
    pub target_project: String,
    pub state: RequestState,
    pub stage: Option<Stage>,
    pub attempt: u32,
    pub terminal: bool,
    pub retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<StageError>,
    pub cancellation: Option<Cancellation>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubmitRequest {
    pub kind: RequestKind,
    pub target_project: String,
    #[serde(default = "empty_parameters")]
    #[schema(value_type = Object)]
    pub parameters: serde_json::Value,
}

fn empty_parameters() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestFilters {
    pub target_project: Option<String>,
    pub state: Option<RequestState>,
    pub kind: Option<RequestKind>,
}

/// One row of a request's state history.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Transition {
    pub from_state: Option<RequestState>,
    pub to_state: RequestState,
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CancelResult {
    /// Nothing was in flight; the request is now cancelled.
    Cancelled,
    /// The first stage is in flight; its outcome decides the final state.
    Cancelling,
    /// The request is past the point of no return or already finished.
    Ineffective,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CancelOutcome {
    pub request_id: String,
    pub outcome: CancelResult,
    pub state: RequestState,
}
