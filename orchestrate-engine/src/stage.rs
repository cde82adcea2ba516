//! Stages, stage events and their wire encoding.

use crate::error::{ErrorCode, OrchestratorError, Result};
use crate::request::RequestKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;

/// Version of the bus envelope written by [`encode`].
pub const WIRE_VERSION: u32 = 1;

/// One phase of a provisioning workflow.
///
/// Stages run in the order given by [`Stage::first`] and [`Stage::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Start,
    End,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Start, Stage::End];

    pub fn first() -> Stage {
        Stage::Start
    }

    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Start => Some(Stage::End),
            Stage::End => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::End => "end",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Dispatched,
    Succeeded,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageStatus::Dispatched)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Dispatched => "dispatched",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error detail attached to a failed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct StageError {
    pub code: ErrorCode,
    pub message: String,
}

impl StageError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Context carried by a dispatched event so workers never read the request store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchContext {
    pub kind: RequestKind,
    pub target_project: String,
    pub parameters: serde_json::Value,
}

/// A message placed on the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub request_id: String,
    pub stage: Stage,
    pub status: StageStatus,
    pub attempt: u32,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub emitted_at: DateTime<Utc>,
}

impl StageEvent {
    pub fn dispatched(
        request_id: &str,
        stage: Stage,
        attempt: u32,
        context: &DispatchContext,
    ) -> Result<Self> {
        Ok(Self {
            request_id: request_id.to_string(),
            stage,
            status: StageStatus::Dispatched,
            attempt,
            payload: serde_json::to_value(context)?,
            emitted_at: Utc::now(),
        })
    }

    pub fn succeeded(request_id: &str, stage: Stage, attempt: u32, result: serde_json::Value) -> Self {
        Self {
            request_id: request_id.to_string(),
            stage,
            status: StageStatus::Succeeded,
            attempt,
            payload: result,
            emitted_at: Utc::now(),
        }
    }

    pub fn failed(request_id: &str, stage: Stage, attempt: u32, error: &StageError) -> Self {
        Self {
            request_id: request_id.to_string(),
            stage,
            status: StageStatus::Failed,
            attempt,
            payload: json!({ "error": error }),
            emitted_at: Utc::now(),
        }
    }

    /// Dispatch context of a `dispatched` event.
    pub fn dispatch_context(&self) -> Result<DispatchContext> {
        if self.status != StageStatus::Dispatched {
            return Err(OrchestratorError::MalformedEvent(format!(
                "{} event for {} carries no dispatch context",
                self.status, self.request_id
            )));
        }
        serde_json::from_value(self.payload.clone())
            .map_err(|e| OrchestratorError::MalformedEvent(e.to_string()))
    }

    /// Error detail of a `failed` event, falling back to a generic stage failure.
    pub fn error(&self) -> StageError {
        self.payload
            .get("error")
            .and_then(|e| serde_json::from_value::<StageError>(e.clone()).ok())
            .unwrap_or_else(|| {
                StageError::new(
                    ErrorCode::StageFailed,
                    format!("{} stage failed without detail", self.stage),
                )
            })
    }
}

/// Topic carrying events of one stage for one request kind.
pub fn topic(kind: RequestKind, stage: Stage) -> String {
    format!("{}-provisioning-{}", kind.as_str(), stage.as_str())
}

/// Every topic the engine publishes to or consumes from.
pub fn all_topics() -> Vec<String> {
    RequestKind::ALL
        .iter()
        .flat_map(|kind| Stage::ALL.iter().map(move |stage| topic(*kind, *stage)))
        .collect()
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    event: StageEvent,
}

pub fn encode(event: &StageEvent) -> Result<String> {
    let envelope = Envelope {
        version: WIRE_VERSION,
        event: event.clone(),
    };
    Ok(serde_json::to_string(&envelope)?)
}

pub fn decode(payload: &str) -> Result<StageEvent> {
    let raw: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| OrchestratorError::MalformedEvent(e.to_string()))?;

    let version = raw.get("version").and_then(|v| v.as_u64());
    if version != Some(WIRE_VERSION as u64) {
        return Err(OrchestratorError::MalformedEvent(format!(
            "unsupported envelope version: {:?}",
            version
        )));
    }

    let envelope: Envelope =
        serde_json::from_value(raw).map_err(|e| OrchestratorError::MalformedEvent(e.to_string()))?;
    Ok(envelope.event)
}
