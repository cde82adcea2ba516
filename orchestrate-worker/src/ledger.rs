//! First-outcome-wins record of terminal stage events.
//!
//! A dispatch can be delivered more than once. The first terminal event
//! recorded for `(request_id, stage, attempt)` is the one published for every
//! later delivery of the same dispatch.

use crate::error::Result;
use chrono::Utc;
use orchestrate_engine::{stage, Stage, StageEvent};
use sqlx::SqlitePool;

#[derive(Clone)]
pub struct OutcomeLedger {
    pool: SqlitePool,
}

impl OutcomeLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn recorded(
        &self,
        request_id: &str,
        stage: Stage,
        attempt: u32,
    ) -> Result<Option<StageEvent>> {
        let payload: Option<String> = sqlx::query_scalar(
            "SELECT payload FROM stage_outcomes WHERE request_id = ? AND stage = ? AND attempt = ?",
        )
        .bind(request_id)
        .bind(stage.as_str())
        .bind(attempt as i64)
        .fetch_optional(&self.pool)
        .await?;

        match payload {
            Some(p) => Ok(Some(stage::decode(&p)?)),
            None => Ok(None),
        }
    }

    /// Record `event` unless an outcome already exists; returns whichever
    /// outcome is on record afterwards.
    pub async fn record(&self, event: &StageEvent) -> Result<StageEvent> {
        sqlx::query(
            "INSERT OR IGNORE INTO stage_outcomes (request_id, stage, attempt, status, payload, recorded_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.request_id)
        .bind(event.stage.as_str())
        .bind(event.attempt as i64)
        .bind(event.status.as_str())
        .bind(stage::encode(event)?)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        let recorded = self
            .recorded(&event.request_id, event.stage, event.attempt)
            .await?;
        Ok(recorded.unwrap_or_else(|| event.clone()))
    }
}
