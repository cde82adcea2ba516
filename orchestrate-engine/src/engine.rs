use crate::bus::SqliteEventBus;
use crate::error::{ErrorCode, OrchestratorError, Result};
use crate::policy::RetryPolicy;
use crate::request::{
    CancelOutcome, CancelResult, Cancellation, ProvisioningRequest, RequestFilters, RequestKind,
    RequestState, SubmitRequest, Transition,
};
use crate::stage::{self, DispatchContext, Stage, StageError, StageEvent, StageStatus};
use crate::state_machine::{self, CancelDecision, Decision, Outcome};
use crate::validation::{validate_parameters, validate_project_id};
use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Concurrent cancellations re-read the request at most this many times.
const MAX_CANCEL_ROUNDS: usize = 3;

/// What applying a stage event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyResult {
    Applied(RequestState),
    /// Already applied once.
    Duplicate,
    /// Not for the stage attempt in flight.
    Stale,
    UnknownRequest,
    /// `dispatched` events are addressed to workers.
    Ignored,
    /// Another handler advanced the request first.
    LostRace,
}

/// Rows removed by one `prune_history` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub messages: u64,
    pub applied_events: u64,
}

/// Owns the state of every provisioning request.
#[derive(Clone)]
pub struct WorkflowEngine {
    pool: SqlitePool,
    bus: SqliteEventBus,
    policy: RetryPolicy,
    /// Kinds accepted by `submit`.
    kinds: Vec<RequestKind>,
}

struct Plan {
    next: ProvisioningRequest,
    transitions: Vec<(Option<RequestState>, RequestState, u32)>,
    dispatch: Option<Stage>,
}

impl Plan {
    fn new(request: &ProvisioningRequest) -> Self {
        Self {
            next: request.clone(),
            transitions: Vec::new(),
            dispatch: None,
        }
    }

    fn move_to(&mut self, state: RequestState, attempt: u32) {
        self.transitions
            .push((Some(self.next.state), state, attempt));
        self.next.state = state;
    }

    fn dispatch(&mut self, stage: Stage, now: DateTime<Utc>) {
        let attempt = self.next.attempt(stage) + 1;
        match stage {
            Stage::Start => self.next.start_attempt = attempt,
            Stage::End => self.next.end_attempt = attempt,
        }
        self.move_to(RequestState::dispatched(stage), attempt);
        self.next.dispatched_at = Some(now);
        self.next.retry_at = None;
        self.dispatch = Some(stage);
    }

    fn settle(&mut self, state: RequestState, attempt: u32) {
        self.move_to(state, attempt);
        self.next.dispatched_at = None;
        self.next.retry_at = None;
    }
}

impl WorkflowEngine {
    pub fn new(pool: SqlitePool, policy: RetryPolicy) -> Self {
        Self {
            bus: SqliteEventBus::new(pool.clone()),
            pool,
            policy,
            kinds: RequestKind::ALL.to_vec(),
        }
    }

    /// Accept only `kinds`, e.g. the ones some worker serves.
    pub fn with_kinds(mut self, kinds: &[RequestKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    /// Get a reference to the database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn bus(&self) -> &SqliteEventBus {
        &self.bus
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Admit a request and dispatch its first stage. Returns as soon as the
    /// dispatch event is on the bus.
    #[instrument(skip(self, req), fields(kind = %req.kind, target_project = %req.target_project))]
    pub async fn submit(&self, req: SubmitRequest) -> Result<ProvisioningRequest> {
        validate_project_id(&req.target_project)?;
        if !self.kinds.contains(&req.kind) {
            return Err(OrchestratorError::InvalidParameters(format!(
                "{} requests are not served by any worker",
                req.kind.as_str()
            )));
        }
        validate_parameters(req.kind, &req.parameters)?;

        let now = Utc::now();
        let request = ProvisioningRequest {
            id: Uuid::new_v4().to_string(),
            kind: req.kind,
            target_project: req.target_project,
            parameters: req.parameters,
            state: RequestState::Pending,
            start_attempt: 0,
            end_attempt: 0,
            created_at: now,
            updated_at: now,
            dispatched_at: None,
            retry_at: None,
            last_error: None,
            cancellation: None,
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO provisioning_requests (id, kind, target_project, parameters, state, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&request.id)
        .bind(request.kind)
        .bind(&request.target_project)
        .bind(serde_json::to_string(&request.parameters)?)
        .bind(request.state)
        .bind(now.timestamp())
        .bind(now.timestamp())
        .execute(&mut *tx)
        .await?;
        record_transition(&mut tx, &request.id, None, RequestState::Pending, 0, now).await?;

        let mut plan = Plan::new(&request);
        plan.dispatch(Stage::first(), now);
        if !self.commit_plan(&mut tx, &request, &plan, now).await? {
            return Err(OrchestratorError::InvalidState(format!(
                "request {} changed during submission",
                request.id
            )));
        }

        tx.commit().await?;

        info!(request_id = %request.id, "Accepted provisioning request");
        Ok(plan.next)
    }

    /// Get a single request by ID
    pub async fn get_request(&self, id: &str) -> Result<ProvisioningRequest> {
        let mut conn = self.pool.acquire().await?;
        fetch_request(&mut conn, id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }

    /// List requests with optional filters, newest first
    pub async fn list_requests(&self, filters: RequestFilters) -> Result<Vec<ProvisioningRequest>> {
        let mut query = "SELECT * FROM provisioning_requests WHERE 1=1".to_string();

        if filters.target_project.is_some() {
            query.push_str(" AND target_project = ?");
        }
        if filters.state.is_some() {
            query.push_str(" AND state = ?");
        }
        if filters.kind.is_some() {
            query.push_str(" AND kind = ?");
        }

        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query_as::<_, RequestRow>(&query);

        if let Some(project) = &filters.target_project {
            q = q.bind(project);
        }
        if let Some(state) = &filters.state {
            q = q.bind(state);
        }
        if let Some(kind) = &filters.kind {
            q = q.bind(kind);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// State history of a request, oldest first
    pub async fn transitions(&self, id: &str) -> Result<Vec<Transition>> {
        let rows = sqlx::query_as::<_, TransitionRow>(
            "SELECT from_state, to_state, attempt, occurred_at FROM request_transitions
             WHERE request_id = ? ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|row| row.into()).collect())
    }

    /// Best-effort cancellation. Never aborts a stage already in flight.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &str) -> Result<CancelOutcome> {
        for _ in 0..MAX_CANCEL_ROUNDS {
            let now = Utc::now();
            let mut tx = self.pool.begin().await?;
            let request = fetch_request(&mut tx, id)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;

            let mut plan = Plan::new(&request);
            let outcome = match state_machine::on_cancel(&request) {
                CancelDecision::CancelNow => {
                    plan.settle(RequestState::Cancelled, request.current_attempt());
                    plan.next.cancellation = Some(Cancellation::Effective);
                    CancelResult::Cancelled
                }
                CancelDecision::BeginCancelling => {
                    if request.state != RequestState::Cancelling {
                        plan.move_to(RequestState::Cancelling, request.start_attempt);
                        plan.next.cancellation = Some(Cancellation::Requested);
                    }
                    CancelResult::Cancelling
                }
                CancelDecision::Ineffective => {
                    if request.state != RequestState::Cancelled {
                        plan.next.cancellation = Some(Cancellation::Ineffective);
                    }
                    CancelResult::Ineffective
                }
            };

            let changed = plan.next.state != request.state
                || plan.next.cancellation != request.cancellation;
            if changed && !self.commit_plan(&mut tx, &request, &plan, now).await? {
                debug!(request_id = %id, "Request advanced during cancellation, re-reading");
                continue;
            }
            tx.commit().await?;

            info!(request_id = %id, outcome = ?outcome, state = %plan.next.state, "Cancellation processed");
            return Ok(CancelOutcome {
                request_id: id.to_string(),
                outcome,
                state: plan.next.state,
            });
        }

        Err(OrchestratorError::InvalidState(format!(
            "request {} kept changing during cancellation",
            id
        )))
    }

    pub async fn apply_event(&self, event: &StageEvent) -> Result<ApplyResult> {
        self.apply_event_at(event, Utc::now()).await
    }

    /// Apply a terminal stage event. Duplicate, stale and unknown events are
    /// absorbed and reported, never returned as errors.
    #[instrument(skip(self, event), fields(request_id = %event.request_id, stage = %event.stage, status = %event.status, attempt = event.attempt))]
    pub async fn apply_event_at(&self, event: &StageEvent, now: DateTime<Utc>) -> Result<ApplyResult> {
        let outcome = match event.status {
            StageStatus::Dispatched => return Ok(ApplyResult::Ignored),
            StageStatus::Succeeded => Outcome::Succeeded,
            StageStatus::Failed => Outcome::Failed(event.error()),
        };

        self.apply_outcome(&event.request_id, event.stage, event.status, event.attempt, outcome, now)
            .await
    }

    async fn apply_outcome(
        &self,
        id: &str,
        stage: Stage,
        status: StageStatus,
        attempt: u32,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<ApplyResult> {
        let mut tx = self.pool.begin().await?;

        let Some(request) = fetch_request(&mut tx, id).await? else {
            warn!(request_id = %id, "Dropping stage event for unknown request");
            return Ok(ApplyResult::UnknownRequest);
        };

        let recorded = sqlx::query(
            "INSERT OR IGNORE INTO applied_events (request_id, stage, status, attempt, applied_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(stage)
        .bind(status)
        .bind(attempt as i64)
        .bind(now.timestamp())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if recorded == 0 {
            debug!(request_id = %id, "Discarding duplicate stage event");
            return Ok(ApplyResult::Duplicate);
        }

        let mut plan = Plan::new(&request);
        match state_machine::on_stage_outcome(&request, stage, attempt, outcome, &self.policy) {
            Decision::Stale => {
                debug!(request_id = %id, state = %request.state, "Discarding stale stage event");
                return Ok(ApplyResult::Stale);
            }
            Decision::Advance { next, cancellation } => {
                plan.move_to(RequestState::succeeded(stage), attempt);
                plan.next.cancellation = cancellation;
                plan.dispatch(next, now);
            }
            Decision::Complete { cancellation } => {
                plan.settle(RequestState::succeeded(stage), attempt);
                plan.next.cancellation = cancellation;
            }
            Decision::Retry { error, delay } => {
                plan.settle(RequestState::failed(stage), attempt);
                plan.next.retry_at = Some(now + delay);
                plan.next.last_error = Some(error);
            }
            Decision::Exhausted { error } => {
                plan.settle(RequestState::failed(stage), attempt);
                plan.next.last_error = Some(error);
            }
            Decision::Cancel { error } => {
                plan.settle(RequestState::Cancelled, attempt);
                plan.next.cancellation = Some(Cancellation::Effective);
                plan.next.last_error = Some(error);
            }
        }

        if !self.commit_plan(&mut tx, &request, &plan, now).await? {
            debug!(request_id = %id, "Lost optimistic update, discarding");
            return Ok(ApplyResult::LostRace);
        }
        tx.commit().await?;

        info!(
            request_id = %id,
            from = %request.state,
            to = %plan.next.state,
            "Applied stage event"
        );
        Ok(ApplyResult::Applied(plan.next.state))
    }

    /// Fail every in-flight stage that has not reported within the stage
    /// timeout. The only transition made without a stage event.
    #[instrument(skip(self))]
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = (now - self.policy.stage_timeout()).timestamp();

        let rows = sqlx::query_as::<_, RequestRow>(
            "SELECT * FROM provisioning_requests
             WHERE state IN ('start_dispatched', 'end_dispatched', 'cancelling')
               AND dispatched_at IS NOT NULL AND dispatched_at <= ?",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut expired = 0;
        for request in rows.into_iter().map(ProvisioningRequest::from) {
            let Some(stage) = request.state.stage() else {
                continue;
            };
            let attempt = request.attempt(stage);
            let error = StageError::new(
                ErrorCode::Timeout,
                format!(
                    "{} stage attempt {} did not report within {}s",
                    stage, attempt, self.policy.stage_timeout_secs
                ),
            );

            warn!(request_id = %request.id, stage = %stage, attempt, "Stage timed out");
            let result = self
                .apply_outcome(
                    &request.id,
                    stage,
                    StageStatus::Failed,
                    attempt,
                    Outcome::Failed(error),
                    now,
                )
                .await?;
            if matches!(result, ApplyResult::Applied(_)) {
                expired += 1;
            }
        }

        Ok(expired)
    }

    /// Re-dispatch failed stages whose backoff has elapsed.
    #[instrument(skip(self))]
    pub async fn dispatch_due_retries(&self, now: DateTime<Utc>) -> Result<usize> {
        let rows = sqlx::query_as::<_, RequestRow>(
            "SELECT * FROM provisioning_requests
             WHERE state IN ('start_failed', 'end_failed')
               AND retry_at IS NOT NULL AND retry_at <= ?",
        )
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        let mut dispatched = 0;
        for request in rows.into_iter().map(ProvisioningRequest::from) {
            let Some(stage) = request.state.stage() else {
                continue;
            };

            let mut tx = self.pool.begin().await?;
            let mut plan = Plan::new(&request);
            plan.dispatch(stage, now);

            if self.commit_plan(&mut tx, &request, &plan, now).await? {
                tx.commit().await?;
                info!(
                    request_id = %request.id,
                    stage = %stage,
                    attempt = plan.next.attempt(stage),
                    "Retrying stage"
                );
                dispatched += 1;
            }
        }

        Ok(dispatched)
    }

    /// One scheduler pass: expire overdue stages, then dispatch due retries.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(usize, usize)> {
        let expired = self.expire_overdue(now).await?;
        let retried = self.dispatch_due_retries(now).await?;
        Ok((expired, retried))
    }

    /// Drop bookkeeping nobody needs any more: bus messages acknowledged by
    /// every subscriber, and dedup rows of requests that settled before
    /// `cutoff`.
    #[instrument(skip(self))]
    pub async fn prune_history(&self, cutoff: DateTime<Utc>) -> Result<PruneStats> {
        let messages = self.bus.prune_acked(cutoff).await?;

        let applied_events = sqlx::query(
            r#"
            DELETE FROM applied_events
            WHERE request_id IN (
                SELECT id FROM provisioning_requests
                WHERE updated_at < ?
                  AND (state IN (?, ?) OR (state IN (?, ?) AND retry_at IS NULL))
            )
            "#,
        )
        .bind(cutoff.timestamp())
        .bind(RequestState::EndSucceeded)
        .bind(RequestState::Cancelled)
        .bind(RequestState::StartFailed)
        .bind(RequestState::EndFailed)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if messages > 0 || applied_events > 0 {
            info!(messages, applied_events, "Pruned history");
        }

        Ok(PruneStats {
            messages,
            applied_events,
        })
    }

    /// Terminally fail every live request of a project whose registration was
    /// revoked.
    #[instrument(skip(self, reason))]
    pub async fn fail_project_requests(&self, project: &str, reason: &str) -> Result<usize> {
        let requests = self
            .list_requests(RequestFilters {
                target_project: Some(project.to_string()),
                ..Default::default()
            })
            .await?;

        let mut failed = 0;
        for request in requests.into_iter().filter(|r| !r.is_terminal()) {
            let now = Utc::now();
            let mut tx = self.pool.begin().await?;
            let mut plan = Plan::new(&request);

            let (state, cancellation) = match request.state {
                RequestState::Cancelling => (RequestState::Cancelled, Some(Cancellation::Effective)),
                RequestState::EndDispatched | RequestState::EndFailed => {
                    (RequestState::EndFailed, request.cancellation)
                }
                _ => (RequestState::StartFailed, request.cancellation),
            };
            plan.settle(state, request.current_attempt());
            plan.next.cancellation = cancellation;
            plan.next.last_error = Some(StageError::new(ErrorCode::NotRegistered, reason));

            if self.commit_plan(&mut tx, &request, &plan, now).await? {
                tx.commit().await?;
                failed += 1;
            } else {
                warn!(request_id = %request.id, "Request advanced while failing project requests");
            }
        }

        info!(project, failed, "Failed in-flight requests of revoked project");
        Ok(failed)
    }

    /// Write `plan` if the stored row still matches `before`, then record the
    /// transitions and publish any dispatch. Returns false when a concurrent
    /// handler got there first.
    async fn commit_plan(
        &self,
        conn: &mut SqliteConnection,
        before: &ProvisioningRequest,
        plan: &Plan,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let next = &plan.next;

        let updated = sqlx::query(
            "UPDATE provisioning_requests
             SET state = ?, start_attempt = ?, end_attempt = ?, dispatched_at = ?, retry_at = ?,
                 last_error_code = ?, last_error_message = ?, cancellation = ?, updated_at = ?
             WHERE id = ? AND state = ? AND start_attempt = ? AND end_attempt = ?",
        )
        .bind(next.state)
        .bind(next.start_attempt as i64)
        .bind(next.end_attempt as i64)
        .bind(next.dispatched_at.map(|dt| dt.timestamp()))
        .bind(next.retry_at.map(|dt| dt.timestamp()))
        .bind(next.last_error.as_ref().map(|e| e.code))
        .bind(next.last_error.as_ref().map(|e| e.message.clone()))
        .bind(next.cancellation)
        .bind(now.timestamp())
        .bind(&before.id)
        .bind(before.state)
        .bind(before.start_attempt as i64)
        .bind(before.end_attempt as i64)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(false);
        }

        for (from, to, attempt) in &plan.transitions {
            record_transition(conn, &next.id, *from, *to, *attempt, now).await?;
        }

        if let Some(stage) = plan.dispatch {
            let context = DispatchContext {
                kind: next.kind,
                target_project: next.target_project.clone(),
                parameters: next.parameters.clone(),
            };
            let event = StageEvent::dispatched(&next.id, stage, next.attempt(stage), &context)?;
            SqliteEventBus::publish_in_tx(conn, &stage::topic(next.kind, stage), &event).await?;
        }

        Ok(true)
    }
}

async fn fetch_request(conn: &mut SqliteConnection, id: &str) -> Result<Option<ProvisioningRequest>> {
    let row = sqlx::query_as::<_, RequestRow>("SELECT * FROM provisioning_requests WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.map(|row| row.into()))
}

async fn record_transition(
    conn: &mut SqliteConnection,
    request_id: &str,
    from: Option<RequestState>,
    to: RequestState,
    attempt: u32,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO request_transitions (request_id, from_state, to_state, attempt, occurred_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(request_id)
    .bind(from)
    .bind(to)
    .bind(attempt as i64)
    .bind(now.timestamp())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct RequestRow {
    id: String,
    kind: RequestKind,
    target_project: String,
    parameters: String,
    state: RequestState,
    start_attempt: i64,
    end_attempt: i64,
    created_at: i64,
    updated_at: i64,
    dispatched_at: Option<i64>,
    retry_at: Option<i64>,
    last_error_code: Option<ErrorCode>,
    last_error_message: Option<String>,
    cancellation: Option<Cancellation>,
}

#[derive(sqlx::FromRow)]
struct TransitionRow {
    from_state: Option<RequestState>,
    to_state: RequestState,
    attempt: i64,
    occurred_at: i64,
}

fn timestamp(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

impl From<RequestRow> for ProvisioningRequest {
    fn from(row: RequestRow) -> Self {
        let last_error = row.last_error_code.map(|code| StageError {
            code,
            message: row.last_error_message.unwrap_or_default(),
        });

        Self {
            id: row.id,
            kind: row.kind,
            target_project: row.target_project,
            parameters: serde_json::from_str(&row.parameters).unwrap_or_default(),
            state: row.state,
            start_attempt: row.start_attempt as u32,
            end_attempt: row.end_attempt as u32,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
            dispatched_at: row.dispatched_at.map(timestamp),
            retry_at: row.retry_at.map(timestamp),
            last_error,
            cancellation: row.cancellation,
        }
    }
}

impl From<TransitionRow> for Transition {
    fn from(row: TransitionRow) -> Self {
        Self {
            from_state: row.from_state,
            to_state: row.to_state,
            attempt: row.attempt as u32,
            occurred_at: timestamp(row.occurred_at),
        }
    }
}
