//! Transition table of the provisioning workflow.
//!
//! Pure functions only: the engine loads a request, asks this module what to
//! do, and applies the answer with an optimistic update.

use crate::error::ErrorCode;
use crate::policy::RetryPolicy;
use crate::request::{Cancellation, ProvisioningRequest, RequestState};
use crate::stage::{Stage, StageError};
use chrono::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded,
    Failed(StageError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// The event is not for the stage attempt currently in flight.
    Stale,
    /// Stage succeeded; the next stage is dispatched right away.
    Advance {
        next: Stage,
        cancellation: Option<Cancellation>,
    },
    /// The last stage succeeded.
    Complete { cancellation: Option<Cancellation> },
    /// Stage failed with attempts left.
    Retry { error: StageError, delay: Duration },
    /// Stage failed on its last attempt.
    Exhausted { error: StageError },
    /// Stage failed while a cancellation was pending.
    Cancel { error: StageError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelDecision {
    /// Nothing is in flight; move straight to `cancelled`.
    CancelNow,
    /// Wait for the in-flight first stage to report.
    BeginCancelling,
    /// Past the point of no return, or already terminal.
    Ineffective,
}

/// Decide what a terminal stage outcome does to `request`.
pub fn on_stage_outcome(
    request: &ProvisioningRequest,
    stage: Stage,
    attempt: u32,
    outcome: Outcome,
    policy: &RetryPolicy,
) -> Decision {
    let cancelling = request.state == RequestState::Cancelling;
    let in_flight = request.state == RequestState::dispatched(stage)
        || (cancelling && stage == Stage::first());

    if !in_flight || request.attempt(stage) != attempt {
        return Decision::Stale;
    }

    match outcome {
        Outcome::Succeeded => {
            let cancellation = if cancelling {
                Some(Cancellation::Ineffective)
            } else {
                request.cancellation
            };
            match stage.next() {
                Some(next) => Decision::Advance { next, cancellation },
                None => Decision::Complete { cancellation },
            }
        }
        Outcome::Failed(error) if cancelling => Decision::Cancel { error },
        Outcome::Failed(error) if policy.can_retry(attempt) => Decision::Retry {
            error,
            delay: policy.backoff(attempt),
        },
        Outcome::Failed(error) => Decision::Exhausted {
            error: StageError::new(
                ErrorCode::StageFailed,
                format!(
                    "{} stage failed after {} attempts: {}",
                    stage, attempt, error.message
                ),
            ),
        },
    }
}

/// Decide what a cancellation does to `request`.
pub fn on_cancel(request: &ProvisioningRequest) -> CancelDecision {
    if request.is_terminal() {
        return CancelDecision::Ineffective;
    }

    match request.state {
        RequestState::Pending => CancelDecision::CancelNow,
        // A retry of the first stage is scheduled but not dispatched yet.
        RequestState::StartFailed => CancelDecision::CancelNow,
        RequestState::StartDispatched | RequestState::Cancelling => CancelDecision::BeginCancelling,
        RequestState::StartSucceeded
        | RequestState::EndDispatched
        | RequestState::EndFailed
        | RequestState::EndSucceeded
        | RequestState::Cancelled => CancelDecision::Ineffective,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestKind;
    use chrono::Utc;

    fn request(state: RequestState, start_attempt: u32, end_attempt: u32) -> ProvisioningRequest {
        let now = Utc::now();
        ProvisioningRequest {
            id: "req-1".to_string(),
            kind: RequestKind::Image,
            target_project: "p1".to_string(),
            parameters: serde_json::json!({}),
            state,
            start_attempt,
            end_attempt,
            created_at: now,
            updated_at: now,
            dispatched_at: Some(now),
            retry_at: None,
            last_error: None,
            cancellation: None,
        }
    }

    fn failure() -> Outcome {
        Outcome::Failed(StageError::new(ErrorCode::StageFailed, "boom"))
    }

    #[test]
    fn test_start_success_advances_to_end() {
        let req = request(RequestState::StartDispatched, 1, 0);
        let decision = on_stage_outcome(
            &req,
            Stage::Start,
            1,
            Outcome::Succeeded,
            &RetryPolicy::default(),
        );

        assert_eq!(
            decision,
            Decision::Advance {
                next: Stage::End,
                cancellation: None
            }
        );
    }

    #[test]
    fn test_end_success_completes() {
        let req = request(RequestState::EndDispatched, 1, 2);
        let decision =
            on_stage_outcome(&req, Stage::End, 2, Outcome::Succeeded, &RetryPolicy::default());

        assert_eq!(decision, Decision::Complete { cancellation: None });
    }

    #[test]
    fn test_event_for_other_stage_is_stale() {
        let req = request(RequestState::StartDispatched, 1, 0);
        let decision =
            on_stage_outcome(&req, Stage::End, 1, Outcome::Succeeded, &RetryPolicy::default());

        assert_eq!(decision, Decision::Stale);
    }

    #[test]
    fn test_event_for_old_attempt_is_stale() {
        let req = request(RequestState::StartDispatched, 2, 0);
        let decision = on_stage_outcome(&req, Stage::Start, 1, failure(), &RetryPolicy::default());

        assert_eq!(decision, Decision::Stale);
    }

    #[test]
    fn test_failure_retries_with_backoff() {
        let req = request(RequestState::StartDispatched, 2, 0);
        let decision = on_stage_outcome(&req, Stage::Start, 2, failure(), &RetryPolicy::default());

        match decision {
            Decision::Retry { delay, .. } => assert_eq!(delay, Duration::seconds(60)),
            other => panic!("Expected retry, got {:?}", other),
        }
    }

    #[test]
    fn test_failure_on_last_attempt_is_exhausted() {
        let req = request(RequestState::EndDispatched, 1, 3);
        let decision = on_stage_outcome(&req, Stage::End, 3, failure(), &RetryPolicy::default());

        match decision {
            Decision::Exhausted { error } => {
                assert_eq!(error.code, ErrorCode::StageFailed);
                assert!(error.message.contains("boom"));
            }
            other => panic!("Expected exhaustion, got {:?}", other),
        }
    }

    #[test]
    fn test_cancelling_failure_cancels_without_retry() {
        let req = request(RequestState::Cancelling, 1, 0);
        let decision = on_stage_outcome(&req, Stage::Start, 1, failure(), &RetryPolicy::default());

        assert!(matches!(decision, Decision::Cancel { .. }));
    }

    #[test]
    fn test_cancelling_success_runs_to_completion() {
        let req = request(RequestState::Cancelling, 1, 0);
        let decision = on_stage_outcome(
            &req,
            Stage::Start,
            1,
            Outcome::Succeeded,
            &RetryPolicy::default(),
        );

        assert_eq!(
            decision,
            Decision::Advance {
                next: Stage::End,
                cancellation: Some(Cancellation::Ineffective)
            }
        );
    }

    #[test]
    fn test_cancel_decisions() {
        assert_eq!(
            on_cancel(&request(RequestState::Pending, 0, 0)),
            CancelDecision::CancelNow
        );
        assert_eq!(
            on_cancel(&request(RequestState::StartDispatched, 1, 0)),
            CancelDecision::BeginCancelling
        );
        assert_eq!(
            on_cancel(&request(RequestState::EndDispatched, 1, 1)),
            CancelDecision::Ineffective
        );
        assert_eq!(
            on_cancel(&request(RequestState::EndSucceeded, 1, 1)),
            CancelDecision::Ineffective
        );

        let mut retrying = request(RequestState::StartFailed, 1, 0);
        retrying.retry_at = Some(Utc::now());
        assert_eq!(on_cancel(&retrying), CancelDecision::CancelNow);

        let mut end_retrying = request(RequestState::EndFailed, 1, 1);
        end_retrying.retry_at = Some(Utc::now());
        assert_eq!(on_cancel(&end_retrying), CancelDecision::Ineffective);
    }
}
