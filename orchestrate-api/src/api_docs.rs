use crate::routes::projects::{DeregisterResponse, KeyResponse, RegisterProjectRequest};
use orchestrate_engine::{
    CancelOutcome, CancelResult, Cancellation, ErrorCode, RequestKind, RequestState,
    RequestStatus, Stage, StageError, SubmitRequest, Transition,
};
use orchestrate_identity::{Registration, RoleBinding, TenantTrust, TrustStatus};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        crate::routes::health::health_check,
        crate::routes::health::readiness_check,
        crate::routes::requests::submit_request,
        crate::routes::requests::list_requests,
        crate::routes::requests::get_status,
        crate::routes::requests::list_transitions,
        crate::routes::requests::cancel_request,
        crate::routes::projects::register_project,
        crate::routes::projects::get_project,
        crate::routes::projects::deregister_project,
        crate::routes::projects::rotate_key,
    ),
    components(
        schemas(
            SubmitRequest,
            RequestStatus,
            RequestKind,
            RequestState,
            Stage,
            StageError,
            ErrorCode,
            Cancellation,
            CancelOutcome,
            CancelResult,
            Transition,
            RegisterProjectRequest,
            Registration,
            TenantTrust,
            TrustStatus,
            RoleBinding,
            KeyResponse,
            DeregisterResponse
        )
    ),
    tags(
        (name = "orchestrate-api", description = "Workstation provisioning control plane")
    )
)]
pub struct ApiDoc;
