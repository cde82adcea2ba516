use crate::{
    auth::{authorize_project, check_request_access},
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use orchestrate_engine::{CancelOutcome, RequestFilters, RequestStatus, SubmitRequest, Transition};
use orchestrate_identity::{Action, Principal};
use tracing::info;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/requests", get(list_requests).post(submit_request))
        .route("/api/v1/requests/{id}", get(get_status))
        .route("/api/v1/requests/{id}/transitions", get(list_transitions))
        .route("/api/v1/requests/{id}/cancel", post(cancel_request))
}

#[utoipa::path(
    post,
    path = "/api/v1/requests",
    tag = "requests",
    request_body = SubmitRequest,
    responses(
        (status = 202, description = "Request accepted, first stage dispatched", body = RequestStatus),
        (status = 400, description = "Invalid parameters"),
        (status = 401, description = "Missing or unknown API key"),
        (status = 403, description = "Caller may not submit to the target project"),
        (status = 412, description = "Target project is not registered")
    )
)]
pub async fn submit_request(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<RequestStatus>)> {
    let Json(req) = payload?;
    authorize_project(&state, &principal, &req.target_project, Action::Submit).await?;

    let request = state.engine.submit(req).await?;
    info!(request_id = %request.id, caller = %principal.member(), "Submitted request");

    Ok((StatusCode::ACCEPTED, Json(request.status())))
}

#[utoipa::path(
    get,
    path = "/api/v1/requests",
    tag = "requests",
    params(
        ("target_project" = Option<String>, Query, description = "Only requests for this project"),
        ("state" = Option<String>, Query, description = "Only requests in this state"),
        ("kind" = Option<String>, Query, description = "Only requests of this kind")
    ),
    responses((status = 200, description = "Matching requests, newest first", body = Vec<RequestStatus>))
)]
pub async fn list_requests(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Query(mut filters): Query<RequestFilters>,
) -> ApiResult<Json<Vec<RequestStatus>>> {
    // Tenants only ever see their own project
    if let Some(own) = principal.project() {
        if filters.target_project.as_deref().is_some_and(|p| p != own) {
            return Err(ApiError::Forbidden(format!(
                "Access denied: cannot list requests of another project than {}",
                own
            )));
        }
        filters.target_project = Some(own.to_string());
    }

    let requests = state.engine.list_requests(filters).await?;

    Ok(Json(requests.iter().map(|r| r.status()).collect()))
}

#[utoipa::path(
    get,
    path = "/api/v1/requests/{id}",
    tag = "requests",
    params(("id" = String, Path, description = "Request id")),
    responses(
        (status = 200, description = "Current request status", body = RequestStatus),
        (status = 404, description = "Unknown request")
    )
)]
pub async fn get_status(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Json<RequestStatus>> {
    let request = state.engine.get_request(&id).await?;
    check_request_access(&state, &principal, &request, Action::ReadStatus).await?;

    Ok(Json(request.status()))
}

#[utoipa::path(
    get,
    path = "/api/v1/requests/{id}/transitions",
    tag = "requests",
    params(("id" = String, Path, description = "Request id")),
    responses((status = 200, description = "State history, oldest first", body = Vec<Transition>))
)]
pub async fn list_transitions(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Transition>>> {
    let request = state.engine.get_request(&id).await?;
    check_request_access(&state, &principal, &request, Action::ReadStatus).await?;

    Ok(Json(state.engine.transitions(&id).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/requests/{id}/cancel",
    tag = "requests",
    params(("id" = String, Path, description = "Request id")),
    responses(
        (status = 200, description = "Cancellation outcome", body = CancelOutcome),
        (status = 404, description = "Unknown request")
    )
)]
pub async fn cancel_request(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Json<CancelOutcome>> {
    let request = state.engine.get_request(&id).await?;
    check_request_access(&state, &principal, &request, Action::Cancel).await?;

    Ok(Json(state.engine.cancel(&id).await?))
}
