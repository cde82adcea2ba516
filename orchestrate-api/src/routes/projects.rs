use crate::{
    auth::require_operator,
    error::{ApiError, ApiResult},
    state::AppState,
};
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use orchestrate_identity::{Principal, Registration, TenantTrust};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/projects", post(register_project))
        .route(
            "/api/v1/projects/{id}",
            get(get_project).delete(deregister_project),
        )
        .route("/api/v1/projects/{id}/keys", post(rotate_key))
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RegisterProjectRequest {
    pub project_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct KeyResponse {
    pub project_id: String,
    pub fingerprint: String,
    /// Shown once.
    pub api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeregisterResponse {
    pub trust: TenantTrust,
    /// Non-terminal requests failed by the deregistration.
    pub failed_requests: usize,
}

#[utoipa::path(
    post,
    path = "/api/v1/projects",
    tag = "projects",
    request_body = RegisterProjectRequest,
    responses(
        (status = 201, description = "Project registered, key returned once", body = Registration),
        (status = 200, description = "Project was already registered", body = Registration),
        (status = 403, description = "Operator key required")
    )
)]
pub async fn register_project(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    payload: Result<Json<RegisterProjectRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Registration>)> {
    require_operator(&principal)?;
    let Json(req) = payload?;

    let registration = state.trust.register(&req.project_id).await?;
    let status = if registration.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    Ok((status, Json(registration)))
}

#[utoipa::path(
    get,
    path = "/api/v1/projects/{id}",
    tag = "projects",
    params(("id" = String, Path, description = "Tenant project id")),
    responses(
        (status = 200, description = "Trust record", body = TenantTrust),
        (status = 404, description = "Project was never registered")
    )
)]
pub async fn get_project(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Json<TenantTrust>> {
    if principal.project().is_some_and(|own| own != id) {
        return Err(ApiError::Forbidden(format!(
            "Access denied: project {}",
            id
        )));
    }

    let trust = state
        .trust
        .get_trust(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Project not registered: {}", id)))?;

    Ok(Json(trust))
}

#[utoipa::path(
    delete,
    path = "/api/v1/projects/{id}",
    tag = "projects",
    params(("id" = String, Path, description = "Tenant project id")),
    responses(
        (status = 200, description = "Registration revoked", body = DeregisterResponse),
        (status = 412, description = "Project is not registered")
    )
)]
pub async fn deregister_project(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeregisterResponse>> {
    require_operator(&principal)?;

    let trust = state.trust.revoke(&id).await?;
    let failed_requests = state
        .engine
        .fail_project_requests(&id, &format!("project {} was deregistered", id))
        .await?;

    info!(project_id = %id, failed_requests, "Deregistered project");
    Ok(Json(DeregisterResponse {
        trust,
        failed_requests,
    }))
}

#[utoipa::path(
    post,
    path = "/api/v1/projects/{id}/keys",
    tag = "projects",
    params(("id" = String, Path, description = "Tenant project id")),
    responses(
        (status = 201, description = "New key; the previous key stops working", body = KeyResponse),
        (status = 412, description = "Project is not registered")
    )
)]
pub async fn rotate_key(
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<KeyResponse>)> {
    require_operator(&principal)?;

    let key = state.trust.rotate_key(&id).await?;

    Ok((
        StatusCode::CREATED,
        Json(KeyResponse {
            project_id: id,
            fingerprint: key.fingerprint.clone(),
            api_key: key.into_secret(),
        }),
    ))
}
