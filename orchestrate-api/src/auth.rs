use crate::{error::ApiError, state::AppState};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use orchestrate_engine::ProvisioningRequest;
use orchestrate_identity::{Action, Principal};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Auth middleware: resolves the `x-api-key` header to a [`Principal`] and
/// stores it in the request extensions.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let api_key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|key| !key.is_empty())
        .ok_or_else(|| ApiError::Unauthenticated("Missing API key".to_string()))?;

    let principal = state.trust.authenticate(api_key).await?;

    req.extensions_mut().insert(principal);

    Ok(next.run(req).await)
}

pub fn require_operator(principal: &Principal) -> Result<(), ApiError> {
    match principal {
        Principal::Operator => Ok(()),
        Principal::ServiceAccount { email, .. } => Err(ApiError::Forbidden(format!(
            "Operation requires the operator key, not {}",
            email
        ))),
    }
}

/// Check that `project` is registered and that `principal` may perform
/// `action` in it.
///
/// Returns:
/// - ApiError::NotRegistered if the project has no active registration
/// - ApiError::Forbidden if the caller's bindings do not grant the action
pub async fn authorize_project(
    state: &AppState,
    principal: &Principal,
    project: &str,
    action: Action,
) -> Result<(), ApiError> {
    state.trust.require_active(project).await?;

    let decision = state.trust.authorize(principal, project, action).await?;
    if !decision.is_allowed() {
        return Err(ApiError::Forbidden(format!(
            "Access denied: {:?} in project {}",
            action, project
        )));
    }

    Ok(())
}

/// Check that the caller may act on an existing request.
///
/// Unlike submission, a request whose project has since been revoked is
/// still visible to the operator.
pub async fn check_request_access(
    state: &AppState,
    principal: &Principal,
    request: &ProvisioningRequest,
    action: Action,
) -> Result<(), ApiError> {
    let decision = state
        .trust
        .authorize(principal, &request.target_project, action)
        .await?;

    if !decision.is_allowed() {
        return Err(ApiError::Forbidden(format!(
            "Access denied: request {} belongs to project {}",
            request.id, request.target_project
        )));
    }

    Ok(())
}
