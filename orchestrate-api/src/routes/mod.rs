pub mod health;
pub mod projects;
pub mod requests;

use crate::{api_docs::ApiDoc, auth::auth_middleware, state::AppState};
use axum::{middleware, routing::get, Json, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;

pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::permissive();

    Router::new()
        .merge(health::routes()) // Health and docs don't need auth
        .route("/api-docs/openapi.json", get(openapi_spec))
        .merge(
            requests::routes()
                .merge(projects::routes())
                .layer(middleware::from_fn_with_state(state.clone(), auth_middleware)),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn openapi_spec() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
