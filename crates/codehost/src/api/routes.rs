//! Admission API route definitions.

use axum::{
    Router,
    extract::{Request, State},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::error::ApiError;
use super::handlers;
use super::state::AppState;

/// Header carrying the shared operator key.
pub const OPERATOR_KEY_HEADER: &str = "x-operator-key";

/// Create the admission router.
pub fn create_router(state: AppState) -> Router {
    // Operator-only routes. Everything except /health presents the key.
    let protected = Router::new()
        .route("/start", post(handlers::start))
        .route("/report", get(handlers::report))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_operator_key,
        ))
        .with_state(state.clone());

    let public = Router::new()
        .route("/health", get(handlers::health))
        .with_state(state);

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// The admission surface is for the operator front-end only, never exposed
/// through the data plane.
async fn require_operator_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(OPERATOR_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    if presented != Some(state.settings.operator_key.as_str()) {
        return ApiError::forbidden("operator key required").into_response();
    }

    next.run(request).await
}
