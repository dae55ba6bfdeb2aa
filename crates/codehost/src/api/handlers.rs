//! Admission surface handlers.

use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{error, info, warn};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

/// Health check endpoint.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Request to admit a user.
#[derive(Debug, Clone, Deserialize)]
pub struct StartRequest {
    /// Opaque caller identity.
    pub user_id: String,
}

/// Response from admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartResponse {
    /// Proxy URL embedding the caller's token.
    pub url: String,
}

/// Admit a user: reuse their live session or start a fresh container.
pub async fn start(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> ApiResult<Json<StartResponse>> {
    if request.user_id.is_empty() {
        return Err(ApiError::bad_request("user_id must not be empty"));
    }

    if let Some(session) = state.store.get_by_user(&request.user_id).await? {
        info!(user = %request.user_id, container = %session.container_id, "reusing live session");
        return Ok(Json(StartResponse {
            url: session_url(&state, &request.user_id)?,
        }));
    }

    let Some(port) = state.ports.acquire().await? else {
        warn!(user = %request.user_id, "admission refused, port pool exhausted");
        return Err(ApiError::capacity_exhausted("no free port available"));
    };

    let container_id = match state.runtime.start_session_container(port).await {
        Ok(container_id) => container_id,
        Err(err) => {
            // A failed start must not keep holding the port.
            if let Err(release_err) = state.ports.release(port).await {
                error!(port, error = ?release_err, "releasing port after failed start");
            }
            return Err(ApiError::bad_gateway(format!(
                "starting session container: {err}"
            )));
        }
    };

    if let Err(err) = state
        .store
        .create_session(
            &request.user_id,
            &container_id,
            port,
            state.settings.session_ttl,
        )
        .await
    {
        // Unwind the container and the port; a failed admission must leave
        // nothing behind.
        if let Err(stop_err) = state
            .runtime
            .stop_container(&container_id, std::time::Duration::from_secs(10))
            .await
        {
            error!(container = %container_id, error = %stop_err, "stopping container after failed session write");
        }
        if let Err(release_err) = state.ports.release(port).await {
            error!(port, error = ?release_err, "releasing port after failed session write");
        }
        return Err(err.into());
    }

    info!(user = %request.user_id, container = %container_id, port, "session started");
    Ok(Json(StartResponse {
        url: session_url(&state, &request.user_id)?,
    }))
}

fn session_url(state: &AppState, user_id: &str) -> Result<String, ApiError> {
    let token = state.tokens.issue(user_id)?;
    Ok(format!(
        "{}:{}?token={}",
        state.settings.public_host, state.settings.proxy_port, token
    ))
}

/// One live session in the fleet report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEntry {
    pub user_id: String,
    pub container_id: String,
    pub port: u16,
}

/// Fleet report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportResponse {
    pub count: usize,
    pub containers: Vec<ReportEntry>,
}

/// Report all live sessions.
pub async fn report(State(state): State<AppState>) -> ApiResult<Json<ReportResponse>> {
    let sessions = state.store.list_sessions().await?;
    let containers: Vec<ReportEntry> = sessions
        .into_iter()
        .map(|session| ReportEntry {
            port: session.port(),
            user_id: session.user_id,
            container_id: session.container_id,
        })
        .collect();

    Ok(Json(ReportResponse {
        count: containers.len(),
        containers,
    }))
}
