//! HTTP control surface for the deploy service.

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{
    deploy::{DeployContext, DeployResult},
    service::{ServiceError, ServiceStatus},
    state::StateStore,
};

#[derive(Debug, Clone)]
pub struct AppState {
    ctx: Arc<DeployContext>,
    state_store: StateStore,
}

impl AppState {
    pub fn new(ctx: DeployContext, state_store: StateStore) -> Self {
        Self {
            ctx: Arc::new(ctx),
            state_store,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/deploy/status", get(deploy_status))
        .route("/deploy", post(deploy))
        .route("/restart", post(restart))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .fallback(not_found)
        .with_state(state)
}

pub async fn serve(listen: SocketAddr, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("binding control surface to {listen}"))?;
    tracing::info!(%listen, "deploy service listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("serving control surface")?;
    tracing::info!("deploy service stopped");
    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "deploy-service" }))
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" }))).into_response()
}

#[derive(Debug, Serialize)]
struct ServiceReport {
    name: String,
    active: bool,
    state: String,
    substate: String,
    pid: String,
    binary_exists: bool,
    binary_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let binary_path = state.ctx.installer().binary_path();
    let service = state.ctx.service();
    let (status, error) = match service.status().await {
        Ok(status) => (status, None),
        Err(error) => {
            tracing::warn!(%error, "service status query failed");
            let status = ServiceStatus {
                service: service.unit().to_string(),
                active: false,
                state: "unknown".to_string(),
                substate: "unknown".to_string(),
                pid: "0".to_string(),
            };
            (status, Some(error.to_string()))
        }
    };
    let report = ServiceReport {
        name: status.service,
        active: status.active,
        state: status.state,
        substate: status.substate,
        pid: status.pid,
        binary_exists: binary_path.is_file(),
        binary_path: binary_path.display().to_string(),
        error,
    };

    let supervisor = match state.state_store.load() {
        Ok(history) => {
            let uptime = history.current_uptime_seconds(Utc::now());
            let mut value = json!(history);
            value["current_uptime_seconds"] = json!(uptime);
            Some(value)
        }
        Err(error) => {
            tracing::warn!(%error, "could not read supervisor state");
            None
        }
    };
    let backups = state.ctx.installer().list_backups().unwrap_or_else(|error| {
        tracing::warn!(%error, "could not list backups");
        Vec::new()
    });

    let message = if report.active {
        "Service is running"
    } else {
        "Service is not running"
    };
    Json(json!({
        "success": true,
        "message": message,
        "service": report,
        "supervisor": supervisor,
        "backups": backups,
    }))
}

async fn deploy_status(State(state): State<AppState>) -> Response {
    match state.ctx.deploy_status() {
        Ok(status) => {
            let message = if status.in_progress {
                "Deployment in progress"
            } else {
                "No deployment in progress"
            };
            let mut body = json!({
                "success": true,
                "in_progress": status.in_progress,
                "message": message,
            });
            if let Some(record) = status.record.filter(|_| status.in_progress) {
                body["holder_pid"] = json!(record.holder_pid);
                body["started_at"] = json!(record.started_at);
                body["subject"] = json!(record.subject);
            }
            Json(body).into_response()
        }
        Err(error) => failure(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
    }
}

#[derive(Debug, Default, Deserialize)]
struct DeployRequest {
    source: Option<String>,
    artifact_url: Option<String>,
    path: Option<String>,
}

impl DeployRequest {
    fn source(self) -> Option<String> {
        self.source
            .or(self.artifact_url)
            .or(self.path)
            .filter(|source| !source.trim().is_empty())
    }
}

#[derive(Debug, Serialize)]
struct DeployResponse {
    #[serde(flatten)]
    result: DeployResult,
    message: String,
}

async fn deploy(State(state): State<AppState>, body: Bytes) -> Response {
    let request: DeployRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(error) => {
            return failure(StatusCode::BAD_REQUEST, format!("Invalid JSON body: {error}"));
        }
    };
    let Some(source) = request.source() else {
        return failure(
            StatusCode::BAD_REQUEST,
            "Missing 'source' (artifact URL or local path)",
        );
    };

    let result = state.ctx.deploy(source.trim()).await;
    let code = if result.success {
        StatusCode::OK
    } else if result.contended {
        StatusCode::CONFLICT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let message = result.message();
    (code, Json(DeployResponse { result, message })).into_response()
}

async fn restart(State(state): State<AppState>) -> Response {
    let service = state.ctx.service();
    match service.restart().await {
        Ok(message) => {
            let status = service.status().await.ok();
            Json(json!({ "success": true, "message": message, "status": status })).into_response()
        }
        Err(error) => command_failure(&error),
    }
}

async fn start(State(state): State<AppState>) -> Response {
    let service = state.ctx.service();
    match service.start().await {
        Ok(message) => {
            let status = service.status().await.ok();
            Json(json!({ "success": true, "message": message, "status": status })).into_response()
        }
        Err(error) => command_failure(&error),
    }
}

async fn stop(State(state): State<AppState>) -> Response {
    match state.ctx.service().stop().await {
        Ok(message) => Json(json!({ "success": true, "message": message })).into_response(),
        Err(error) => command_failure(&error),
    }
}

fn command_failure(error: &ServiceError) -> Response {
    let step = error.step().as_str();
    tracing::warn!(step, %error, "service command failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "message": error.to_string(), "step": step })),
    )
        .into_response()
}

fn failure(code: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    tracing::warn!(status = code.as_u16(), %message, "request failed");
    (code, Json(json!({ "success": false, "message": message }))).into_response()
}
