//! Control HTTP API.
//!
//! JSON in, JSON out, CORS open. Every handler locks the shared host for
//! the shortest span it can; method calls release the lock before the logic
//! runs.

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use miniapp_push::{CallMethodPayload, MethodCallResponsePayload};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::error::HostError;
use crate::host::{SharedHost, call_active_method, hide_active, show_active};

/// Body of `POST /api/launch-app`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LaunchRequest {
    app_name: String,
}

/// Body of `POST /api/terminate-app`. The body itself is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TerminateRequest {
    #[serde(default)]
    app_name: Option<String>,
}

/// Error body shape shared by every failing control route.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<HostError> for ApiError {
    fn from(err: HostError) -> Self {
        let status = match err {
            HostError::InstanceNotFound => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "success": false, "error": self.message })),
        )
            .into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

/// Routes of the control API.
pub fn router(host: SharedHost) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/apps", get(list_apps))
        .route("/api/launch-app", post(launch_app))
        .route("/api/show-app", post(show_app))
        .route("/api/hide-app", post(hide_app))
        .route("/api/refresh-app", post(refresh_app))
        .route("/api/current-app", get(current_app))
        .route("/api/terminate-app", post(terminate_app))
        .route("/api/call-method", post(call_method))
        .layer(CorsLayer::permissive())
        .with_state(host)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn list_apps(State(host): State<SharedHost>) -> Response {
    Json(host.lock().await.list_apps()).into_response()
}

async fn launch_app(
    State(host): State<SharedHost>,
    body: Result<Json<LaunchRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let report = host.lock().await.launch(&request.app_name).await.map_err(|e| {
        warn!(app = %request.app_name, error = %e, "Launch failed");
        ApiError::from(e)
    })?;
    Ok(Json(json!({
        "success": true,
        "appName": report.app_name,
        "initialData": report.initial_data,
        "renderPort": report.render_port,
    })))
}

async fn show_app(State(host): State<SharedHost>) -> ApiResult {
    show_active(&host).await?;
    Ok(Json(json!({ "success": true })))
}

async fn hide_app(State(host): State<SharedHost>) -> ApiResult {
    hide_active(&host).await?;
    Ok(Json(json!({ "success": true })))
}

async fn refresh_app(State(host): State<SharedHost>) -> ApiResult {
    let data = host.lock().await.refresh()?;
    Ok(Json(json!({ "success": true, "data": data })))
}

async fn current_app(State(host): State<SharedHost>) -> Response {
    Json(host.lock().await.current()).into_response()
}

async fn terminate_app(State(host): State<SharedHost>, body: axum::body::Bytes) -> ApiResult {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        TerminateRequest::default()
    } else {
        serde_json::from_slice::<Option<TerminateRequest>>(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid request body: {e}")))?
            .unwrap_or_default()
    };
    host.lock().await.terminate(request.app_name.as_deref())?;
    info!(app = ?request.app_name, "Terminate requested");
    Ok(Json(json!({ "success": true })))
}

async fn call_method(
    State(host): State<SharedHost>,
    body: Result<Json<CallMethodPayload>, JsonRejection>,
) -> Result<Json<MethodCallResponsePayload>, ApiError> {
    let Json(call) = body?;
    let outcome = call_active_method(&host, &call.method_name, call.args).await?;
    Ok(Json(MethodCallResponsePayload::from_outcome(
        &call.method_name,
        &outcome,
    )))
}
