//! REST API handlers.
//!
//! Each handler calls into the shared [`herd::Herd`] and returns JSON
//! responses in the `{success, data, error}` envelope.

use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use herd::HerdError;
use herd_core::{Image, SubConfiguration};
use herd_node::{ComputedFile, FastUpdateRequest, NodeError, SubStatus};
use tracing::info;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn herd_error(e: &HerdError) -> axum::response::Response {
    let status = match e {
        HerdError::UnknownSub(_) | HerdError::ImageNotFound(_) => StatusCode::NOT_FOUND,
        HerdError::NoAccess | HerdError::Node(NodeError::NoAccess) => StatusCode::FORBIDDEN,
        HerdError::NoReason
        | HerdError::Node(NodeError::NoImageSpecified(_))
        | HerdError::Node(NodeError::ImageNotReady(_)) => StatusCode::BAD_REQUEST,
        HerdError::Node(_) => StatusCode::CONFLICT,
        HerdError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

// ── Subs ───────────────────────────────────────────────────────

#[derive(Debug, Default, serde::Deserialize)]
pub struct ListQuery {
    /// Comma-separated status names.
    pub status: Option<String>,
}

/// GET /api/v1/subs
pub async fn list_subs(
    State(state): State<ApiState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let mut statuses = Vec::new();
    for name in query
        .status
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        match name.parse::<SubStatus>() {
            Ok(status) => statuses.push(status),
            Err(e) => return error_response(&e, StatusCode::BAD_REQUEST).into_response(),
        }
    }
    ApiResponse::ok(state.herd.list_subs(&statuses).await).into_response()
}

/// GET /api/v1/subs/:hostname
pub async fn get_sub(
    State(state): State<ApiState>,
    Path(hostname): Path<String>,
) -> impl IntoResponse {
    match state.herd.snapshot(&hostname).await {
        Ok(snapshot) => ApiResponse::ok(snapshot).into_response(),
        Err(e) => herd_error(&e),
    }
}

/// GET /api/v1/snapshots
pub async fn list_snapshots(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.herd.snapshots().await)
}

/// GET /api/v1/status
pub async fn status_summary(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.herd.status_summary().await)
}

/// GET /api/v1/limits
pub async fn limits(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(serde_json::json!({
        "pools": state.herd.pool_stats(),
        "cpu": state.herd.cpu_stats(),
    }))
}

// ── Operator actions ───────────────────────────────────────────

/// POST /api/v1/subs/:hostname/clear-safety-shutoff
pub async fn clear_safety_shutoff(
    State(state): State<ApiState>,
    Path(hostname): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let auth = state.auth(&headers);
    match state.herd.clear_safety_shutoff(&hostname, &auth).await {
        Ok(()) => ApiResponse::ok("safety shutoff cleared").into_response(),
        Err(e) => herd_error(&e),
    }
}

/// POST /api/v1/subs/:hostname/force-disruptive-update
pub async fn force_disruptive_update(
    State(state): State<ApiState>,
    Path(hostname): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let auth = state.auth(&headers);
    match state.herd.force_disruptive_update(&hostname, &auth).await {
        Ok(()) => ApiResponse::ok("disruptive update forced").into_response(),
        Err(e) => herd_error(&e),
    }
}

/// POST /api/v1/subs/:hostname/fast-update
///
/// Runs the fast update to completion and returns every progress message;
/// the last one carries `final` and `synced`.
pub async fn fast_update(
    State(state): State<ApiState>,
    Path(hostname): Path<String>,
    headers: HeaderMap,
    Json(request): Json<FastUpdateRequest>,
) -> impl IntoResponse {
    let auth = state.auth(&headers);
    let mut rx = match state.herd.fast_update(&hostname, request, &auth).await {
        Ok(rx) => rx,
        Err(e) => return herd_error(&e),
    };
    let mut messages = Vec::new();
    while let Some(message) = rx.recv().await {
        messages.push(message);
    }
    ApiResponse::ok(messages).into_response()
}

/// POST /api/v1/subs/:hostname/computed-files
pub async fn receive_computed_files(
    State(state): State<ApiState>,
    Path(hostname): Path<String>,
    headers: HeaderMap,
    Json(files): Json<Vec<ComputedFile>>,
) -> impl IntoResponse {
    if !state.auth(&headers).have_method_access {
        return herd_error(&HerdError::NoAccess);
    }
    let count = files.len();
    match state.herd.receive_computed_files(&hostname, files).await {
        Ok(()) => ApiResponse::ok(count).into_response(),
        Err(e) => herd_error(&e),
    }
}

// ── Herd-wide settings ─────────────────────────────────────────

/// GET /api/v1/updates
pub async fn get_updates(State(state): State<ApiState>) -> impl IntoResponse {
    match state.herd.updates_disabled() {
        Ok(disabled) => ApiResponse::ok(disabled).into_response(),
        Err(e) => herd_error(&e),
    }
}

/// Disable request body.
#[derive(Debug, serde::Deserialize)]
pub struct DisableUpdatesRequest {
    pub reason: String,
}

/// POST /api/v1/updates/disable
pub async fn disable_updates(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<DisableUpdatesRequest>,
) -> impl IntoResponse {
    let auth = state.auth(&headers);
    match state.herd.disable_updates(&req.reason, &auth) {
        Ok(()) => ApiResponse::ok("updates disabled").into_response(),
        Err(e) => herd_error(&e),
    }
}

/// POST /api/v1/updates/enable
pub async fn enable_updates(State(state): State<ApiState>, headers: HeaderMap) -> impl IntoResponse {
    let auth = state.auth(&headers);
    match state.herd.enable_updates(&auth) {
        Ok(()) => ApiResponse::ok("updates enabled").into_response(),
        Err(e) => herd_error(&e),
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct DefaultImage {
    #[serde(default)]
    pub image: Option<String>,
}

/// GET /api/v1/default-image
pub async fn get_default_image(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(DefaultImage {
        image: state.herd.default_image(),
    })
}

/// PUT /api/v1/default-image
pub async fn set_default_image(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<DefaultImage>,
) -> impl IntoResponse {
    let auth = state.auth(&headers);
    match state
        .herd
        .set_default_image(req.image.as_deref(), &auth)
        .await
    {
        Ok(()) => ApiResponse::ok(DefaultImage {
            image: state.herd.default_image(),
        })
        .into_response(),
        Err(e) => herd_error(&e),
    }
}

/// GET /api/v1/sub-configuration
pub async fn get_sub_configuration(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.herd.sub_configuration())
}

/// PUT /api/v1/sub-configuration
pub async fn set_sub_configuration(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(config): Json<SubConfiguration>,
) -> impl IntoResponse {
    let auth = state.auth(&headers);
    match state.herd.set_sub_configuration(config, &auth) {
        Ok(()) => ApiResponse::ok(state.herd.sub_configuration()).into_response(),
        Err(e) => herd_error(&e),
    }
}

/// GET /api/v1/images
pub async fn list_images(State(state): State<ApiState>) -> impl IntoResponse {
    match state.herd.image_names() {
        Ok(names) => ApiResponse::ok(names).into_response(),
        Err(e) => herd_error(&e),
    }
}

/// PUT /api/v1/images/:name
pub async fn add_image(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    Json(image): Json<Image>,
) -> impl IntoResponse {
    let auth = state.auth(&headers);
    if !auth.have_method_access {
        return herd_error(&HerdError::NoAccess);
    }
    if let Err(e) = image.filesystem.check_consistency() {
        return error_response(&e.to_string(), StatusCode::BAD_REQUEST).into_response();
    }
    if state.herd.image_names().is_ok_and(|names| names.contains(&name)) {
        return error_response(&format!("image exists: {name}"), StatusCode::CONFLICT)
            .into_response();
    }
    match state.herd.add_image(&name, image) {
        Ok(()) => {
            info!(user = %auth.username, image = %name, "image added");
            (StatusCode::CREATED, ApiResponse::ok(name)).into_response()
        }
        Err(e) => herd_error(&e),
    }
}

// ── Diagnostics ────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
pub struct HoldLockRequest {
    pub seconds: u64,
    #[serde(default)]
    pub write: bool,
}

/// POST /api/v1/debug/hold-lock
pub async fn hold_lock(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(req): Json<HoldLockRequest>,
) -> impl IntoResponse {
    let auth = state.auth(&headers);
    if !auth.have_method_access {
        return herd_error(&HerdError::NoAccess);
    }
    info!(user = %auth.username, seconds = req.seconds, write = req.write, "holding node lock");
    let held = state
        .herd
        .hold_lock(Duration::from_secs(req.seconds), req.write)
        .await;
    ApiResponse::ok(serde_json::json!({ "held_secs": held.as_secs() })).into_response()
}
