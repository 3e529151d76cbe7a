//! HTTP surface: thin resource endpoints mapping 1:1 to backend primitives.

use crate::address::Address;
use crate::backend::{Backend, BackendKind, BreakpointRequest};
use crate::capture::{self, CaptureRequest};
use crate::error::Error;
use crate::qemu::launcher::LaunchConfig;
use crate::server::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;

/// Error wrapper carrying the taxonomy's HTTP status mapping.
pub struct ApiError(pub Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        ApiError(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn backend(state: &AppState) -> ApiResult<Arc<Backend>> {
    Ok(state.holder.require().await?)
}

pub async fn backend_info(State(state): State<AppState>) -> ApiResult<Response> {
    match state.holder.current().await {
        Some(backend) => Ok(Json(backend.info().await).into_response()),
        None => Ok(Json(json!({ "backend": null, "status": "disconnected" })).into_response()),
    }
}

#[derive(Deserialize)]
pub struct SelectBody {
    pub backend: String,
}

/// The only endpoint that reseats the holder: shuts the current backend
/// down (best-effort), creates the new kind via the factory, assigns it.
pub async fn select_backend(
    State(state): State<AppState>,
    Json(body): Json<SelectBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let kind = BackendKind::from_str(&body.backend)
        .map_err(|_| Error::UnknownBackend(body.backend.clone()))?;
    let factory = state.factory.as_ref().ok_or(Error::NoFactory)?;
    let backend = Arc::new(factory.create(kind));
    state.holder.replace(backend).await;
    Ok(Json(json!({ "backend": kind })))
}

pub async fn launch_defaults(State(state): State<AppState>) -> ApiResult<Json<LaunchConfig>> {
    let factory = state.factory.as_ref().ok_or(Error::NoFactory)?;
    Ok(Json(factory.qemu_launch.clone()))
}

pub async fn launch(
    State(state): State<AppState>,
    Json(config): Json<LaunchConfig>,
) -> ApiResult<Response> {
    let backend = backend(&state).await?;
    backend.launch(config).await?;
    Ok(Json(backend.info().await).into_response())
}

pub async fn shutdown(State(state): State<AppState>) -> ApiResult<Response> {
    let backend = backend(&state).await?;
    backend.shutdown().await?;
    Ok(Json(backend.info().await).into_response())
}

pub async fn registers(State(state): State<AppState>) -> ApiResult<Response> {
    let backend = backend(&state).await?;
    Ok(Json(backend.read_registers().await?).into_response())
}

#[derive(Deserialize)]
pub struct MemoryQuery {
    pub format: Option<String>,
}

pub async fn read_memory(
    State(state): State<AppState>,
    Path((addr, size)): Path<(String, usize)>,
    Query(query): Query<MemoryQuery>,
) -> ApiResult<Response> {
    let address: Address = addr.parse()?;
    let format = query.format.as_deref().unwrap_or("raw");
    if !matches!(format, "raw" | "base64") {
        return Err(Error::Argument(format!("unknown memory format `{format}`")).into());
    }
    let backend = backend(&state).await?;
    let bytes = backend.read_memory(address, size).await?;

    if format == "raw" {
        Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response())
    } else {
        Ok(Json(json!({
            "address": address.to_string(),
            "size": bytes.len(),
            "data": BASE64.encode(&bytes),
            "checksum": capture::sha256_hex(&bytes),
        }))
        .into_response())
    }
}

#[derive(Deserialize)]
pub struct WriteBody {
    pub data: String,
}

pub async fn write_memory(
    State(state): State<AppState>,
    Path(addr): Path<String>,
    Json(body): Json<WriteBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let address: Address = addr.parse()?;
    let bytes = BASE64
        .decode(&body.data)
        .map_err(|e| Error::Argument(format!("bad base64 payload: {e}")))?;
    let backend = backend(&state).await?;
    backend.write_memory(address, &bytes).await?;
    Ok(Json(json!({ "address": address.to_string(), "written": bytes.len() })))
}

pub async fn screenshot(State(state): State<AppState>) -> ApiResult<Response> {
    let backend = backend(&state).await?;
    let (bytes, format) = backend.screenshot().await?;
    Ok(([(header::CONTENT_TYPE, format.content_type())], bytes).into_response())
}

#[derive(Deserialize)]
pub struct KeysBody {
    pub keys: Vec<String>,
    #[serde(default)]
    pub delay: Option<u64>,
}

pub async fn send_keys(
    State(state): State<AppState>,
    Json(body): Json<KeysBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let backend = backend(&state).await?;
    backend.send_keys(&body.keys, body.delay).await?;
    Ok(Json(json!({ "sent": body.keys.len() })))
}

pub async fn list_breakpoints(State(state): State<AppState>) -> ApiResult<Response> {
    let backend = backend(&state).await?;
    Ok(Json(backend.list_breakpoints().await?).into_response())
}

pub async fn create_breakpoint(
    State(state): State<AppState>,
    Json(request): Json<BreakpointRequest>,
) -> ApiResult<Response> {
    let backend = backend(&state).await?;
    let breakpoint = backend.set_breakpoint(request).await?;
    Ok((StatusCode::CREATED, Json(breakpoint)).into_response())
}

pub async fn delete_breakpoint(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> ApiResult<Json<serde_json::Value>> {
    let backend = backend(&state).await?;
    backend.remove_breakpoint(id).await?;
    Ok(Json(json!({ "removed": id })))
}

pub async fn execution(
    State(state): State<AppState>,
    Path(action): Path<String>,
) -> ApiResult<Response> {
    let backend = backend(&state).await?;
    match action.as_str() {
        "pause" => {
            let registers = backend.pause().await?;
            Ok(Json(json!({ "status": "paused", "registers": registers })).into_response())
        }
        "resume" => {
            backend.resume().await?;
            Ok(Json(json!({ "status": "running" })).into_response())
        }
        "step" => {
            let registers = backend.step().await?;
            Ok(Json(json!({ "status": "paused", "registers": registers })).into_response())
        }
        other => Err(Error::Argument(format!("unknown execution action `{other}`")).into()),
    }
}

pub async fn list_snapshots(State(state): State<AppState>) -> ApiResult<Response> {
    let backend = backend(&state).await?;
    Ok(Json(backend.list_snapshots().await?).into_response())
}

#[derive(Deserialize)]
pub struct SnapshotBody {
    pub action: String,
    pub name: String,
}

pub async fn snapshot_action(
    State(state): State<AppState>,
    Json(body): Json<SnapshotBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let backend = backend(&state).await?;
    match body.action.as_str() {
        "save" => backend.save_snapshot(&body.name).await?,
        "load" => backend.load_snapshot(&body.name).await?,
        other => return Err(Error::Argument(format!("unknown snapshot action `{other}`")).into()),
    }
    Ok(Json(json!({ "action": body.action, "name": body.name })))
}

pub async fn run_capture(
    State(state): State<AppState>,
    Json(request): Json<CaptureRequest>,
) -> ApiResult<Response> {
    let backend = backend(&state).await?;
    let _ = state.capture_events.send(json!({
        "type": "capture:stage",
        "stage": "start",
        "prefix": request.prefix,
    }));

    match capture::run_capture(&backend, &request, &state.dirs.captures).await {
        Ok(result) => {
            let _ = state.capture_events.send(json!({
                "type": "capture:complete",
                "prefix": result.prefix,
                "checksums": result.checksums,
            }));
            Ok(Json(result).into_response())
        }
        Err(e) => {
            let _ = state.capture_events.send(json!({
                "type": "capture:failed",
                "prefix": request.prefix,
                "error": e.to_string(),
            }));
            Err(e.into())
        }
    }
}

pub async fn capture_inventory(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(capture::inventory(&state.dirs.captures).await?).into_response())
}

pub async fn golden_generate(
    State(state): State<AppState>,
    Json(request): Json<CaptureRequest>,
) -> ApiResult<Response> {
    let backend = backend(&state).await?;
    let result = capture::generate_golden(&backend, &request, &state.dirs.golden).await?;
    Ok(Json(result).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareBody {
    pub test_name: Option<String>,
    #[serde(flatten)]
    pub capture: CaptureRequest,
}

pub async fn golden_compare(
    State(state): State<AppState>,
    Json(body): Json<CompareBody>,
) -> ApiResult<Response> {
    let backend = backend(&state).await?;
    let mut request = body.capture;
    if let Some(name) = body.test_name {
        request.prefix = name;
    }
    let report = capture::compare_golden(
        &backend,
        &request,
        &state.dirs.golden,
        &state.dirs.compare_dir(),
    )
    .await?;
    Ok(Json(report).into_response())
}
