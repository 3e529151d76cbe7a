//! Control broker: HTTP endpoints and the WebSocket multiplexer, both
//! addressing whatever backend currently occupies the holder slot.

pub mod http;
pub mod ws;

use crate::backend::{BackendFactory, BackendHolder};
use axum::routing::{delete, get, post};
use axum::Router;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

const CAPTURE_EVENT_CAPACITY: usize = 64;

/// Artifact directories, resolved once at startup.
#[derive(Debug, Clone)]
pub struct CaptureDirs {
    pub captures: PathBuf,
    pub golden: PathBuf,
}

impl CaptureDirs {
    /// Scratch area for golden comparisons.
    pub fn compare_dir(&self) -> PathBuf {
        self.captures.join("compare")
    }
}

#[derive(Clone)]
pub struct AppState {
    pub holder: Arc<BackendHolder>,
    pub factory: Option<Arc<BackendFactory>>,
    pub dirs: Arc<CaptureDirs>,
    /// Capture stage/complete events, fanned out to `capture` subscribers.
    pub capture_events: broadcast::Sender<Value>,
}

impl AppState {
    pub fn new(factory: Option<BackendFactory>, dirs: CaptureDirs) -> Self {
        let (capture_events, _) = broadcast::channel(CAPTURE_EVENT_CAPACITY);
        AppState {
            holder: Arc::new(BackendHolder::new()),
            factory: factory.map(Arc::new),
            dirs: Arc::new(dirs),
            capture_events,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/backend", get(http::backend_info))
        .route("/api/backend/select", post(http::select_backend))
        .route("/api/launch/defaults", get(http::launch_defaults))
        .route("/api/launch", post(http::launch).delete(http::shutdown))
        .route("/api/registers", get(http::registers))
        .route("/api/memory/:addr/:size", get(http::read_memory))
        .route("/api/memory/:addr", post(http::write_memory))
        .route("/api/screenshot", get(http::screenshot))
        .route("/api/keys", post(http::send_keys))
        .route(
            "/api/breakpoints",
            get(http::list_breakpoints).post(http::create_breakpoint),
        )
        .route("/api/breakpoints/:id", delete(http::delete_breakpoint))
        .route("/api/execution/:action", post(http::execution))
        .route(
            "/api/snapshots",
            get(http::list_snapshots).post(http::snapshot_action),
        )
        .route("/api/states", get(http::list_snapshots))
        .route(
            "/api/captures",
            get(http::capture_inventory).post(http::run_capture),
        )
        .route("/api/golden/generate", post(http::golden_generate))
        .route("/api/golden/compare", post(http::golden_compare))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}
