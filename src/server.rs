//! Web server for the control API

use anyhow::Result;
use arc_swap::ArcSwapOption;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::FisheyeEngine;
use crate::error::FisheyeError;
use crate::panel::{Panel, PANEL_FOV_DEGREES};
use crate::pipeline::{PipelineStats, StatsSnapshot};
use crate::pixel_map::MapStats;
use crate::projection::ProjectionModel;

/// Shared application state
pub struct AppState {
    /// Configuration as last applied
    pub config: Arc<RwLock<Config>>,
    /// Path to save configuration
    config_path: PathBuf,
    /// Pixel map and renderer
    pub engine: Arc<FisheyeEngine>,
    /// Render loop counters
    pub stats: PipelineStats,
    /// Latest preview frame (JPEG encoded)
    preview_frame: ArcSwapOption<Vec<u8>>,
    /// Set to make the render loop exit
    stop_requested: AtomicBool,
}

impl AppState {
    pub fn new(config: Arc<RwLock<Config>>, config_path: PathBuf, engine: Arc<FisheyeEngine>) -> Self {
        Self {
            config,
            config_path,
            engine,
            stats: PipelineStats::default(),
            preview_frame: ArcSwapOption::empty(),
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Replace the preview frame (called from the render thread)
    pub fn publish_preview(&self, jpeg: Vec<u8>) {
        self.preview_frame.store(Some(Arc::new(jpeg)));
    }

    /// Get the latest preview frame
    pub fn preview(&self) -> Option<Arc<Vec<u8>>> {
        self.preview_frame.load_full()
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Apply a fisheye settings change: rebuild the map, then record it in the config.
    ///
    /// The config stays write-locked until the new map is published, so
    /// concurrent updates land in the config in the same order as in the engine.
    /// Returns whether a new map was built.
    pub fn apply_fisheye(&self, update: &FisheyeUpdate) -> Result<bool, FisheyeError> {
        let mut config = self.config.write();
        let mut fisheye = config.fisheye;
        if let Some(width) = update.image_width {
            fisheye.image_width = width;
        }
        if let Some(n) = update.sample_factor {
            fisheye.sample_factor = n;
        }
        if let Some(projection) = update.projection {
            fisheye.projection = projection;
        }

        let rebuilt =
            self.engine
                .reconfigure(fisheye.image_width, fisheye.sample_factor, fisheye.projection)?;
        config.fisheye = fisheye;
        Ok(rebuilt)
    }

    /// Save configuration to file
    pub fn save_config(&self) -> Result<()> {
        let config = self.config.read();
        config.save(&self.config_path)
    }
}

/// Build the API router
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/info", get(get_info))
        .route("/api/fisheye", get(get_fisheye))
        .route("/api/fisheye", post(set_fisheye))
        .route("/api/stats", get(get_stats))
        .route("/api/preview", get(get_preview))
        .route("/api/preview/stream", get(preview_stream))
        .route("/api/config/save", post(save_config))
        .layer(cors)
        .with_state(state)
}

/// Run the web server
pub async fn run_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Web server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Current fisheye settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FisheyeSettings {
    pub image_width: u32,
    pub sample_factor: u32,
    pub projection: ProjectionModel,
}

/// Partial update of the fisheye settings
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct FisheyeUpdate {
    pub image_width: Option<u32>,
    pub sample_factor: Option<u32>,
    pub projection: Option<ProjectionModel>,
}

fn current_settings(engine: &FisheyeEngine) -> FisheyeSettings {
    let (geometry, projection) = engine.configuration();
    FisheyeSettings {
        image_width: geometry.image_width(),
        sample_factor: geometry.sample_factor(),
        projection,
    }
}

async fn get_fisheye(State(state): State<Arc<AppState>>) -> Json<FisheyeSettings> {
    Json(current_settings(&state.engine))
}

#[derive(Serialize)]
struct ReconfigureResponse {
    rebuilt: bool,
    settings: FisheyeSettings,
    map: MapStats,
}

/// Change geometry or projection; rebuilds the pixel map
async fn set_fisheye(
    State(state): State<Arc<AppState>>,
    Json(update): Json<FisheyeUpdate>,
) -> impl IntoResponse {
    // Map builds are CPU bound, keep them off the async workers
    let worker = state.clone();
    let result = tokio::task::spawn_blocking(move || worker.apply_fisheye(&update)).await;

    match result {
        Ok(Ok(rebuilt)) => Json(ReconfigureResponse {
            rebuilt,
            settings: current_settings(&state.engine),
            map: state.engine.map().stats(),
        })
        .into_response(),
        Ok(Err(e)) => {
            warn!("Rejected fisheye settings: {}", e);
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

/// Save configuration to file
async fn save_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.save_config() {
        Ok(_) => (StatusCode::OK, "Saved").into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// Get current preview frame (JPEG)
async fn get_preview(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(frame) = state.preview() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "No frame available").into_response();
    };

    (
        [(axum::http::header::CONTENT_TYPE, "image/jpeg")],
        frame.as_ref().clone(),
    )
        .into_response()
}

/// MJPEG stream endpoint for continuous preview
async fn preview_stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    use axum::body::Body;
    use tokio_stream::StreamExt;

    let stream = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(
        std::time::Duration::from_millis(100), // ~10 fps for preview
    ))
    .map(move |_| Ok::<_, std::convert::Infallible>(multipart_part(state.preview().as_deref())));

    let body = Body::from_stream(stream);

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        body,
    )
}

/// One `multipart/x-mixed-replace` part; an empty part while no frame exists
fn multipart_part(jpeg: Option<&Vec<u8>>) -> Vec<u8> {
    let Some(frame) = jpeg else {
        return b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
    };

    let mut part = Vec::with_capacity(frame.len() + 96);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ");
    part.extend_from_slice(frame.len().to_string().as_bytes());
    part.extend_from_slice(b"\r\n\r\n");
    part.extend_from_slice(frame);
    part.extend_from_slice(b"\r\n");
    part
}

/// System information response
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    image_width: u32,
    sample_factor: u32,
    projection: ProjectionModel,
    field_of_view: f64,
    panel_fov: f32,
    panels: Vec<PanelInfo>,
    mapped_pixels: usize,
}

#[derive(Serialize)]
struct PanelInfo {
    panel: Panel,
    pitch: f32,
    yaw: f32,
}

/// Get system information
async fn get_info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    let map = state.engine.map();
    let geometry = map.geometry();

    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        image_width: geometry.image_width(),
        sample_factor: geometry.sample_factor(),
        projection: map.model(),
        field_of_view: map.model().field_of_view_degrees(),
        panel_fov: PANEL_FOV_DEGREES,
        panels: Panel::ALL
            .iter()
            .map(|&panel| {
                let (pitch, yaw) = panel.orientation_degrees();
                PanelInfo { panel, pitch, yaw }
            })
            .collect(),
        mapped_pixels: map.len(),
    })
}
