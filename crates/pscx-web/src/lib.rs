//! Axum trigger, status and download surface for the extractor.

use std::path::Path;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use pscx_sync::{maybe_build_scheduler, ExtractConfig, ExtractionCoordinator, TriggerOutcome};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "pscx-web";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: ExtractionCoordinator,
}

impl AppState {
    pub fn new(coordinator: ExtractionCoordinator) -> Self {
        Self { coordinator }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusBody {
    pub busy: bool,
    pub latest: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct GenerateQuery {
    #[serde(rename = "pageSize")]
    page_size: Option<u32>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/check", get(check_handler))
        .route("/status", get(status_handler))
        .route("/files", get(files_handler))
        .route("/download", get(download_handler))
        .route("/download/test", get(download_test_handler))
        .route("/generate-extract", post(generate_handler))
        .route("/clean-all", post(clean_all_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(coordinator: ExtractionCoordinator, port: u16) -> anyhow::Result<()> {
    let scheduler = maybe_build_scheduler(&coordinator).await?;
    if let Some(sched) = &scheduler {
        sched.start().await?;
        info!(cron = %coordinator.config().extract_cron, "extraction scheduler started");
    }

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, app(AppState::new(coordinator))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("PSCX_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let coordinator = ExtractionCoordinator::from_config(ExtractConfig::from_env())?;
    serve(coordinator, port).await
}

async fn check_handler() -> &'static str {
    "alive"
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.latest_artifact() {
        Ok(latest) => Json(StatusBody {
            busy: state.coordinator.is_busy(),
            latest: latest
                .as_deref()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().to_string()),
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn files_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.list_files() {
        Ok(files) => {
            let mut entries = files
                .into_iter()
                .map(|f| format!("{}:{}", f.file_name, f.size))
                .collect::<Vec<_>>();
            entries.sort();
            Json(entries).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn download_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.latest_artifact() {
        Ok(Some(path)) => zip_attachment(&path).await,
        Ok(None) => {
            error!("download failed, no extract available");
            StatusCode::NOT_FOUND.into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn download_test_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.pinned_artifact() {
        Some(path) => zip_attachment(&path).await,
        None => {
            error!("download failed, no test extract available");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GenerateQuery>,
) -> Response {
    if query.page_size == Some(0) {
        return (StatusCode::BAD_REQUEST, "pageSize must be positive").into_response();
    }
    match state.coordinator.start(query.page_size) {
        TriggerOutcome::Accepted => StatusCode::OK.into_response(),
        TriggerOutcome::AlreadyRunning => StatusCode::CONFLICT.into_response(),
    }
}

async fn clean_all_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.clean_all() {
        Ok(_) => "all files in storage were deleted".into_response(),
        Err(err) => {
            error!("cleaning directory failed: {err:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "cleaning directory failed").into_response()
        }
    }
}

async fn zip_attachment(path: &Path) -> Response {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(file = %file_name, "download failed, file vanished");
            return StatusCode::NOT_FOUND.into_response();
        }
        Err(err) => {
            return server_error(anyhow::Error::new(err).context(format!("opening {file_name}")))
        }
    };
    let length = match file.metadata().await {
        Ok(metadata) => metadata.len(),
        Err(err) => {
            return server_error(anyhow::Error::new(err).context(format!("reading {file_name}")))
        }
    };

    info!(file = %file_name, bytes = length, "download started");
    (
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={file_name}"),
            ),
            (header::CONTENT_LENGTH, length.to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!("request failed: {err:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Server error: {err:#}"),
    )
        .into_response()
}
