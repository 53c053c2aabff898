use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
};
use axum_extra::extract::{
    Multipart,
    multipart::{MultipartError, MultipartRejection},
};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::{
    config::UPLOADS_PREFIX,
    detection::TextBox,
    error::{ApiError, Result},
    state::AppState,
};

const IMAGE_FIELD: &str = "image";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub detector_available: bool,
    pub cuda_available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectResponse {
    pub success: bool,
    pub text_boxes: Vec<TextBox>,
    pub detector_used: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectUrlRequest {
    #[serde(default)]
    pub image_url: Option<String>,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        detector_available: state.service.is_loaded(),
        cuda_available: state.cuda_available,
    })
}

/// POST /detect with a multipart `image` file.
///
/// The upload is staged to a temp file that is removed when this handler
/// returns, whatever the outcome.
pub async fn detect(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectResponse>> {
    let Ok(mut multipart) = multipart else {
        return Err(ApiError::BadRequest("No image file provided".to_string()));
    };

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, "Failed to read multipart body"))?
    {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        // a plain form value named `image` is not a file
        let Some(file_name) = field.file_name() else {
            continue;
        };
        if file_name.is_empty() {
            return Err(ApiError::BadRequest("No image file selected".to_string()));
        }

        let bytes = field
            .bytes()
            .await
            .map_err(|e| multipart_error(e, "Failed to read uploaded image"))?;
        upload = Some(bytes);
        break;
    }

    let Some(bytes) = upload else {
        return Err(ApiError::BadRequest("No image file provided".to_string()));
    };

    let staged = stage_upload(&state.config.temp_dir(), &bytes)?;
    let response = run_detection(&state, staged.path().to_path_buf()).await;

    if let Err(e) = staged.close() {
        tracing::warn!("Failed to remove staged upload: {}", e);
    }

    response
}

/// POST /detect_url with JSON `{"image_url": "/uploads/<name>"}`.
pub async fn detect_url(
    State(state): State<AppState>,
    payload: std::result::Result<Json<DetectUrlRequest>, JsonRejection>,
) -> Result<Json<DetectResponse>> {
    let image_url = payload
        .ok()
        .and_then(|Json(request)| request.image_url)
        .ok_or_else(|| ApiError::BadRequest("No image_url provided".to_string()))?;

    let file_path = resolve_upload_path(&state.config.uploads_dir, &image_url)
        .ok_or_else(|| ApiError::BadRequest("Only local image URLs supported".to_string()))?;

    // anything present is handed to the service; a directory decodes to the mock result
    if !file_path.exists() {
        return Err(ApiError::NotFound("Image file not found".to_string()));
    }

    run_detection(&state, file_path).await
}

/// Maps `/uploads/<name>` to `<uploads_dir>/<name>`. Only the final path
/// segment is used, so no nested path below `uploads_dir` can be named.
fn resolve_upload_path(uploads_dir: &Path, image_url: &str) -> Option<PathBuf> {
    if !image_url.starts_with(UPLOADS_PREFIX) {
        return None;
    }
    let file_name = image_url.rsplit('/').next().unwrap_or_default();
    Some(uploads_dir.join(file_name))
}

/// Oversized bodies keep their 413; every other stream failure is internal.
fn multipart_error(err: MultipartError, context: &str) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::PayloadTooLarge(format!("{context}: {}", err.body_text()))
    } else {
        ApiError::Internal(anyhow::Error::new(err).context(context.to_string()))
    }
}

fn stage_upload(dir: &Path, bytes: &[u8]) -> anyhow::Result<NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("upload-")
        .suffix(".jpg")
        .tempfile_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    file.write_all(bytes).context("Failed to stage upload")?;
    file.flush().context("Failed to stage upload")?;
    Ok(file)
}

async fn run_detection(state: &AppState, image_path: PathBuf) -> Result<Json<DetectResponse>> {
    let service = Arc::clone(&state.service);
    let text_boxes = tokio::task::spawn_blocking(move || service.detect(&image_path))
        .await
        .context("Detection task failed")?;

    Ok(Json(DetectResponse {
        success: true,
        text_boxes,
        detector_used: state.service.backend().to_string(),
    }))
}
