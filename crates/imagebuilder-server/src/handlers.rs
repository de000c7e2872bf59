//! HTTP surface of the engine: liveness, log aggregation, artifact
//! downloads, containerfile preview, and the authenticated artifact ingest
//! endpoint used by disk-image workloads.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::{ReaderStream, StreamReader};

use imagebuilder_core::{ImageBuildSpec, WorkloadGateway};
use imagebuilder_engine::names::{build_job_name, job_pod_selector, BOOTC_JOB_PREFIX};
use imagebuilder_engine::pod_logs::SNAPSHOT_TAIL_LINES;
use imagebuilder_engine::{ContainerfileGenerator, EnrollmentDefaults, EngineError};
use imagebuilder_storage::{StorageError, StorageKind, StorageSink};

use crate::api_errors::ApiError;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<StorageSink>,
    pub workloads: Arc<dyn WorkloadGateway>,
    pub build_namespace: String,
    pub upload_token: Option<String>,
    pub enrollment: EnrollmentDefaults,
}

/// Assemble the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/imagebuilds/:name/logs", get(get_logs))
        .route(
            "/api/v1/imagebuilds/:name/downloads/:filename",
            get(download_artifact),
        )
        .route(
            "/api/v1/imagebuilds/generate-containerfile",
            post(generate_containerfile),
        )
        .route(
            "/api/v1/imagebuilds/upload",
            post(upload_artifact)
                .route_layer(from_fn_with_state(state.clone(), upload_auth))
                // Artifacts are multi-gigabyte; the stream goes straight to
                // storage.
                .layer(DefaultBodyLimit::disable()),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "OK"
}

/// Bearer-token gate for the upload endpoint. 503 when the service has no
/// token configured, 401 on anything that does not match.
async fn upload_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.upload_token.as_deref() else {
        tracing::warn!("upload token not configured, upload endpoint disabled");
        return Err(ApiError::service_unavailable("upload endpoint not configured"));
    };

    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if header.is_empty() {
        return Err(ApiError::unauthorized("missing authorization header"));
    }
    let Some(token) = header.strip_prefix("Bearer ") else {
        return Err(ApiError::unauthorized("invalid authorization header format"));
    };
    if token != expected {
        tracing::warn!("upload request with invalid token");
        return Err(ApiError::unauthorized("invalid token"));
    }

    Ok(next.run(request).await)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UploadResponse {
    success: bool,
    image_name: String,
    image_type: String,
    storage_type: String,
    storage_path: String,
    size: u64,
}

/// Artifact ingest. Multipart field ordering is part of the contract:
/// `imageName`, `imageType`, and `architecture` must precede `file`, so the
/// open file stream can be handed to the storage sink without buffering.
async fn upload_artifact(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut image_name: Option<String> = None;
    let mut image_type: Option<String> = None;
    let mut architecture: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("failed to read upload: {err}")))?
    {
        match field.name().unwrap_or_default() {
            "imageName" => {
                image_name = Some(text_field(field).await?);
            }
            "imageType" => {
                image_type = Some(text_field(field).await?);
            }
            "architecture" => {
                architecture = Some(text_field(field).await?);
            }
            "file" => {
                let (Some(image_name), Some(image_type)) =
                    (image_name.clone(), image_type.clone())
                else {
                    return Err(ApiError::bad_request("imageName and imageType are required"));
                };
                let filename = field.file_name().unwrap_or_default().to_string();
                tracing::info!(
                    %image_name,
                    %image_type,
                    architecture = architecture.as_deref().unwrap_or_default(),
                    %filename,
                    "receiving artifact upload"
                );

                let reader = StreamReader::new(Box::pin(
                    field.map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err)),
                ));
                let stored = state
                    .storage
                    .stream_store(&image_name, &image_type, &filename, reader)
                    .await
                    .map_err(|err| match err {
                        StorageError::InvalidName(_) => {
                            ApiError::bad_request(format!("invalid upload metadata: {err}"))
                        }
                        err => ApiError::internal(format!("failed to store image: {err}")),
                    })?;

                tracing::info!(
                    %image_name,
                    %image_type,
                    path = %stored.path,
                    size = stored.size,
                    "artifact stored"
                );
                return Ok(Json(UploadResponse {
                    success: true,
                    image_name,
                    image_type,
                    storage_type: stored.kind.to_string(),
                    storage_path: stored.path,
                    size: stored.size,
                }));
            }
            other => {
                tracing::debug!(field = %other, "skipping unknown multipart field");
            }
        }
    }

    if image_name.is_none() || image_type.is_none() {
        return Err(ApiError::bad_request("imageName and imageType are required"));
    }
    Err(ApiError::bad_request("no file uploaded"))
}

async fn text_field(field: axum::extract::multipart::Field<'_>) -> Result<String, ApiError> {
    field
        .text()
        .await
        .map_err(|err| ApiError::bad_request(format!("failed to read upload field: {err}")))
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    logs: Vec<String>,
}

/// Aggregate pod logs for the container build job and every disk-image job
/// of a build.
async fn get_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<LogsResponse>, ApiError> {
    if name.is_empty() {
        return Err(ApiError::bad_request("build name is required"));
    }

    let namespace = &state.build_namespace;
    let mut logs = Vec::new();

    let selector = job_pod_selector(&build_job_name(&name));
    match state.workloads.list_pods(namespace, &selector).await {
        Ok(pods) => {
            for pod in pods {
                let Some(pod_name) = pod.metadata.name.as_deref() else {
                    continue;
                };
                match state
                    .workloads
                    .pod_logs(namespace, pod_name, SNAPSHOT_TAIL_LINES)
                    .await
                {
                    Ok(pod_log) if !pod_log.is_empty() => {
                        logs.push(format!("=== Logs from container build pod {pod_name} ==="));
                        logs.extend(pod_log.lines().map(str::to_string));
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(pod = %pod_name, error = %err, "failed to get pod logs")
                    }
                }
            }
        }
        Err(err) => tracing::warn!(build = %name, error = %err, "failed to list build pods"),
    }

    let bootc_prefix = format!("{BOOTC_JOB_PREFIX}{name}-");
    match state.workloads.list_pods(namespace, "").await {
        Ok(pods) => {
            for pod in pods {
                let Some(pod_name) = pod.metadata.name.as_deref() else {
                    continue;
                };
                if !pod_name.starts_with(&bootc_prefix) {
                    continue;
                }
                match state
                    .workloads
                    .pod_logs(namespace, pod_name, SNAPSHOT_TAIL_LINES)
                    .await
                {
                    Ok(pod_log) if !pod_log.is_empty() => {
                        logs.push(format!(
                            "=== Logs from bootc image generation pod {pod_name} ==="
                        ));
                        logs.extend(pod_log.lines().map(str::to_string));
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(pod = %pod_name, error = %err, "failed to get bootc pod logs")
                    }
                }
            }
        }
        Err(err) => tracing::warn!(build = %name, error = %err, "failed to list bootc pods"),
    }

    if logs.is_empty() {
        logs.push("No logs available from build job pods".to_string());
    }

    Ok(Json(LogsResponse { logs }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    spec: ImageBuildSpec,
    #[serde(default)]
    enrollment_cert: Option<String>,
    #[serde(default)]
    enrollment_key: Option<String>,
}

#[derive(Debug, Serialize)]
struct GenerateResponse {
    containerfile: String,
}

/// Pure containerfile synthesis for previews. No cluster interaction.
async fn generate_containerfile(
    State(state): State<AppState>,
    Json(request): Json<GenerateRequest>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let mut generator = ContainerfileGenerator::new(&request.spec)
        .with_enrollment_defaults(state.enrollment.clone());
    if let (Some(cert), Some(key)) = (request.enrollment_cert, request.enrollment_key) {
        generator = generator.with_enrollment_material(cert, key);
    }

    match generator.generate() {
        Ok(containerfile) => Ok(Json(GenerateResponse { containerfile })),
        Err(EngineError::Containerfile(message)) => Err(ApiError::bad_request(message)),
        Err(err) => Err(ApiError::internal(format!(
            "failed to generate containerfile: {err}"
        ))),
    }
}

/// Stream a stored artifact. Download filenames follow
/// `<name>-<type>-<arch>`; only the filesystem backends serve downloads.
async fn download_artifact(
    State(state): State<AppState>,
    Path((name, filename)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    if name.is_empty() || filename.is_empty() {
        return Err(ApiError::bad_request("build name and filename are required"));
    }

    let image_type = parse_download_filename(&filename)
        .ok_or_else(|| ApiError::bad_request("invalid filename format"))?;

    if state.storage.kind() == StorageKind::ObjectStore {
        return Err(ApiError::not_implemented(
            "object-store downloads are not supported",
        ));
    }
    let path = state
        .storage
        .artifact_path(&name, image_type)
        .ok_or_else(|| ApiError::internal("storage backend has no filesystem path"))?;

    let metadata = tokio::fs::metadata(&path).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ApiError::not_found("file not found")
        } else {
            ApiError::internal(format!("failed to stat artifact: {err}"))
        }
    })?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|err| ApiError::internal(format!("failed to open artifact: {err}")))?;

    tracing::info!(build = %name, %filename, path = %path.display(), "serving artifact");

    let body = Body::from_stream(ReaderStream::new(file));
    Response::builder()
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(
            CONTENT_DISPOSITION,
            format!("attachment; filename={filename}"),
        )
        .header(CONTENT_LENGTH, metadata.len())
        .body(body)
        .map_err(|err| ApiError::internal(format!("failed to build response: {err}")))
}

/// Extract the image type from a `<name>-<type>-<arch>` download filename.
/// With only two segments the last one is taken as the type.
fn parse_download_filename(filename: &str) -> Option<&str> {
    let parts: Vec<&str> = filename.split('-').collect();
    match parts.len() {
        0 | 1 => None,
        2 => Some(parts[1]),
        n => Some(parts[n - 2]),
    }
}
