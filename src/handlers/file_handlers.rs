//! HTTP handlers for a principal's files.
//! Upload bodies are streamed straight into the upload transaction; downloads
//! stream back out of the object store.

use crate::{
    errors::{AppError, VaultError},
    handlers::extract::Authenticated,
    models::{
        file_record::{FileRecord, format_size},
        upload::UploadProgress,
    },
    services::{
        reconcile::{ReconcileReport, RepairSummary},
        upload_manager::UploadRequest,
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

const UPLOAD_ID_HEADER: &str = "x-upload-id";

/// `GET /files`: the caller's files, newest first.
pub async fn list_files(
    State(state): State<AppState>,
    auth: Authenticated,
) -> Result<Json<Vec<FileRecord>>, AppError> {
    let files = state.ledger.list_for(auth.session.principal).await?;
    Ok(Json(files))
}

/// `PUT /files/{name}`: upload the raw request body as a new file.
///
/// `Content-Length` is required and must match the body exactly. Clients may
/// pass `x-upload-id` to poll progress on `/uploads/{upload_id}`; an id that
/// is already in use by the caller is rejected with 409.
pub async fn upload_file(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let size_bytes = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .ok_or_else(|| AppError::new(StatusCode::LENGTH_REQUIRED, "Content-Length is required"))?;

    let source = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();

    let request = UploadRequest {
        name,
        size_bytes,
        source,
    };
    let handle = state
        .uploads
        .start(&auth.gate, &auth.session, request)
        .await?;

    let upload_id = headers
        .get(UPLOAD_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| handle.upload_id().to_string());

    let owner = auth.session.principal;
    let Some(_tracked) = state.progress.track(owner, &upload_id, handle.progress()) else {
        handle.cancel();
        let _ = handle.finish().await;
        return Err(AppError::new(
            StatusCode::CONFLICT,
            format!("upload `{}` is already in progress", upload_id),
        ));
    };

    // The body dies with this request, so a dropped request cancels the write.
    let _cancel_on_disconnect = handle.cancel_on_drop();
    let record = handle.finish().await?;

    let mut response = (StatusCode::CREATED, Json(record.clone())).into_response();
    let resp_headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&upload_id) {
        resp_headers.insert(HeaderName::from_static(UPLOAD_ID_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", record.checksum)) {
        resp_headers.insert(header::ETAG, value);
    }
    Ok(response)
}

/// `GET /files/{id}`: stream a file back to its owner.
pub async fn download_file(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_file_id(&id)?;
    let record = state.ledger.get(auth.session.principal, id).await?;
    let reader = state
        .store
        .open_reader(&record.locator)
        .await
        .map_err(VaultError::from)?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(reader)));
    set_file_headers(response.headers_mut(), &record);
    Ok(response)
}

/// `DELETE /files/{id}`: remove the object, then its record.
pub async fn delete_file(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = parse_file_id(&id)?;
    state
        .deletes
        .delete_by_id(&auth.gate, &auth.session, id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /uploads/{upload_id}`: live progress of one of the caller's uploads.
pub async fn upload_progress(
    State(state): State<AppState>,
    auth: Authenticated,
    Path(upload_id): Path<String>,
) -> Result<Json<UploadProgressResponse>, AppError> {
    let progress = state
        .progress
        .snapshot(auth.session.principal, &upload_id)
        .ok_or_else(|| {
            AppError::new(
                StatusCode::NOT_FOUND,
                format!("no upload `{}` in progress", upload_id),
            )
        })?;
    Ok(Json(UploadProgressResponse::new(upload_id, progress)))
}

#[derive(Serialize)]
pub struct UploadProgressResponse {
    pub upload_id: String,
    #[serde(flatten)]
    pub progress: UploadProgress,
    pub fraction: f64,
}

impl UploadProgressResponse {
    fn new(upload_id: String, progress: UploadProgress) -> Self {
        Self {
            upload_id,
            fraction: progress.fraction(),
            progress,
        }
    }
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub file_count: i64,
    pub total_bytes: i64,
    pub total_size: String,
    pub limit_bytes: u64,
    pub limit: String,
    pub used_fraction: f64,
}

/// `GET /stats`: usage totals against the configured per-user limit.
pub async fn stats(
    State(state): State<AppState>,
    auth: Authenticated,
) -> Result<Json<StatsResponse>, AppError> {
    let usage = state.ledger.usage_for(auth.session.principal).await?;
    let limit_bytes = state.config.storage_limit_bytes;
    let used_fraction = if limit_bytes == 0 {
        0.0
    } else {
        usage.total_bytes as f64 / limit_bytes as f64
    };

    Ok(Json(StatsResponse {
        file_count: usage.file_count,
        total_bytes: usage.total_bytes,
        total_size: format_size(usage.total_bytes),
        limit_bytes,
        limit: format_size(i64::try_from(limit_bytes).unwrap_or(i64::MAX)),
        used_fraction,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ReconcileQuery {
    #[serde(default)]
    pub repair: bool,
}

#[derive(Serialize)]
pub struct ReconcileResponse {
    pub report: ReconcileReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<RepairSummary>,
}

/// `POST /reconcile?repair=true`: diff the caller's objects against their records.
pub async fn reconcile(
    State(state): State<AppState>,
    auth: Authenticated,
    Query(q): Query<ReconcileQuery>,
) -> Result<Json<ReconcileResponse>, AppError> {
    let report = state.reconciler.sweep(auth.session.principal).await?;
    let repair = if q.repair && !report.is_clean() {
        Some(state.reconciler.repair(&report).await)
    } else {
        None
    };
    Ok(Json(ReconcileResponse { report, repair }))
}

fn parse_file_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::bad_request(format!("invalid file id `{}`", raw)))
}

/// Apply common download headers.
fn set_file_headers(headers: &mut HeaderMap, record: &FileRecord) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = HeaderValue::from_str(&record.size_bytes.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", record.checksum)) {
        headers.insert(header::ETAG, value);
    }
    let disposition = format!(
        "attachment; filename=\"{}\"",
        record.name.replace(['"', '\\'], "_")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    let last_modified = record
        .created_at
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string();
    if let Ok(value) = HeaderValue::from_str(&last_modified) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
