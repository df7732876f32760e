//! HTTP handlers for upload sessions under `/api/files`.
//!
//! Every handler authenticates the caller through [`CallerId`] and delegates
//! to `UploadService`; session errors map to HTTP statuses in `AppError`.

use crate::{
    auth::CallerId,
    errors::AppError,
    models::capability::UploadCapability,
    services::upload_service::{
        AbortedUpload, AckChunkRequest, ChunkAck, CompletedUpload, CreateSessionRequest,
        CreatedSession, DownloadGrant, FinalizeArgs, SessionError, SessionSnapshot,
    },
    state::AppState,
};
use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use uuid::Uuid;

/// Unparseable ids cannot name a session.
fn session_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| SessionError::NotFound.into())
}

/// `POST /api/files/init-upload`
pub async fn init_upload(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreatedSession>), AppError> {
    let created = state.uploads.create_session(request, &caller).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `POST /api/files/{id}/ack-chunk`
pub async fn ack_chunk(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
    Path(id): Path<String>,
    Json(request): Json<AckChunkRequest>,
) -> Result<Json<ChunkAck>, AppError> {
    let ack = state
        .uploads
        .acknowledge_chunk(session_id(&id)?, request, &caller)
        .await?;
    Ok(Json(ack))
}

/// `GET /api/files/{id}/status`
pub async fn upload_status(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
    Path(id): Path<String>,
) -> Result<Json<SessionSnapshot>, AppError> {
    let snapshot = state.uploads.get_status(session_id(&id)?, &caller).await?;
    Ok(Json(snapshot))
}

/// `POST /api/files/{id}/complete-upload`
///
/// The body is optional. When present it may carry `multipartId` (or
/// `uploadId`) and `parts` for tokens the acknowledgments did not include.
pub async fn complete_upload(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<CompletedUpload>, AppError> {
    let args = if body.iter().all(u8::is_ascii_whitespace) {
        FinalizeArgs::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| AppError::bad_request(format!("invalid request body: {err}")))?
    };
    let done = state
        .uploads
        .complete_upload(session_id(&id)?, &caller, args)
        .await?;
    Ok(Json(done))
}

/// `POST /api/files/{id}/abort`
pub async fn abort_upload(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
    Path(id): Path<String>,
) -> Result<Json<AbortedUpload>, AppError> {
    let aborted = state.uploads.abort_upload(session_id(&id)?, &caller).await?;
    Ok(Json(aborted))
}

/// `POST /api/files/{id}/chunks/{index}/refresh`
pub async fn refresh_chunk_url(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
    Path((id, index)): Path<(String, i64)>,
) -> Result<Json<UploadCapability>, AppError> {
    let capability = state
        .uploads
        .refresh_capability(session_id(&id)?, index, &caller)
        .await?;
    Ok(Json(capability))
}

/// `GET /api/files/{id}/download-urls`
pub async fn download_urls(
    State(state): State<AppState>,
    CallerId(caller): CallerId,
    Path(id): Path<String>,
) -> Result<Json<DownloadGrant>, AppError> {
    let grant = state
        .uploads
        .get_download_capabilities(session_id(&id)?, &caller)
        .await?;
    Ok(Json(grant))
}
