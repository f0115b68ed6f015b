use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use crate::api::error::AppError;
use crate::models::{
    ChunkAck, FileDeclaration, FileStatusView, FinalizeReport, LimitOverrides, MissingChunks,
    SessionCreated, SessionState, SessionStatusView,
};
use crate::services::chunk_store::ChunkUpload;

pub const TOTAL_CHUNKS_HEADER: &str = "x-total-chunks";
pub const CHUNK_CHECKSUM_HEADER: &str = "x-chunk-checksum";
pub const FILE_NAME_HEADER: &str = "x-file-name";
pub const CONTENT_TYPE_HEADER: &str = "x-content-type";
pub const FILE_SIZE_HEADER: &str = "x-file-size";
pub const FILE_HASH_HEADER: &str = "x-file-hash";

#[derive(Debug, Deserialize, Serialize, ToSchema, Validate)]
pub struct CreateSessionRequest {
    #[validate(length(min = 1, max = 255, message = "owner_id must be 1-255 characters"))]
    pub owner_id: String,
    #[validate(length(min = 1, max = 255, message = "collection_ref must be 1-255 characters"))]
    pub collection_ref: String,
    #[serde(default)]
    pub limits: LimitOverrides,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CancelResponse {
    pub session_id: Uuid,
    pub state: SessionState,
}

fn parse_session_id(raw: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::BadRequest("Invalid session ID".to_string()))
}

fn header<T: FromStr>(headers: &HeaderMap, name: &str) -> Result<Option<T>, AppError> {
    let Some(value) = headers.get(name) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .map(Some)
        .ok_or_else(|| AppError::BadRequest(format!("Invalid {} header", name)))
}

/// Optional per-chunk declaration headers; `None` when the client sent none.
fn declaration_from_headers(
    headers: &HeaderMap,
    total_chunks: u32,
) -> Result<Option<FileDeclaration>, AppError> {
    let declaration = FileDeclaration {
        name: header(headers, FILE_NAME_HEADER)?,
        mime_type: header(headers, CONTENT_TYPE_HEADER)?,
        total_size: header(headers, FILE_SIZE_HEADER)?,
        file_hash: header(headers, FILE_HASH_HEADER)?,
        ..Default::default()
    };
    if declaration.is_empty() {
        return Ok(None);
    }
    Ok(Some(FileDeclaration {
        total_chunks: Some(total_chunks),
        ..declaration
    }))
}

#[utoipa::path(
    post,
    path = "/sessions",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Session opened", body = SessionCreated),
        (status = 403, description = "Owner may not write to the collection"),
        (status = 503, description = "Blob store unavailable")
    ),
    tag = "sessions"
)]
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionCreated>), AppError> {
    req.validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let created = state
        .intake
        .create_session(&req.owner_id, &req.collection_ref, req.limits)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/sessions/{id}",
    params(("id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Session status", body = SessionStatusView),
        (status = 404, description = "Unknown session")
    ),
    tag = "sessions"
)]
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionStatusView>, AppError> {
    let session_id = parse_session_id(&id)?;
    Ok(Json(state.intake.session_status(session_id)?))
}

#[utoipa::path(
    post,
    path = "/sessions/{id}/finalize",
    params(("id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Per-file verdicts", body = FinalizeReport),
        (status = 409, description = "Session cancelled"),
        (status = 410, description = "Session expired")
    ),
    tag = "sessions"
)]
pub async fn finalize_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FinalizeReport>, AppError> {
    let session_id = parse_session_id(&id)?;
    Ok(Json(state.intake.finalize(session_id).await?))
}

#[utoipa::path(
    delete,
    path = "/sessions/{id}",
    params(("id" = String, Path, description = "Session ID")),
    responses(
        (status = 200, description = "Session cancelled", body = CancelResponse),
        (status = 409, description = "Session already finalized")
    ),
    tag = "sessions"
)]
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    let session_id = parse_session_id(&id)?;
    let cancelled = state.intake.cancel(session_id)?;
    Ok(Json(CancelResponse {
        session_id,
        state: cancelled,
    }))
}

#[utoipa::path(
    post,
    path = "/sessions/{id}/files/{file_id}",
    request_body = FileDeclaration,
    params(
        ("id" = String, Path, description = "Session ID"),
        ("file_id" = String, Path, description = "Client-chosen file ID")
    ),
    responses(
        (status = 200, description = "File declared", body = FileStatusView),
        (status = 413, description = "Session quota exceeded"),
        (status = 422, description = "Declaration fails validation")
    ),
    tag = "files"
)]
pub async fn declare_file(
    State(state): State<AppState>,
    Path((id, file_id)): Path<(String, String)>,
    Json(declaration): Json<FileDeclaration>,
) -> Result<Json<FileStatusView>, AppError> {
    let session_id = parse_session_id(&id)?;
    let view = state
        .intake
        .declare_file(session_id, &file_id, declaration)
        .await?;
    Ok(Json(view))
}

#[utoipa::path(
    get,
    path = "/sessions/{id}/files/{file_id}",
    params(
        ("id" = String, Path, description = "Session ID"),
        ("file_id" = String, Path, description = "Client-chosen file ID")
    ),
    responses(
        (status = 200, description = "File status", body = FileStatusView),
        (status = 404, description = "Unknown session or file")
    ),
    tag = "files"
)]
pub async fn get_file(
    State(state): State<AppState>,
    Path((id, file_id)): Path<(String, String)>,
) -> Result<Json<FileStatusView>, AppError> {
    let session_id = parse_session_id(&id)?;
    Ok(Json(state.intake.file_status(session_id, &file_id)?))
}

#[utoipa::path(
    get,
    path = "/sessions/{id}/files/{file_id}/missing",
    params(
        ("id" = String, Path, description = "Session ID"),
        ("file_id" = String, Path, description = "Client-chosen file ID")
    ),
    responses(
        (status = 200, description = "Chunk indices still to send", body = MissingChunks),
        (status = 404, description = "Unknown session or file")
    ),
    tag = "files"
)]
pub async fn list_missing(
    State(state): State<AppState>,
    Path((id, file_id)): Path<(String, String)>,
) -> Result<Json<MissingChunks>, AppError> {
    let session_id = parse_session_id(&id)?;
    Ok(Json(state.intake.list_missing(session_id, &file_id)?))
}

#[utoipa::path(
    put,
    path = "/sessions/{id}/files/{file_id}/chunks/{index}",
    request_body(content = Vec<u8>, description = "Chunk payload", content_type = "application/octet-stream"),
    params(
        ("id" = String, Path, description = "Session ID"),
        ("file_id" = String, Path, description = "Client-chosen file ID"),
        ("index" = u32, Path, description = "Chunk index (0-based)"),
        ("x-total-chunks" = u32, Header, description = "Total chunk count of the file"),
        ("x-chunk-checksum" = String, Header, description = "Hex SHA-256 of the payload")
    ),
    responses(
        (status = 200, description = "Chunk stored (or already stored)", body = ChunkAck),
        (status = 400, description = "Index or chunk count out of range"),
        (status = 409, description = "Checksum mismatch or file closed"),
        (status = 410, description = "Session expired"),
        (status = 413, description = "Session quota exceeded")
    ),
    tag = "files"
)]
pub async fn put_chunk(
    State(state): State<AppState>,
    Path((id, file_id, index)): Path<(String, String, u32)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ChunkAck>, AppError> {
    let session_id = parse_session_id(&id)?;
    let total_chunks: u32 = header(&headers, TOTAL_CHUNKS_HEADER)?.ok_or_else(|| {
        AppError::BadRequest(format!("Missing {} header", TOTAL_CHUNKS_HEADER))
    })?;
    let checksum: String = header(&headers, CHUNK_CHECKSUM_HEADER)?.ok_or_else(|| {
        AppError::BadRequest(format!("Missing {} header", CHUNK_CHECKSUM_HEADER))
    })?;
    let declaration = declaration_from_headers(&headers, total_chunks)?;

    let ack = state
        .intake
        .put_chunk(ChunkUpload {
            session_id,
            file_id,
            index,
            total_chunks,
            checksum,
            payload: body,
            declaration,
        })
        .await?;
    Ok(Json(ack))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_declaration_headers() {
        let mut headers = HeaderMap::new();
        assert!(declaration_from_headers(&headers, 3).unwrap().is_none());

        headers.insert(FILE_NAME_HEADER, HeaderValue::from_static("page-001.png"));
        headers.insert(FILE_SIZE_HEADER, HeaderValue::from_static("2048"));
        let decl = declaration_from_headers(&headers, 3).unwrap().unwrap();
        assert_eq!(decl.name.as_deref(), Some("page-001.png"));
        assert_eq!(decl.total_size, Some(2048));
        assert_eq!(decl.total_chunks, Some(3));
        assert!(decl.mime_type.is_none());

        headers.insert(FILE_SIZE_HEADER, HeaderValue::from_static("lots"));
        assert!(declaration_from_headers(&headers, 3).is_err());
    }
}
