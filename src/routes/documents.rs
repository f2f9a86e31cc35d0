use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    auth::Caller,
    documents::{
        self, CommitOutcome, CreatedUpload, DocumentView, DownloadLink, OcrStatusView, PageList,
        RetryOutcome, VersionView,
    },
    error::AppResult,
    state::AppState,
};

#[derive(Deserialize)]
pub struct CreateVersionRequest {
    pub filename: String,
}

#[derive(Deserialize)]
pub struct PagesQuery {
    pub from: Option<i32>,
    pub to: Option<i32>,
}

#[derive(Serialize)]
pub struct DocumentResponse {
    pub document: DocumentView,
}

#[derive(Serialize)]
pub struct VersionListResponse {
    pub document: DocumentView,
    pub versions: Vec<VersionView>,
}

pub async fn get_document(
    State(state): State<AppState>,
    caller: Caller,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<DocumentResponse>> {
    let document = documents::get_document(&state, &caller, document_id).await?;
    Ok(Json(DocumentResponse { document }))
}

pub async fn delete_document(
    State(state): State<AppState>,
    caller: Caller,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<DocumentResponse>> {
    let document = documents::soft_delete(&state, &caller, document_id).await?;
    Ok(Json(DocumentResponse { document }))
}

pub async fn restore_document(
    State(state): State<AppState>,
    caller: Caller,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<DocumentResponse>> {
    let document = documents::restore(&state, &caller, document_id).await?;
    Ok(Json(DocumentResponse { document }))
}

pub async fn list_versions(
    State(state): State<AppState>,
    caller: Caller,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<VersionListResponse>> {
    let (document, versions) = documents::list_versions(&state, &caller, document_id).await?;
    Ok(Json(VersionListResponse { document, versions }))
}

pub async fn create_version(
    State(state): State<AppState>,
    caller: Caller,
    Path(document_id): Path<Uuid>,
    Json(payload): Json<CreateVersionRequest>,
) -> AppResult<(StatusCode, Json<CreatedUpload>)> {
    let created =
        documents::create_version(&state, &caller, document_id, &payload.filename).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn commit_version(
    State(state): State<AppState>,
    caller: Caller,
    Path(version_id): Path<Uuid>,
) -> AppResult<Json<CommitOutcome>> {
    Ok(Json(
        documents::commit_upload(&state, &caller, version_id).await?,
    ))
}

pub async fn ocr_status(
    State(state): State<AppState>,
    caller: Caller,
    Path(version_id): Path<Uuid>,
) -> AppResult<Json<OcrStatusView>> {
    Ok(Json(documents::ocr_status(&state, &caller, version_id).await?))
}

pub async fn retry_ocr(
    State(state): State<AppState>,
    caller: Caller,
    Path(version_id): Path<Uuid>,
) -> AppResult<(StatusCode, Json<RetryOutcome>)> {
    let outcome = documents::retry_ocr(&state, &caller, version_id).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

pub async fn list_pages(
    State(state): State<AppState>,
    caller: Caller,
    Path(version_id): Path<Uuid>,
    Query(query): Query<PagesQuery>,
) -> AppResult<Json<PageList>> {
    Ok(Json(
        documents::list_pages(&state, &caller, version_id, query.from, query.to).await?,
    ))
}

pub async fn download_version(
    State(state): State<AppState>,
    caller: Caller,
    Path(version_id): Path<Uuid>,
) -> AppResult<Json<DownloadLink>> {
    Ok(Json(
        documents::download_url(&state, &caller, version_id).await?,
    ))
}
