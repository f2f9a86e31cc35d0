//! Document and version records, the upload lifecycle and the commit gate
//! that admits a version into the OCR pipeline.

use chrono::NaiveDateTime;
use diesel::dsl::max;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    access,
    auth::Caller,
    error::{AppError, AppResult},
    events::EventBusResult,
    models::{
        now_utc, to_iso, Document, DocumentPage, DocumentVersion, NewDocument, NewDocumentVersion,
        OcrStatus, UploadStatus,
    },
    permissions::{DOC_DELETE, DOC_READ, DOC_RESTORE, DOC_UPLOAD},
    schema::{document_version_pages, document_versions, documents},
    state::AppState,
    storage::PresignedUpload,
};

pub const DEFAULT_CONTENT_TYPE: &str = "application/pdf";
pub const FOLDER_LISTING_LIMIT: i64 = 200;
const MAX_FILENAME_LENGTH: usize = 255;

/// Payload of the version-created topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionEvent {
    pub version_id: Uuid,
    pub document_id: Uuid,
    pub folder_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct DocumentView {
    pub id: Uuid,
    pub folder_id: Uuid,
    pub title: Option<String>,
    pub latest_version_id: Option<Uuid>,
    pub is_deleted: bool,
    pub created_by: Option<Uuid>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Document> for DocumentView {
    fn from(document: Document) -> Self {
        Self {
            id: document.id,
            folder_id: document.folder_id,
            title: document.title,
            latest_version_id: document.latest_version_id,
            is_deleted: document.is_deleted,
            created_by: document.created_by,
            created_at: to_iso(document.created_at),
            updated_at: to_iso(document.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VersionView {
    pub id: Uuid,
    pub document_id: Uuid,
    pub version_number: i32,
    pub original_filename: String,
    pub storage_bucket: String,
    pub storage_key: String,
    pub content_type: String,
    pub size_bytes: Option<i64>,
    pub upload_status: String,
    pub uploaded_at: Option<String>,
    pub uploader_id: Option<Uuid>,
    pub page_count: Option<i32>,
    pub ocr_status: String,
    pub ocr_attempts: i32,
    pub ocr_error: Option<String>,
    pub created_at: String,
}

impl From<DocumentVersion> for VersionView {
    fn from(version: DocumentVersion) -> Self {
        Self {
            id: version.id,
            document_id: version.document_id,
            version_number: version.version_number,
            original_filename: version.original_filename,
            storage_bucket: version.storage_bucket,
            storage_key: version.storage_key,
            content_type: version.content_type,
            size_bytes: version.size_bytes,
            upload_status: version.upload_status,
            uploaded_at: version.uploaded_at.map(to_iso),
            uploader_id: version.uploader_id,
            page_count: version.page_count,
            ocr_status: version.ocr_status,
            ocr_attempts: version.ocr_attempts,
            ocr_error: version.ocr_error,
            created_at: to_iso(version.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UploadTicket {
    pub bucket: String,
    pub key: String,
    #[serde(flatten)]
    pub presigned: PresignedUpload,
}

#[derive(Debug, Serialize)]
pub struct CreatedUpload {
    pub document: DocumentView,
    pub version: VersionView,
    pub upload: UploadTicket,
}

#[derive(Debug, Serialize)]
pub struct CommitOutcome {
    pub document_id: Uuid,
    pub latest_version_id: Option<Uuid>,
    pub version_id: Uuid,
    pub version_number: i32,
    pub upload_status: String,
    pub size_bytes: Option<i64>,
    pub ocr_status: String,
    pub already_committed: bool,
    pub ocr_enqueued: bool,
    pub ocr_enqueue_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct OcrStatusView {
    pub version_id: Uuid,
    pub document_id: Uuid,
    pub folder_id: Uuid,
    pub upload_status: String,
    pub page_count: Option<i32>,
    pub ocr_status: String,
    pub ocr_attempts: i32,
    pub ocr_started_at: Option<String>,
    pub ocr_completed_at: Option<String>,
    pub ocr_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PageView {
    pub page_number: i32,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct PageList {
    pub version_id: Uuid,
    pub from: Option<i32>,
    pub to: Option<i32>,
    pub pages: Vec<PageView>,
}

#[derive(Debug, Serialize)]
pub struct RetryOutcome {
    pub version_id: Uuid,
    pub ocr_status: String,
    pub enqueued: bool,
}

#[derive(Debug, Serialize)]
pub struct DownloadLink {
    pub version_id: Uuid,
    pub url: String,
    pub expires_in_seconds: u64,
}

/// Replaces every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

pub fn object_key(document_id: Uuid, version_number: i32, version_id: Uuid, filename: &str) -> String {
    format!(
        "documents/{document_id}/v{version_number}/{version_id}-{}",
        sanitize_filename(filename)
    )
}

fn validate_filename(raw: &str) -> AppResult<String> {
    let filename = raw.trim();
    if filename.is_empty() {
        return Err(AppError::bad_request("filename is required"));
    }
    if filename.chars().count() > MAX_FILENAME_LENGTH {
        return Err(AppError::bad_request("filename is too long"));
    }
    Ok(filename.to_string())
}

pub fn load_document(conn: &mut PgConnection, document_id: Uuid) -> AppResult<Document> {
    documents::table
        .find(document_id)
        .first(conn)
        .optional()?
        .ok_or_else(|| AppError::not_found_msg("Document not found"))
}

pub fn load_version(conn: &mut PgConnection, version_id: Uuid) -> AppResult<DocumentVersion> {
    document_versions::table
        .find(version_id)
        .first(conn)
        .optional()?
        .ok_or_else(|| AppError::not_found_msg("Version not found"))
}

fn ensure_not_deleted(document: &Document) -> AppResult<()> {
    if document.is_deleted {
        return Err(AppError::bad_request("Document is deleted"));
    }
    Ok(())
}

/// Loads a live document and checks `permission` on its folder.
fn authorize_document(
    conn: &mut PgConnection,
    caller: &Caller,
    document_id: Uuid,
    permission: &str,
) -> AppResult<Document> {
    let document = load_document(conn, document_id)?;
    ensure_not_deleted(&document)?;
    access::require_permission(conn, document.folder_id, &caller.roles, permission)?;
    Ok(document)
}

fn authorize_version(
    conn: &mut PgConnection,
    caller: &Caller,
    version_id: Uuid,
    permission: &str,
) -> AppResult<(DocumentVersion, Document)> {
    let version = load_version(conn, version_id)?;
    let document = authorize_document(conn, caller, version.document_id, permission)?;
    Ok((version, document))
}

fn new_version_row(
    caller: &Caller,
    document_id: Uuid,
    version_id: Uuid,
    version_number: i32,
    filename: &str,
    bucket: &str,
) -> NewDocumentVersion {
    NewDocumentVersion {
        id: version_id,
        document_id,
        version_number,
        original_filename: filename.to_string(),
        storage_bucket: bucket.to_string(),
        storage_key: object_key(document_id, version_number, version_id, filename),
        content_type: DEFAULT_CONTENT_TYPE.to_string(),
        upload_status: UploadStatus::PendingUpload.as_str().to_string(),
        uploader_id: Some(caller.user_id),
        ocr_status: OcrStatus::NotStarted.as_str().to_string(),
        ocr_attempts: 0,
    }
}

async fn upload_ticket(state: &AppState, key: &str) -> AppResult<UploadTicket> {
    let presigned = state
        .storage
        .presign_put_object(key, DEFAULT_CONTENT_TYPE, state.config.presign_expiry())
        .await
        .map_err(|err| AppError::service_unavailable(format!("object storage unavailable: {err:#}")))?;
    Ok(UploadTicket {
        bucket: state.storage.bucket().to_string(),
        key: key.to_string(),
        presigned,
    })
}

pub async fn create_document(
    state: &AppState,
    caller: &Caller,
    folder_id: Uuid,
    filename: &str,
    title: Option<&str>,
) -> AppResult<CreatedUpload> {
    let filename = validate_filename(filename)?;
    let title = title
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .map(str::to_string);

    let check_caller = caller.clone();
    state
        .with_conn(move |conn| {
            access::load_active_folder(conn, folder_id)?;
            access::require_permission(conn, folder_id, &check_caller.roles, DOC_UPLOAD)
        })
        .await?;

    let document_id = Uuid::new_v4();
    let version_id = Uuid::new_v4();
    let new_version = new_version_row(
        caller,
        document_id,
        version_id,
        1,
        &filename,
        state.storage.bucket(),
    );
    let upload = upload_ticket(state, &new_version.storage_key).await?;

    let new_document = NewDocument {
        id: document_id,
        folder_id,
        title,
        created_by: Some(caller.user_id),
    };
    let (document, version) = state
        .with_conn(move |conn| {
            conn.transaction::<_, AppError, _>(|conn| {
                let document: Document = diesel::insert_into(documents::table)
                    .values(&new_document)
                    .get_result(conn)?;
                let version: DocumentVersion = diesel::insert_into(document_versions::table)
                    .values(&new_version)
                    .get_result(conn)?;
                Ok((document, version))
            })
        })
        .await?;

    info!(document_id = %document.id, version_id = %version.id, folder_id = %folder_id, "document created");

    Ok(CreatedUpload {
        document: document.into(),
        version: version.into(),
        upload,
    })
}

pub async fn create_version(
    state: &AppState,
    caller: &Caller,
    document_id: Uuid,
    filename: &str,
) -> AppResult<CreatedUpload> {
    let filename = validate_filename(filename)?;

    let check_caller = caller.clone();
    let (document, next_number) = state
        .with_conn(move |conn| {
            let document = authorize_document(conn, &check_caller, document_id, DOC_UPLOAD)?;
            let current: Option<i32> = document_versions::table
                .filter(document_versions::document_id.eq(document_id))
                .select(max(document_versions::version_number))
                .first(conn)?;
            Ok((document, current.unwrap_or(0) + 1))
        })
        .await?;

    let version_id = Uuid::new_v4();
    let new_version = new_version_row(
        caller,
        document.id,
        version_id,
        next_number,
        &filename,
        state.storage.bucket(),
    );
    let upload = upload_ticket(state, &new_version.storage_key).await?;

    let version = state
        .with_conn(move |conn| {
            diesel::insert_into(document_versions::table)
                .values(&new_version)
                .get_result::<DocumentVersion>(conn)
                .map_err(|err| match AppError::from(err) {
                    conflict if conflict.status() == axum::http::StatusCode::CONFLICT => {
                        AppError::conflict(format!(
                            "version {next_number} was created concurrently; retry"
                        ))
                    }
                    other => other,
                })
        })
        .await?;

    info!(document_id = %document.id, version_id = %version.id, version_number = version.version_number, "document version created");

    Ok(CreatedUpload {
        document: document.into(),
        version: version.into(),
        upload,
    })
}

fn commit_outcome(
    version: &DocumentVersion,
    document: &Document,
    already_committed: bool,
    enqueue_error: Option<String>,
) -> CommitOutcome {
    CommitOutcome {
        document_id: document.id,
        latest_version_id: document.latest_version_id,
        version_id: version.id,
        version_number: version.version_number,
        upload_status: version.upload_status.clone(),
        size_bytes: version.size_bytes,
        ocr_status: version.ocr_status.clone(),
        already_committed,
        ocr_enqueued: !already_committed && enqueue_error.is_none(),
        ocr_enqueue_error: enqueue_error,
    }
}

enum CommitTransition {
    Committed(DocumentVersion, Document),
    AlreadyCommitted(DocumentVersion, Document),
}

/// Marks `version_id` uploaded if it is still pending and points the document
/// at it. Losing a race against a concurrent commit yields `AlreadyCommitted`.
fn apply_commit(
    conn: &mut PgConnection,
    version_id: Uuid,
    size_bytes: i64,
    content_type: Option<String>,
) -> AppResult<CommitTransition> {
    conn.transaction(|conn| {
        let now = now_utc();
        let current = load_version(conn, version_id)?;
        let updated = diesel::update(
            document_versions::table
                .filter(document_versions::id.eq(version_id))
                .filter(document_versions::upload_status.eq(UploadStatus::PendingUpload.as_str())),
        )
        .set((
            document_versions::upload_status.eq(UploadStatus::Uploaded.as_str()),
            document_versions::uploaded_at.eq(Some(now)),
            document_versions::size_bytes.eq(Some(size_bytes)),
            document_versions::content_type.eq(content_type.unwrap_or(current.content_type)),
            document_versions::ocr_status.eq(OcrStatus::Pending.as_str()),
            document_versions::ocr_error.eq::<Option<String>>(None),
            document_versions::ocr_started_at.eq::<Option<NaiveDateTime>>(None),
            document_versions::ocr_completed_at.eq::<Option<NaiveDateTime>>(None),
            document_versions::updated_at.eq(now),
        ))
        .execute(conn)?;

        let version = load_version(conn, version_id)?;
        if updated == 0 {
            let document = load_document(conn, version.document_id)?;
            return Ok(CommitTransition::AlreadyCommitted(version, document));
        }

        let document: Document = diesel::update(documents::table.find(version.document_id))
            .set((
                documents::latest_version_id.eq(Some(version.id)),
                documents::updated_at.eq(now),
            ))
            .get_result(conn)?;
        Ok(CommitTransition::Committed(version, document))
    })
}

pub fn reset_ocr_to_pending(conn: &mut PgConnection, version_id: Uuid) -> AppResult<DocumentVersion> {
    let version = diesel::update(document_versions::table.find(version_id))
        .set((
            document_versions::ocr_status.eq(OcrStatus::Pending.as_str()),
            document_versions::ocr_error.eq::<Option<String>>(None),
            document_versions::ocr_started_at.eq::<Option<NaiveDateTime>>(None),
            document_versions::ocr_completed_at.eq::<Option<NaiveDateTime>>(None),
            document_versions::updated_at.eq(now_utc()),
        ))
        .get_result(conn)?;
    Ok(version)
}

pub fn record_enqueue_failure(
    conn: &mut PgConnection,
    version_id: Uuid,
    message: &str,
) -> AppResult<DocumentVersion> {
    let version = diesel::update(document_versions::table.find(version_id))
        .set((
            document_versions::ocr_status.eq(OcrStatus::Failed.as_str()),
            document_versions::ocr_error.eq(Some(format!("enqueue_failed: {message}"))),
            document_versions::updated_at.eq(now_utc()),
        ))
        .get_result(conn)?;
    Ok(version)
}

pub async fn publish_version_created(state: &AppState, event: &VersionEvent) -> EventBusResult<Uuid> {
    let payload = serde_json::to_value(event)
        .map_err(|err| crate::events::EventBusError::Unavailable(err.to_string()))?;
    state
        .events
        .publish(
            &state.config.topics.version_created,
            Some(&event.version_id.to_string()),
            payload,
        )
        .await
}

pub async fn commit_upload(
    state: &AppState,
    caller: &Caller,
    version_id: Uuid,
) -> AppResult<CommitOutcome> {
    let check_caller = caller.clone();
    let (version, document) = state
        .with_conn(move |conn| authorize_version(conn, &check_caller, version_id, DOC_UPLOAD))
        .await?;

    if version.is_uploaded() {
        return Ok(commit_outcome(&version, &document, true, None));
    }

    let head = state
        .storage
        .head_object(&version.storage_key)
        .await
        .map_err(|err| AppError::service_unavailable(format!("object storage unavailable: {err:#}")))?;
    let Some(head) = head.filter(|head| head.content_length.unwrap_or(0) > 0) else {
        return Err(AppError::bad_request("Uploaded object not found"));
    };
    let size_bytes = head.content_length.unwrap_or(0);

    let transition = state
        .with_conn(move |conn| apply_commit(conn, version_id, size_bytes, head.content_type))
        .await?;
    let (version, document) = match transition {
        CommitTransition::AlreadyCommitted(version, document) => {
            return Ok(commit_outcome(&version, &document, true, None));
        }
        CommitTransition::Committed(version, document) => (version, document),
    };

    let event = VersionEvent {
        version_id: version.id,
        document_id: document.id,
        folder_id: document.folder_id,
    };
    match publish_version_created(state, &event).await {
        Ok(event_id) => {
            info!(version_id = %version.id, document_id = %document.id, event_id = %event_id, "upload committed");
            Ok(commit_outcome(&version, &document, false, None))
        }
        Err(err) => {
            let message = err.to_string();
            warn!(version_id = %version.id, error = %message, "failed to enqueue OCR after commit");
            let failed = state
                .with_conn(move |conn| record_enqueue_failure(conn, version_id, &message))
                .await?;
            Ok(commit_outcome(&failed, &document, false, Some(err.to_string())))
        }
    }
}

pub async fn retry_ocr(state: &AppState, caller: &Caller, version_id: Uuid) -> AppResult<RetryOutcome> {
    let check_caller = caller.clone();
    let (version, document) = state
        .with_conn(move |conn| {
            let (version, document) = authorize_version(conn, &check_caller, version_id, DOC_UPLOAD)?;
            if !version.is_uploaded() {
                return Err(AppError::bad_request("Version not uploaded"));
            }
            let version = reset_ocr_to_pending(conn, version.id)?;
            Ok((version, document))
        })
        .await?;

    let event = VersionEvent {
        version_id: version.id,
        document_id: document.id,
        folder_id: document.folder_id,
    };
    if let Err(err) = publish_version_created(state, &event).await {
        let message = err.to_string();
        warn!(version_id = %version.id, error = %message, "failed to enqueue OCR retry");
        state
            .with_conn(move |conn| record_enqueue_failure(conn, version_id, &message))
            .await?;
        return Err(AppError::service_unavailable(format!("failed to enqueue OCR: {err}")));
    }

    info!(version_id = %version.id, document_id = %document.id, "OCR retry enqueued");
    Ok(RetryOutcome {
        version_id: version.id,
        ocr_status: version.ocr_status,
        enqueued: true,
    })
}

pub async fn get_document(state: &AppState, caller: &Caller, document_id: Uuid) -> AppResult<DocumentView> {
    let caller = caller.clone();
    state
        .with_conn(move |conn| authorize_document(conn, &caller, document_id, DOC_READ))
        .await
        .map(DocumentView::from)
}

pub async fn list_versions(
    state: &AppState,
    caller: &Caller,
    document_id: Uuid,
) -> AppResult<(DocumentView, Vec<VersionView>)> {
    let caller = caller.clone();
    state
        .with_conn(move |conn| {
            let document = authorize_document(conn, &caller, document_id, DOC_READ)?;
            let versions: Vec<DocumentVersion> = document_versions::table
                .filter(document_versions::document_id.eq(document_id))
                .order(document_versions::version_number.desc())
                .load(conn)?;
            Ok((
                document.into(),
                versions.into_iter().map(VersionView::from).collect(),
            ))
        })
        .await
}

pub async fn list_documents_in_folder(
    state: &AppState,
    caller: &Caller,
    folder_id: Uuid,
) -> AppResult<Vec<DocumentView>> {
    let caller = caller.clone();
    state
        .with_conn(move |conn| {
            access::load_folder(conn, folder_id)?;
            access::require_permission(conn, folder_id, &caller.roles, DOC_READ)?;
            let rows: Vec<Document> = documents::table
                .filter(documents::folder_id.eq(folder_id))
                .order(documents::created_at.desc())
                .limit(FOLDER_LISTING_LIMIT)
                .load(conn)?;
            Ok(rows.into_iter().map(DocumentView::from).collect())
        })
        .await
}

pub async fn ocr_status(state: &AppState, caller: &Caller, version_id: Uuid) -> AppResult<OcrStatusView> {
    let caller = caller.clone();
    let (version, document) = state
        .with_conn(move |conn| authorize_version(conn, &caller, version_id, DOC_READ))
        .await?;
    Ok(OcrStatusView {
        version_id: version.id,
        document_id: document.id,
        folder_id: document.folder_id,
        upload_status: version.upload_status,
        page_count: version.page_count,
        ocr_status: version.ocr_status,
        ocr_attempts: version.ocr_attempts,
        ocr_started_at: version.ocr_started_at.map(to_iso),
        ocr_completed_at: version.ocr_completed_at.map(to_iso),
        ocr_error: version.ocr_error,
    })
}

/// Resolves an optional page range. A lone `from` selects that single page; a
/// lone `to` starts at page 1.
pub fn page_range(from: Option<i32>, to: Option<i32>) -> AppResult<Option<(i32, i32)>> {
    if from.is_none() && to.is_none() {
        return Ok(None);
    }
    let start = from.unwrap_or(1);
    let end = to.unwrap_or(start);
    if start <= 0 || end <= 0 {
        return Err(AppError::bad_request("from/to must be positive"));
    }
    if end < start {
        return Err(AppError::bad_request("to must be >= from"));
    }
    Ok(Some((start, end)))
}

pub async fn list_pages(
    state: &AppState,
    caller: &Caller,
    version_id: Uuid,
    from: Option<i32>,
    to: Option<i32>,
) -> AppResult<PageList> {
    let range = page_range(from, to)?;
    let caller = caller.clone();
    state
        .with_conn(move |conn| {
            authorize_version(conn, &caller, version_id, DOC_READ)?;
            let mut query = document_version_pages::table
                .filter(document_version_pages::version_id.eq(version_id))
                .order(document_version_pages::page_number.asc())
                .into_boxed();
            if let Some((start, end)) = range {
                query = query.filter(document_version_pages::page_number.between(start, end));
            }
            let pages: Vec<DocumentPage> = query.load(conn)?;
            Ok(PageList {
                version_id,
                from: range.map(|(start, _)| start),
                to: range.map(|(_, end)| end),
                pages: pages
                    .into_iter()
                    .map(|page| PageView {
                        page_number: page.page_number,
                        text: page.text,
                    })
                    .collect(),
            })
        })
        .await
}

pub async fn download_url(state: &AppState, caller: &Caller, version_id: Uuid) -> AppResult<DownloadLink> {
    let caller = caller.clone();
    let (version, _) = state
        .with_conn(move |conn| authorize_version(conn, &caller, version_id, DOC_READ))
        .await?;
    if !version.is_uploaded() {
        return Err(AppError::bad_request("Version not uploaded"));
    }

    let expires_in = state.config.presign_expiry();
    let url = state
        .storage
        .presign_get_object(&version.storage_key, Some(&version.original_filename), expires_in)
        .await
        .map_err(|err| AppError::service_unavailable(format!("object storage unavailable: {err:#}")))?;
    Ok(DownloadLink {
        version_id,
        url,
        expires_in_seconds: expires_in.as_secs(),
    })
}

fn set_document_deleted(
    conn: &mut PgConnection,
    caller: &Caller,
    document_id: Uuid,
    deleted: bool,
) -> AppResult<Document> {
    let document = load_document(conn, document_id)?;
    let permission = if deleted { DOC_DELETE } else { DOC_RESTORE };
    access::require_permission(conn, document.folder_id, &caller.roles, permission)?;
    let document = diesel::update(documents::table.find(document_id))
        .set((
            documents::is_deleted.eq(deleted),
            documents::updated_at.eq(now_utc()),
        ))
        .get_result(conn)?;
    Ok(document)
}

pub async fn soft_delete(state: &AppState, caller: &Caller, document_id: Uuid) -> AppResult<DocumentView> {
    let caller = caller.clone();
    let document = state
        .with_conn(move |conn| set_document_deleted(conn, &caller, document_id, true))
        .await?;
    info!(document_id = %document.id, "document soft-deleted");
    Ok(document.into())
}

pub async fn restore(state: &AppState, caller: &Caller, document_id: Uuid) -> AppResult<DocumentView> {
    let caller = caller.clone();
    let document = state
        .with_conn(move |conn| set_document_deleted(conn, &caller, document_id, false))
        .await?;
    info!(document_id = %document.id, "document restored");
    Ok(document.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_everything_outside_safe_set() {
        assert_eq!(sanitize_filename("Q3 report (final).pdf"), "Q3_report__final_.pdf");
        assert_eq!(sanitize_filename("ümlaut-ok_1.pdf"), "_mlaut-ok_1.pdf");
    }

    #[test]
    fn object_keys_are_deterministic() {
        let document_id = Uuid::from_u128(1);
        let version_id = Uuid::from_u128(2);
        assert_eq!(
            object_key(document_id, 3, version_id, "a b.pdf"),
            format!("documents/{document_id}/v3/{version_id}-a_b.pdf")
        );
    }

    #[test]
    fn page_range_defaults_and_validation() {
        assert_eq!(page_range(None, None).expect("range"), None);
        assert_eq!(page_range(Some(2), None).expect("range"), Some((2, 2)));
        assert_eq!(page_range(None, Some(4)).expect("range"), Some((1, 4)));
        assert!(page_range(Some(0), Some(3)).is_err());
        assert!(page_range(Some(5), Some(3)).is_err());
    }

    #[test]
    fn version_event_uses_camel_case_keys() {
        let event = VersionEvent {
            version_id: Uuid::from_u128(1),
            document_id: Uuid::from_u128(2),
            folder_id: Uuid::from_u128(3),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert!(value.get("versionId").is_some());
        assert!(value.get("documentId").is_some());
        assert!(value.get("folderId").is_some());
    }

    #[test]
    fn rejects_blank_filenames() {
        assert!(validate_filename("   ").is_err());
        assert_eq!(validate_filename(" scan.pdf ").expect("filename"), "scan.pdf");
    }
}
