use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{
    access::{self, EffectiveGrants, EffectivePermissions, GrantView, ROOT_FOLDER_ID},
    auth::Caller,
    documents::{self, CreatedUpload, DocumentView},
    error::{AppError, AppResult},
    models::{now_utc, to_iso, Folder, NewFolder, OperationalRole},
    permissions::{
        FOLDER_CREATE, FOLDER_DELETE, FOLDER_MOVE, FOLDER_READ, FOLDER_RENAME, FOLDER_RESTORE,
        GRANTS_MANAGE,
    },
    schema::folders,
    state::AppState,
};

const MAX_FOLDER_NAME_LENGTH: usize = 255;

#[derive(Deserialize)]
pub struct CreateFolderRequest {
    pub name: String,
    pub parent_id: Option<Uuid>,
}

#[derive(Deserialize)]
pub struct RenameFolderRequest {
    pub name: String,
}

#[derive(Deserialize)]
pub struct MoveFolderRequest {
    pub parent_id: Uuid,
}

#[derive(Deserialize)]
pub struct GrantInput {
    pub role: String,
    pub operational_role: String,
}

#[derive(Deserialize)]
pub struct ReplaceGrantsRequest {
    pub grants: Vec<GrantInput>,
}

#[derive(Deserialize)]
pub struct CreateDocumentRequest {
    pub filename: String,
    pub title: Option<String>,
}

#[derive(Serialize)]
pub struct FolderInfo {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Option<Uuid>,
    pub is_deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl From<Folder> for FolderInfo {
    fn from(folder: Folder) -> Self {
        Self {
            id: folder.id,
            name: folder.name,
            parent_id: folder.parent_id,
            is_deleted: folder.is_deleted,
            created_at: to_iso(folder.created_at),
            updated_at: to_iso(folder.updated_at),
        }
    }
}

#[derive(Serialize)]
pub struct FolderResponse {
    pub folder: FolderInfo,
}

#[derive(Serialize)]
pub struct FolderChildrenResponse {
    pub folder: FolderInfo,
    pub children: Vec<FolderInfo>,
}

#[derive(Serialize)]
pub struct GrantsResponse {
    pub folder_id: Uuid,
    pub grants: Vec<GrantView>,
}

#[derive(Serialize)]
pub struct MyAccessResponse {
    pub folder_id: Uuid,
    #[serde(flatten)]
    pub access: EffectivePermissions,
}

#[derive(Serialize)]
pub struct FolderDocumentsResponse {
    pub folder_id: Uuid,
    pub documents: Vec<DocumentView>,
}

fn validate_folder_name(raw: &str) -> AppResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("name is required"));
    }
    if name.chars().count() > MAX_FOLDER_NAME_LENGTH {
        return Err(AppError::bad_request("name is too long"));
    }
    Ok(name.to_string())
}

fn readable_folder(conn: &mut PgConnection, caller: &Caller, folder_id: Uuid) -> AppResult<Folder> {
    let folder = access::load_folder(conn, folder_id)?;
    access::require_permission(conn, folder_id, &caller.roles, FOLDER_READ)?;
    Ok(folder)
}

pub async fn get_root(
    State(state): State<AppState>,
    caller: Caller,
) -> AppResult<Json<FolderResponse>> {
    let folder = state
        .with_conn(move |conn| readable_folder(conn, &caller, ROOT_FOLDER_ID))
        .await?;
    Ok(Json(FolderResponse {
        folder: folder.into(),
    }))
}

pub async fn get_folder(
    State(state): State<AppState>,
    caller: Caller,
    Path(folder_id): Path<Uuid>,
) -> AppResult<Json<FolderResponse>> {
    let folder = state
        .with_conn(move |conn| readable_folder(conn, &caller, folder_id))
        .await?;
    Ok(Json(FolderResponse {
        folder: folder.into(),
    }))
}

pub async fn list_children(
    State(state): State<AppState>,
    caller: Caller,
    Path(folder_id): Path<Uuid>,
) -> AppResult<Json<FolderChildrenResponse>> {
    let (folder, children) = state
        .with_conn(move |conn| {
            let folder = readable_folder(conn, &caller, folder_id)?;
            let children: Vec<Folder> = folders::table
                .filter(folders::parent_id.eq(Some(folder_id)))
                .filter(folders::is_deleted.eq(false))
                .order(folders::name.asc())
                .load(conn)?;
            Ok((folder, children))
        })
        .await?;

    Ok(Json(FolderChildrenResponse {
        folder: folder.into(),
        children: children.into_iter().map(FolderInfo::from).collect(),
    }))
}

pub async fn create_folder(
    State(state): State<AppState>,
    caller: Caller,
    Json(payload): Json<CreateFolderRequest>,
) -> AppResult<(StatusCode, Json<FolderResponse>)> {
    let name = validate_folder_name(&payload.name)?;
    let parent_id = payload.parent_id.unwrap_or(ROOT_FOLDER_ID);

    let folder: Folder = state
        .with_conn(move |conn| {
            access::load_active_folder(conn, parent_id)?;
            access::require_permission(conn, parent_id, &caller.roles, FOLDER_CREATE)?;
            let folder = diesel::insert_into(folders::table)
                .values(&NewFolder {
                    id: Uuid::new_v4(),
                    name,
                    parent_id: Some(parent_id),
                })
                .get_result(conn)?;
            Ok(folder)
        })
        .await?;

    info!(folder_id = %folder.id, parent_id = %parent_id, "folder created");
    Ok((
        StatusCode::CREATED,
        Json(FolderResponse {
            folder: folder.into(),
        }),
    ))
}

pub async fn rename_folder(
    State(state): State<AppState>,
    caller: Caller,
    Path(folder_id): Path<Uuid>,
    Json(payload): Json<RenameFolderRequest>,
) -> AppResult<Json<FolderResponse>> {
    let name = validate_folder_name(&payload.name)?;

    let folder: Folder = state
        .with_conn(move |conn| {
            access::load_active_folder(conn, folder_id)?;
            access::require_permission(conn, folder_id, &caller.roles, FOLDER_RENAME)?;
            let folder = diesel::update(folders::table.find(folder_id))
                .set((folders::name.eq(name), folders::updated_at.eq(now_utc())))
                .get_result(conn)?;
            Ok(folder)
        })
        .await?;

    Ok(Json(FolderResponse {
        folder: folder.into(),
    }))
}

pub async fn move_folder(
    State(state): State<AppState>,
    caller: Caller,
    Path(folder_id): Path<Uuid>,
    Json(payload): Json<MoveFolderRequest>,
) -> AppResult<Json<FolderResponse>> {
    if folder_id == ROOT_FOLDER_ID {
        return Err(AppError::bad_request("Root folder cannot be moved"));
    }
    let target_id = payload.parent_id;

    let folder = state
        .with_conn(move |conn| {
            access::load_active_folder(conn, folder_id)?;
            access::load_active_folder(conn, target_id)?;
            access::require_permission(conn, folder_id, &caller.roles, FOLDER_MOVE)?;
            access::require_permission(conn, target_id, &caller.roles, FOLDER_CREATE)?;
            access::move_folder(conn, folder_id, target_id)
        })
        .await?;

    info!(folder_id = %folder_id, parent_id = %target_id, "folder moved");
    Ok(Json(FolderResponse {
        folder: folder.into(),
    }))
}

fn set_folder_deleted(
    conn: &mut PgConnection,
    caller: &Caller,
    folder_id: Uuid,
    deleted: bool,
) -> AppResult<Folder> {
    if folder_id == ROOT_FOLDER_ID && deleted {
        return Err(AppError::bad_request("Root folder cannot be deleted"));
    }
    let permission = if deleted { FOLDER_DELETE } else { FOLDER_RESTORE };

    access::load_folder(conn, folder_id)?;
    access::require_permission(conn, folder_id, &caller.roles, permission)?;

    let folder = diesel::update(folders::table.find(folder_id))
        .set((
            folders::is_deleted.eq(deleted),
            folders::updated_at.eq(now_utc()),
        ))
        .get_result(conn)?;
    Ok(folder)
}

pub async fn delete_folder(
    State(state): State<AppState>,
    caller: Caller,
    Path(folder_id): Path<Uuid>,
) -> AppResult<Json<FolderResponse>> {
    let folder = state
        .with_conn(move |conn| set_folder_deleted(conn, &caller, folder_id, true))
        .await?;
    info!(folder_id = %folder_id, "folder soft-deleted");
    Ok(Json(FolderResponse {
        folder: folder.into(),
    }))
}

pub async fn restore_folder(
    State(state): State<AppState>,
    caller: Caller,
    Path(folder_id): Path<Uuid>,
) -> AppResult<Json<FolderResponse>> {
    let folder = state
        .with_conn(move |conn| set_folder_deleted(conn, &caller, folder_id, false))
        .await?;
    info!(folder_id = %folder_id, "folder restored");
    Ok(Json(FolderResponse {
        folder: folder.into(),
    }))
}

pub async fn list_grants(
    State(state): State<AppState>,
    caller: Caller,
    Path(folder_id): Path<Uuid>,
) -> AppResult<Json<GrantsResponse>> {
    let grants = state
        .with_conn(move |conn| {
            access::load_folder(conn, folder_id)?;
            access::require_permission(conn, folder_id, &caller.roles, GRANTS_MANAGE)?;
            access::list_explicit_grants(conn, folder_id)
        })
        .await?;
    Ok(Json(GrantsResponse { folder_id, grants }))
}

pub async fn replace_grants(
    State(state): State<AppState>,
    caller: Caller,
    Path(folder_id): Path<Uuid>,
    Json(payload): Json<ReplaceGrantsRequest>,
) -> AppResult<Json<GrantsResponse>> {
    let mut requested = Vec::with_capacity(payload.grants.len());
    for grant in &payload.grants {
        let operational_role: OperationalRole = grant.operational_role.parse().map_err(|_| {
            AppError::bad_request(format!(
                "invalid operational role: {}",
                grant.operational_role
            ))
        })?;
        if grant.role.trim().is_empty() {
            return Err(AppError::bad_request("role is required"));
        }
        requested.push((grant.role.clone(), operational_role));
    }

    let grants = state
        .with_conn(move |conn| {
            access::load_folder(conn, folder_id)?;
            access::require_permission(conn, folder_id, &caller.roles, GRANTS_MANAGE)?;
            access::set_explicit_grants(conn, folder_id, &requested)
        })
        .await?;

    info!(folder_id = %folder_id, grants = grants.len(), "folder grants replaced");
    Ok(Json(GrantsResponse { folder_id, grants }))
}

pub async fn effective_grants(
    State(state): State<AppState>,
    caller: Caller,
    Path(folder_id): Path<Uuid>,
) -> AppResult<Json<EffectiveGrants>> {
    let grants = state
        .with_conn(move |conn| {
            readable_folder(conn, &caller, folder_id)?;
            access::effective_grants(conn, folder_id)
        })
        .await?;
    Ok(Json(grants))
}

pub async fn my_access(
    State(state): State<AppState>,
    caller: Caller,
    Path(folder_id): Path<Uuid>,
) -> AppResult<Json<MyAccessResponse>> {
    let access = state
        .with_conn(move |conn| {
            readable_folder(conn, &caller, folder_id)?;
            access::effective_permissions(conn, folder_id, &caller.roles)
        })
        .await?;
    Ok(Json(MyAccessResponse { folder_id, access }))
}

pub async fn list_documents(
    State(state): State<AppState>,
    caller: Caller,
    Path(folder_id): Path<Uuid>,
) -> AppResult<Json<FolderDocumentsResponse>> {
    let documents = documents::list_documents_in_folder(&state, &caller, folder_id).await?;
    Ok(Json(FolderDocumentsResponse {
        folder_id,
        documents,
    }))
}

pub async fn create_document(
    State(state): State<AppState>,
    caller: Caller,
    Path(folder_id): Path<Uuid>,
    Json(payload): Json<CreateDocumentRequest>,
) -> AppResult<(StatusCode, Json<CreatedUpload>)> {
    let created = documents::create_document(
        &state,
        &caller,
        folder_id,
        &payload.filename,
        payload.title.as_deref(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(created)))
}
