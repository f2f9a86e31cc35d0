use std::collections::BTreeSet;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
};
use diesel::{pg::PgConnection, prelude::*};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{
    auth::Caller,
    error::{AppError, AppResult},
    models::{
        to_iso, NewOperationalRolePermission, NewPermission, NewRole, NewRolePermission,
        OperationalRole, Permission, Role,
    },
    permissions::{normalize_name, require_global, PERMISSIONS_MANAGE, ROLES_MANAGE},
    schema::{operational_role_permissions, permissions, role_permissions, roles},
    state::AppState,
};

#[derive(Deserialize)]
pub struct CreateRoleRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct CreatePermissionRequest {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct ReplacePermissionsRequest {
    pub permissions: Vec<String>,
}

#[derive(Serialize)]
pub struct RoleInfo {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
}

impl From<Role> for RoleInfo {
    fn from(role: Role) -> Self {
        Self {
            id: role.id,
            name: role.name,
            description: role.description,
            created_at: to_iso(role.created_at),
        }
    }
}

#[derive(Serialize)]
pub struct PermissionInfo {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub created_at: String,
}

impl From<Permission> for PermissionInfo {
    fn from(permission: Permission) -> Self {
        Self {
            id: permission.id,
            name: permission.name,
            description: permission.description,
            created_at: to_iso(permission.created_at),
        }
    }
}

#[derive(Serialize)]
pub struct RolePermissionsResponse {
    pub role: RoleInfo,
    pub operational_role: Option<OperationalRole>,
    pub permissions: Vec<String>,
}

fn required_name(raw: &str) -> AppResult<String> {
    let name = normalize_name(raw);
    if name.is_empty() {
        return Err(AppError::bad_request("name is required"));
    }
    Ok(name)
}

fn clean_description(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn load_role(conn: &mut PgConnection, role_id: Uuid) -> AppResult<Role> {
    roles::table
        .find(role_id)
        .first(conn)
        .optional()?
        .ok_or_else(|| AppError::not_found_msg("Role not found"))
}

/// Resolves permission names to ids. Unknown names are reported together.
fn resolve_permissions(
    conn: &mut PgConnection,
    names: &[String],
) -> AppResult<Vec<(Uuid, String)>> {
    let wanted: BTreeSet<String> = names
        .iter()
        .map(|name| normalize_name(name))
        .filter(|name| !name.is_empty())
        .collect();
    if wanted.is_empty() {
        return Ok(Vec::new());
    }

    let found: Vec<(Uuid, String)> = permissions::table
        .filter(permissions::name.eq_any(wanted.iter().cloned().collect::<Vec<_>>()))
        .select((permissions::id, permissions::name))
        .order(permissions::name.asc())
        .load(conn)?;

    let missing: Vec<&str> = wanted
        .iter()
        .filter(|name| !found.iter().any(|(_, found_name)| found_name == *name))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(AppError::not_found_msg(format!(
            "Unknown permissions: {}",
            missing.join(", ")
        )));
    }
    Ok(found)
}

pub async fn list_roles(
    State(state): State<AppState>,
    caller: Caller,
) -> AppResult<Json<Vec<RoleInfo>>> {
    let rows: Vec<Role> = state
        .with_conn(move |conn| {
            require_global(conn, &caller.roles, ROLES_MANAGE)?;
            Ok(roles::table.order(roles::name.asc()).load(conn)?)
        })
        .await?;
    Ok(Json(rows.into_iter().map(RoleInfo::from).collect()))
}

pub async fn create_role(
    State(state): State<AppState>,
    caller: Caller,
    Json(payload): Json<CreateRoleRequest>,
) -> AppResult<(StatusCode, Json<RoleInfo>)> {
    let name = required_name(&payload.name)?;

    let description = clean_description(payload.description);
    let role: Role = state
        .with_conn(move |conn| {
            require_global(conn, &caller.roles, ROLES_MANAGE)?;

            let exists: i64 = roles::table
                .filter(roles::name.eq(&name))
                .count()
                .get_result(conn)?;
            if exists > 0 {
                return Err(AppError::conflict("Role already exists"));
            }

            Ok(diesel::insert_into(roles::table)
                .values(&NewRole {
                    id: Uuid::new_v4(),
                    name,
                    description,
                })
                .get_result(conn)?)
        })
        .await?;

    info!(role_id = %role.id, role = %role.name, "role created");
    Ok((StatusCode::CREATED, Json(role.into())))
}

pub async fn replace_role_permissions(
    State(state): State<AppState>,
    caller: Caller,
    Path(role_id): Path<Uuid>,
    Json(payload): Json<ReplacePermissionsRequest>,
) -> AppResult<Json<RolePermissionsResponse>> {
    let (role, resolved) = state
        .with_conn(move |conn| {
            require_global(conn, &caller.roles, ROLES_MANAGE)?;
            conn.transaction::<_, AppError, _>(|conn| {
                let role = load_role(conn, role_id)?;
                let resolved = resolve_permissions(conn, &payload.permissions)?;

                diesel::delete(role_permissions::table.filter(role_permissions::role_id.eq(role_id)))
                    .execute(conn)?;
                let rows: Vec<NewRolePermission> = resolved
                    .iter()
                    .map(|(permission_id, _)| NewRolePermission {
                        role_id,
                        permission_id: *permission_id,
                    })
                    .collect();
                if !rows.is_empty() {
                    diesel::insert_into(role_permissions::table)
                        .values(&rows)
                        .execute(conn)?;
                }
                Ok((role, resolved))
            })
        })
        .await?;

    info!(role_id = %role_id, permissions = resolved.len(), "role permissions replaced");
    Ok(Json(RolePermissionsResponse {
        role: role.into(),
        operational_role: None,
        permissions: resolved.into_iter().map(|(_, name)| name).collect(),
    }))
}

pub async fn replace_operational_permissions(
    State(state): State<AppState>,
    caller: Caller,
    Path((role_id, operational_role)): Path<(Uuid, String)>,
    Json(payload): Json<ReplacePermissionsRequest>,
) -> AppResult<Json<RolePermissionsResponse>> {
    let operational_role: OperationalRole = operational_role.parse().map_err(|_| {
        AppError::bad_request(format!("invalid operational role: {operational_role}"))
    })?;

    let (role, resolved) = state
        .with_conn(move |conn| {
            require_global(conn, &caller.roles, ROLES_MANAGE)?;
            conn.transaction::<_, AppError, _>(|conn| {
                let role = load_role(conn, role_id)?;
                let resolved = resolve_permissions(conn, &payload.permissions)?;

                diesel::delete(
                    operational_role_permissions::table
                        .filter(operational_role_permissions::role_id.eq(role_id))
                        .filter(operational_role_permissions::operational_role.eq(operational_role.as_str())),
                )
                .execute(conn)?;
                let rows: Vec<NewOperationalRolePermission> = resolved
                    .iter()
                    .map(|(permission_id, _)| NewOperationalRolePermission {
                        role_id,
                        operational_role: operational_role.as_str().to_string(),
                        permission_id: *permission_id,
                    })
                    .collect();
                if !rows.is_empty() {
                    diesel::insert_into(operational_role_permissions::table)
                        .values(&rows)
                        .execute(conn)?;
                }
                Ok((role, resolved))
            })
        })
        .await?;

    info!(
        role_id = %role_id,
        operational_role = operational_role.as_str(),
        permissions = resolved.len(),
        "operational role permissions replaced"
    );
    Ok(Json(RolePermissionsResponse {
        role: role.into(),
        operational_role: Some(operational_role),
        permissions: resolved.into_iter().map(|(_, name)| name).collect(),
    }))
}

pub async fn list_permissions(
    State(state): State<AppState>,
    caller: Caller,
) -> AppResult<Json<Vec<PermissionInfo>>> {
    let rows: Vec<Permission> = state
        .with_conn(move |conn| {
            require_global(conn, &caller.roles, PERMISSIONS_MANAGE)?;
            Ok(permissions::table.order(permissions::name.asc()).load(conn)?)
        })
        .await?;
    Ok(Json(rows.into_iter().map(PermissionInfo::from).collect()))
}

pub async fn create_permission(
    State(state): State<AppState>,
    caller: Caller,
    Json(payload): Json<CreatePermissionRequest>,
) -> AppResult<(StatusCode, Json<PermissionInfo>)> {
    let name = required_name(&payload.name)?;

    let description = clean_description(payload.description);
    let permission: Permission = state
        .with_conn(move |conn| {
            require_global(conn, &caller.roles, PERMISSIONS_MANAGE)?;

            let exists: i64 = permissions::table
                .filter(permissions::name.eq(&name))
                .count()
                .get_result(conn)?;
            if exists > 0 {
                return Err(AppError::conflict("Permission already exists"));
            }

            Ok(diesel::insert_into(permissions::table)
                .values(&NewPermission {
                    id: Uuid::new_v4(),
                    name,
                    description,
                })
                .get_result(conn)?)
        })
        .await?;

    info!(permission = %permission.name, "permission created");
    Ok((StatusCode::CREATED, Json(permission.into())))
}
