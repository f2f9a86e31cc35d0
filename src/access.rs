//! Folder access resolution.
//!
//! Grants live on a handful of folders; every other folder inherits the grant
//! set of its nearest ancestor that has one. A caller's permissions on a folder
//! are the union, over the caller's roles granted at that folder, of the
//! permissions mapped to the role's operational role.

use std::collections::{BTreeSet, HashMap, HashSet};

use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::{Bool, Uuid as SqlUuid};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{now_utc, Folder, NewFolderGrant, OperationalRole};
use crate::permissions::{self, normalize_name, RoleSet, ACCESS_ALL_FOLDERS};
use crate::schema::{
    folder_role_grants, folders, operational_role_permissions, permissions as permissions_table,
    roles,
};

pub const ROOT_FOLDER_ID: Uuid = Uuid::from_u128(0x00000000_0000_4000_8000_000000000001);

/// Serializes folder moves so two opposite moves cannot both pass the cycle
/// check.
const FOLDER_MOVE_LOCK_KEY: i64 = 0x646f_6361_7263_6876;

/// Parent walk from a folder up to the root. `path` stops the recursion if
/// the stored tree already contains a loop.
const ANCESTOR_CHAIN_SQL: &str = "
    WITH RECURSIVE chain (id, parent_id, depth, path) AS (
        SELECT id, parent_id, 0, ARRAY[id]
        FROM folders
        WHERE id = $1
        UNION ALL
        SELECT f.id, f.parent_id, c.depth + 1, c.path || f.id
        FROM folders f
        JOIN chain c ON f.id = c.parent_id
        WHERE NOT f.id = ANY(c.path)
    )
    SELECT id FROM chain ORDER BY depth";

#[derive(QueryableByName)]
struct ChainRow {
    #[diesel(sql_type = SqlUuid)]
    id: Uuid,
}

#[derive(QueryableByName)]
struct FoundRow {
    #[diesel(sql_type = Bool)]
    found: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GrantFolder {
    pub folder_id: Uuid,
    pub depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectivePermissions {
    pub grant_folder_id: Option<Uuid>,
    pub bypass: bool,
    pub permissions: Vec<String>,
}

impl EffectivePermissions {
    pub fn contains(&self, permission: &str) -> bool {
        let permission = normalize_name(permission);
        self.permissions.iter().any(|name| *name == permission)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantView {
    pub role_id: Uuid,
    pub role_name: String,
    pub operational_role: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveGrants {
    pub folder_id: Uuid,
    pub grant_folder: Option<GrantFolder>,
    pub grants: Vec<GrantView>,
}

pub fn load_folder(conn: &mut PgConnection, folder_id: Uuid) -> AppResult<Folder> {
    folders::table
        .find(folder_id)
        .first(conn)
        .optional()?
        .ok_or_else(|| AppError::not_found_msg("Folder not found"))
}

/// Loads a folder that must exist and must not be soft-deleted.
pub fn load_active_folder(conn: &mut PgConnection, folder_id: Uuid) -> AppResult<Folder> {
    let folder = load_folder(conn, folder_id)?;
    if folder.is_deleted {
        return Err(AppError::bad_request("Folder is deleted"));
    }
    Ok(folder)
}

/// Folder ids from `folder_id` up to the root, self first. Empty when the
/// folder does not exist.
pub fn ancestor_chain(conn: &mut PgConnection, folder_id: Uuid) -> AppResult<Vec<Uuid>> {
    let rows: Vec<ChainRow> = diesel::sql_query(ANCESTOR_CHAIN_SQL)
        .bind::<SqlUuid, _>(folder_id)
        .load(conn)?;
    Ok(rows.into_iter().map(|row| row.id).collect())
}

/// First folder in `chain` that carries at least one grant.
pub fn pick_nearest(chain: &[Uuid], granted: &HashSet<Uuid>) -> Option<GrantFolder> {
    chain
        .iter()
        .position(|id| granted.contains(id))
        .map(|depth| GrantFolder {
            folder_id: chain[depth],
            depth,
        })
}

pub fn nearest_grant_folder(
    conn: &mut PgConnection,
    folder_id: Uuid,
) -> AppResult<Option<GrantFolder>> {
    let chain = ancestor_chain(conn, folder_id)?;
    if chain.is_empty() {
        return Ok(None);
    }
    let granted: HashSet<Uuid> = folder_role_grants::table
        .filter(folder_role_grants::folder_id.eq_any(chain.clone()))
        .select(folder_role_grants::folder_id)
        .distinct()
        .load::<Uuid>(conn)?
        .into_iter()
        .collect();
    Ok(pick_nearest(&chain, &granted))
}

pub fn has_global_bypass(conn: &mut PgConnection, role_set: &RoleSet) -> AppResult<bool> {
    permissions::has_global_permission(conn, role_set, ACCESS_ALL_FOLDERS)
}

/// Distinct permission names reachable from `grants` (role, operational role)
/// through `mapping` (role, operational role, permission).
pub fn collect_permissions(
    grants: &[(Uuid, String)],
    mapping: &[(Uuid, String, String)],
) -> Vec<String> {
    let granted: HashSet<(Uuid, &str)> = grants
        .iter()
        .map(|(role_id, op)| (*role_id, op.as_str()))
        .collect();
    mapping
        .iter()
        .filter(|(role_id, op, _)| granted.contains(&(*role_id, op.as_str())))
        .map(|(_, _, permission)| normalize_name(permission))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn effective_permissions(
    conn: &mut PgConnection,
    folder_id: Uuid,
    role_set: &RoleSet,
) -> AppResult<EffectivePermissions> {
    if role_set.is_empty() {
        return Ok(EffectivePermissions {
            grant_folder_id: None,
            bypass: false,
            permissions: Vec::new(),
        });
    }

    if has_global_bypass(conn, role_set)? {
        return Ok(EffectivePermissions {
            grant_folder_id: None,
            bypass: true,
            permissions: permissions::folder_scoped_catalog(conn)?,
        });
    }

    let Some(nearest) = nearest_grant_folder(conn, folder_id)? else {
        return Ok(EffectivePermissions {
            grant_folder_id: None,
            bypass: false,
            permissions: Vec::new(),
        });
    };

    let grants: Vec<(Uuid, String)> = folder_role_grants::table
        .inner_join(roles::table)
        .filter(folder_role_grants::folder_id.eq(nearest.folder_id))
        .filter(roles::name.eq_any(role_set.names()))
        .select((folder_role_grants::role_id, folder_role_grants::operational_role))
        .load(conn)?;

    let role_ids: Vec<Uuid> = grants.iter().map(|(role_id, _)| *role_id).collect();
    let mapping: Vec<(Uuid, String, String)> = if role_ids.is_empty() {
        Vec::new()
    } else {
        operational_role_permissions::table
            .inner_join(permissions_table::table)
            .filter(operational_role_permissions::role_id.eq_any(role_ids.clone()))
            .select((
                operational_role_permissions::role_id,
                operational_role_permissions::operational_role,
                permissions_table::name,
            ))
            .load(conn)?
    };

    Ok(EffectivePermissions {
        grant_folder_id: Some(nearest.folder_id),
        bypass: false,
        permissions: collect_permissions(&grants, &mapping),
    })
}

pub fn has_permission(
    conn: &mut PgConnection,
    folder_id: Uuid,
    role_set: &RoleSet,
    permission: &str,
) -> AppResult<bool> {
    Ok(effective_permissions(conn, folder_id, role_set)?.contains(permission))
}

pub fn require_permission(
    conn: &mut PgConnection,
    folder_id: Uuid,
    role_set: &RoleSet,
    permission: &str,
) -> AppResult<()> {
    if has_permission(conn, folder_id, role_set, permission)? {
        Ok(())
    } else {
        tracing::debug!(folder_id = %folder_id, permission, "folder permission denied");
        Err(AppError::forbidden(format!(
            "missing permission {} on folder",
            normalize_name(permission)
        )))
    }
}

pub fn list_explicit_grants(conn: &mut PgConnection, folder_id: Uuid) -> AppResult<Vec<GrantView>> {
    let rows: Vec<(Uuid, String, String)> = folder_role_grants::table
        .inner_join(roles::table)
        .filter(folder_role_grants::folder_id.eq(folder_id))
        .select((
            folder_role_grants::role_id,
            roles::name,
            folder_role_grants::operational_role,
        ))
        .order((roles::name.asc(), folder_role_grants::operational_role.asc()))
        .load(conn)?;
    Ok(rows
        .into_iter()
        .map(|(role_id, role_name, operational_role)| GrantView {
            role_id,
            role_name,
            operational_role,
        })
        .collect())
}

pub fn effective_grants(conn: &mut PgConnection, folder_id: Uuid) -> AppResult<EffectiveGrants> {
    load_folder(conn, folder_id)?;
    let grant_folder = nearest_grant_folder(conn, folder_id)?;
    let grants = match grant_folder {
        Some(found) => list_explicit_grants(conn, found.folder_id)?,
        None => Vec::new(),
    };
    Ok(EffectiveGrants {
        folder_id,
        grant_folder,
        grants,
    })
}

/// Replaces the explicit grants of a folder in one transaction.
pub fn set_explicit_grants(
    conn: &mut PgConnection,
    folder_id: Uuid,
    grants: &[(String, OperationalRole)],
) -> AppResult<Vec<GrantView>> {
    conn.transaction(|conn| {
        load_active_folder(conn, folder_id)?;

        let wanted: BTreeSet<String> = grants.iter().map(|(name, _)| normalize_name(name)).collect();
        let role_ids: HashMap<String, Uuid> = roles::table
            .filter(roles::name.eq_any(wanted.iter().cloned().collect::<Vec<_>>()))
            .select((roles::name, roles::id))
            .load::<(String, Uuid)>(conn)?
            .into_iter()
            .collect();

        let missing: Vec<&str> = wanted
            .iter()
            .filter(|name| !role_ids.contains_key(*name))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(AppError::not_found_msg(format!(
                "Unknown roles: {}",
                missing.join(", ")
            )));
        }

        let rows: BTreeSet<(Uuid, OperationalRole)> = grants
            .iter()
            .filter_map(|(name, op)| role_ids.get(&normalize_name(name)).map(|id| (*id, *op)))
            .collect();

        diesel::delete(folder_role_grants::table.filter(folder_role_grants::folder_id.eq(folder_id)))
            .execute(conn)?;

        let new_rows: Vec<NewFolderGrant> = rows
            .into_iter()
            .map(|(role_id, op)| NewFolderGrant {
                folder_id,
                role_id,
                operational_role: op.as_str().to_string(),
            })
            .collect();
        if !new_rows.is_empty() {
            diesel::insert_into(folder_role_grants::table)
                .values(&new_rows)
                .execute(conn)?;
        }

        list_explicit_grants(conn, folder_id)
    })
}

/// True when `candidate` is `folder_id` itself or lies below it, however deep.
pub fn is_self_or_descendant(
    conn: &mut PgConnection,
    candidate: Uuid,
    folder_id: Uuid,
) -> AppResult<bool> {
    let row: FoundRow = diesel::sql_query(format!(
        "WITH chain_ids AS ({ANCESTOR_CHAIN_SQL}) \
         SELECT EXISTS (SELECT 1 FROM chain_ids WHERE id = $2) AS found"
    ))
    .bind::<SqlUuid, _>(candidate)
    .bind::<SqlUuid, _>(folder_id)
    .get_result(conn)?;
    Ok(row.found)
}

/// Re-parents `folder_id` under `target_id` in one transaction. Moves are
/// serialized and the moved row is locked, so the cycle check sees the tree
/// the update is applied to.
pub fn move_folder(conn: &mut PgConnection, folder_id: Uuid, target_id: Uuid) -> AppResult<Folder> {
    conn.transaction(|conn| {
        diesel::sql_query("SELECT pg_advisory_xact_lock($1)")
            .bind::<diesel::sql_types::BigInt, _>(FOLDER_MOVE_LOCK_KEY)
            .execute(conn)?;

        let folder: Folder = folders::table
            .find(folder_id)
            .for_update()
            .first(conn)
            .optional()?
            .ok_or_else(|| AppError::not_found_msg("Folder not found"))?;
        if folder.is_deleted {
            return Err(AppError::bad_request("Folder is deleted"));
        }
        load_active_folder(conn, target_id)?;

        if is_self_or_descendant(conn, target_id, folder_id)? {
            return Err(AppError::bad_request(
                "Cannot move a folder into itself or one of its descendants",
            ));
        }

        let moved = diesel::update(folders::table.find(folder_id))
            .set((
                folders::parent_id.eq(Some(target_id)),
                folders::updated_at.eq(now_utc()),
            ))
            .get_result(conn)?;
        Ok(moved)
    })
}
