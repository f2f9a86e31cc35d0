use std::collections::BTreeSet;

use diesel::pg::PgConnection;
use diesel::prelude::*;

use crate::error::{AppError, AppResult};
use crate::schema::{permissions, role_permissions, roles};

pub const ACCESS_ALL_FOLDERS: &str = "ACCESS_ALL_FOLDERS";
pub const ROLES_MANAGE: &str = "ROLES_MANAGE";
pub const PERMISSIONS_MANAGE: &str = "PERMISSIONS_MANAGE";

pub const FOLDER_READ: &str = "FOLDER_READ";
pub const FOLDER_CREATE: &str = "FOLDER_CREATE";
pub const FOLDER_RENAME: &str = "FOLDER_RENAME";
pub const FOLDER_MOVE: &str = "FOLDER_MOVE";
pub const FOLDER_DELETE: &str = "FOLDER_DELETE";
pub const FOLDER_RESTORE: &str = "FOLDER_RESTORE";
pub const GRANTS_MANAGE: &str = "GRANTS_MANAGE";

pub const DOC_READ: &str = "DOC_READ";
pub const DOC_UPLOAD: &str = "DOC_UPLOAD";
pub const DOC_DELETE: &str = "DOC_DELETE";
pub const DOC_RESTORE: &str = "DOC_RESTORE";

const DOC_PERMISSIONS: [&str; 4] = [DOC_READ, DOC_UPLOAD, DOC_DELETE, DOC_RESTORE];

/// Canonical form for role and permission names.
pub fn normalize_name(raw: &str) -> String {
    raw.trim().to_uppercase()
}

/// Permissions that are resolved through folder grants rather than globally.
pub fn is_folder_scoped(name: &str) -> bool {
    name.starts_with("FOLDER_") || name == GRANTS_MANAGE || DOC_PERMISSIONS.contains(&name)
}

/// Normalized, de-duplicated role names of a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleSet(BTreeSet<String>);

impl RoleSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            names
                .into_iter()
                .map(|name| normalize_name(name.as_ref()))
                .filter(|name| !name.is_empty())
                .collect(),
        )
    }

    /// Parses a comma-separated list such as `"legal, hr"`.
    pub fn parse_list(raw: &str) -> Self {
        Self::new(raw.split(','))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(&normalize_name(name))
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(String::as_str).collect()
    }
}

/// Folder-scoped permission names present in the catalog. This is what a
/// bypass role is granted on every folder.
pub fn folder_scoped_catalog(conn: &mut PgConnection) -> AppResult<Vec<String>> {
    let names: Vec<String> = permissions::table
        .select(permissions::name)
        .order(permissions::name.asc())
        .load(conn)?;
    Ok(names
        .into_iter()
        .filter(|name| is_folder_scoped(name))
        .collect())
}

/// Whether any of `role_set` holds `permission` through the role-permission table.
/// Unknown roles and permissions simply match nothing.
pub fn has_global_permission(
    conn: &mut PgConnection,
    role_set: &RoleSet,
    permission: &str,
) -> AppResult<bool> {
    if role_set.is_empty() {
        return Ok(false);
    }
    let permission = normalize_name(permission);
    let count: i64 = role_permissions::table
        .inner_join(roles::table)
        .inner_join(permissions::table)
        .filter(roles::name.eq_any(role_set.names()))
        .filter(permissions::name.eq(permission))
        .count()
        .get_result(conn)?;
    Ok(count > 0)
}

pub fn require_global(
    conn: &mut PgConnection,
    role_set: &RoleSet,
    permission: &str,
) -> AppResult<()> {
    if has_global_permission(conn, role_set, permission)? {
        Ok(())
    } else {
        Err(AppError::forbidden(format!("missing permission {permission}")))
    }
}
