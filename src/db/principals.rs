//! Principal CRUD operations using Diesel

use diesel::prelude::*;

use super::diesel_schema::principals;
use super::models::{current_timestamp, NewPrincipal, PrincipalRow};
use crate::error::CivicError;

pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_INSTITUTION_STAFF: &str = "institution_staff";
pub const ROLE_DEPARTMENT_STAFF: &str = "department_staff";
pub const ROLE_ANONYMOUS: &str = "anonymous";

// ============================================================================
// Read Operations
// ============================================================================

pub fn get_principal(
    conn: &mut SqliteConnection,
    principal_id: &str,
) -> Result<Option<PrincipalRow>, CivicError> {
    Ok(principals::table
        .filter(principals::id.eq(principal_id))
        .first(conn)
        .optional()?)
}

/// Principal bound to a device identifier, registered or not
pub fn find_by_device(
    conn: &mut SqliteConnection,
    device_id: &str,
) -> Result<Option<PrincipalRow>, CivicError> {
    Ok(principals::table
        .filter(principals::device_id.eq(device_id))
        .first(conn)
        .optional()?)
}

/// Registered principal by login name
pub fn find_registered_by_username(
    conn: &mut SqliteConnection,
    username: &str,
) -> Result<Option<PrincipalRow>, CivicError> {
    Ok(principals::table
        .filter(principals::username.eq(username))
        .filter(principals::password_hash.is_not_null())
        .first(conn)
        .optional()?)
}

/// IDs of every non-admin principal, optionally narrowed to one institution
pub fn list_non_admin_ids(
    conn: &mut SqliteConnection,
    institution_id: Option<&str>,
) -> Result<Vec<String>, CivicError> {
    let mut query = principals::table
        .filter(principals::role.ne(ROLE_ADMIN))
        .filter(principals::is_active.eq(1))
        .select(principals::id)
        .into_boxed();

    if let Some(inst) = institution_id {
        query = query.filter(principals::institution_id.eq(inst));
    }

    Ok(query.load(conn)?)
}

// ============================================================================
// Write Operations
// ============================================================================

/// Insert a principal row; unique violations surface unchanged so callers can
/// recover from them
pub fn insert_principal(
    conn: &mut SqliteConnection,
    new: &NewPrincipal<'_>,
) -> Result<PrincipalRow, CivicError> {
    diesel::insert_into(principals::table)
        .values(new)
        .execute(conn)?;

    get_principal(conn, new.id)?
        .ok_or_else(|| CivicError::Internal(format!("Principal {} vanished after insert", new.id)))
}

/// Turn an anonymous device principal into a registered one in place
pub fn upgrade_to_registered(
    conn: &mut SqliteConnection,
    principal_id: &str,
    username: &str,
    password_hash: &str,
    phone_number: Option<&str>,
) -> Result<PrincipalRow, CivicError> {
    let now = current_timestamp();
    diesel::update(principals::table.filter(principals::id.eq(principal_id)))
        .set((
            principals::username.eq(username),
            principals::password_hash.eq(Some(password_hash)),
            principals::phone_number.eq(phone_number),
            principals::updated_at.eq(&now),
        ))
        .execute(conn)?;

    get_principal(conn, principal_id)?
        .ok_or_else(|| CivicError::NotFound(format!("Principal {}", principal_id)))
}

/// Activate or deactivate a principal. Deactivation also revokes every
/// outstanding session token by bumping `token_version`.
pub fn set_active(
    conn: &mut SqliteConnection,
    principal_id: &str,
    active: bool,
) -> Result<bool, CivicError> {
    let now = current_timestamp();
    let updated = diesel::update(principals::table.filter(principals::id.eq(principal_id)))
        .set((
            principals::is_active.eq(i32::from(active)),
            principals::token_version.eq(principals::token_version + 1),
            principals::updated_at.eq(&now),
        ))
        .execute(conn)?;
    Ok(updated > 0)
}
