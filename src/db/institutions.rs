//! Institution and department operations

use diesel::prelude::*;

use super::diesel_schema::{departments, institutions};
use super::models::{current_timestamp, new_id, Department, Institution, NewDepartment, NewInstitution};
use crate::error::CivicError;

pub fn get_institution(
    conn: &mut SqliteConnection,
    institution_id: &str,
) -> Result<Option<Institution>, CivicError> {
    Ok(institutions::table
        .filter(institutions::id.eq(institution_id))
        .first(conn)
        .optional()?)
}

pub fn list_institutions(conn: &mut SqliteConnection) -> Result<Vec<Institution>, CivicError> {
    Ok(institutions::table
        .order(institutions::name.asc())
        .load(conn)?)
}

pub fn create_institution(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<Institution, CivicError> {
    let id = new_id();
    let now = current_timestamp();

    diesel::insert_into(institutions::table)
        .values(&NewInstitution {
            id: &id,
            name,
            created_at: &now,
        })
        .execute(conn)
        .map_err(|e| match CivicError::from(e) {
            err if err.is_unique_violation() => {
                CivicError::Conflict(format!("Institution '{}' already exists", name))
            }
            err => err,
        })?;

    Ok(Institution {
        id,
        name: name.to_string(),
        created_at: now,
    })
}

pub fn get_department(
    conn: &mut SqliteConnection,
    department_id: &str,
) -> Result<Option<Department>, CivicError> {
    Ok(departments::table
        .filter(departments::id.eq(department_id))
        .first(conn)
        .optional()?)
}

pub fn list_departments(
    conn: &mut SqliteConnection,
    institution_id: Option<&str>,
) -> Result<Vec<Department>, CivicError> {
    let mut query = departments::table.into_boxed();
    if let Some(inst) = institution_id {
        query = query.filter(departments::institution_id.eq(inst));
    }
    Ok(query.order(departments::name.asc()).load(conn)?)
}

pub fn create_department(
    conn: &mut SqliteConnection,
    institution_id: &str,
    name: &str,
) -> Result<Department, CivicError> {
    if get_institution(conn, institution_id)?.is_none() {
        return Err(CivicError::NotFound(format!("Institution {}", institution_id)));
    }

    let id = new_id();
    let now = current_timestamp();

    diesel::insert_into(departments::table)
        .values(&NewDepartment {
            id: &id,
            institution_id,
            name,
            created_at: &now,
        })
        .execute(conn)
        .map_err(|e| match CivicError::from(e) {
            err if err.is_unique_violation() => CivicError::Conflict(format!(
                "Department '{}' already exists in this institution",
                name
            )),
            err => err,
        })?;

    Ok(Department {
        id,
        institution_id: institution_id.to_string(),
        name: name.to_string(),
        created_at: now,
    })
}

/// Check that `department_id` exists and belongs to `institution_id`
pub fn ensure_department_in_institution(
    conn: &mut SqliteConnection,
    institution_id: &str,
    department_id: &str,
) -> Result<Department, CivicError> {
    let department = get_department(conn, department_id)?
        .ok_or_else(|| CivicError::NotFound(format!("Department {}", department_id)))?;

    if department.institution_id != institution_id {
        return Err(CivicError::InvalidInput(
            "Department does not belong to the selected institution".into(),
        ));
    }
    Ok(department)
}
