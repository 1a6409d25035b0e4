//! Report operations

use diesel::prelude::*;
use serde::Deserialize;

use super::diesel_schema::reports;
use super::models::{current_timestamp, NewReport, Report};
use crate::access::ScopeFilter;
use crate::error::CivicError;

pub const REPORT_STATUSES: [&str; 4] = ["pending", "received", "solving", "solved"];

/// Query parameters for listing reports
#[derive(Debug, Clone, Deserialize)]
pub struct ReportQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub institution: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

impl Default for ReportQuery {
    fn default() -> Self {
        Self {
            status: None,
            institution: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

pub fn insert_report(conn: &mut SqliteConnection, new: &NewReport<'_>) -> Result<Report, CivicError> {
    diesel::insert_into(reports::table).values(new).execute(conn)?;
    get_report(conn, new.id)?
        .ok_or_else(|| CivicError::Internal(format!("Report {} vanished after insert", new.id)))
}

pub fn get_report(conn: &mut SqliteConnection, report_id: &str) -> Result<Option<Report>, CivicError> {
    Ok(reports::table
        .filter(reports::id.eq(report_id))
        .first(conn)
        .optional()?)
}

/// Reports visible under `scope`, newest first
pub fn list_reports(
    conn: &mut SqliteConnection,
    scope: &ScopeFilter,
    query: &ReportQuery,
) -> Result<Vec<Report>, CivicError> {
    let mut q = reports::table.into_boxed();

    q = match scope {
        ScopeFilter::All => q,
        ScopeFilter::Institution(inst) => q.filter(reports::institution_id.eq(inst.clone())),
        ScopeFilter::Department(dept) => q.filter(reports::department_id.eq(dept.clone())),
        ScopeFilter::Owner { principal_id, device_id } => match device_id {
            Some(dev) => q.filter(
                reports::author_id
                    .nullable()
                    .eq(principal_id.clone())
                    .or(reports::device_id.eq(dev.clone())),
            ),
            None => q.filter(reports::author_id.eq(principal_id.clone())),
        },
    };

    if let Some(ref status) = query.status {
        q = q.filter(reports::status.eq(status.clone()));
    }
    if let Some(ref inst) = query.institution {
        q = q.filter(reports::institution_id.eq(inst.clone()));
    }

    Ok(q.order((reports::created_at.desc(), reports::id.desc()))
        .limit(query.limit.clamp(1, 500))
        .offset(query.offset.max(0))
        .load(conn)?)
}

/// Triage columns; `None` fields are left untouched
#[derive(AsChangeset)]
#[diesel(table_name = reports)]
struct ReportTriage<'a> {
    status: &'a str,
    distance_km: Option<f64>,
    route_info: Option<&'a str>,
    updated_at: &'a str,
}

pub fn update_report_status(
    conn: &mut SqliteConnection,
    report_id: &str,
    status: &str,
    distance_km: Option<f64>,
    route_info: Option<&str>,
) -> Result<Report, CivicError> {
    let now = current_timestamp();

    diesel::update(reports::table.filter(reports::id.eq(report_id)))
        .set(&ReportTriage {
            status,
            distance_km,
            route_info,
            updated_at: &now,
        })
        .execute(conn)?;

    get_report(conn, report_id)?.ok_or_else(|| CivicError::NotFound(format!("Report {}", report_id)))
}
