//! Report service - citizen reports and their triage

use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::access::{self, Action, ResourceScope};
use crate::db::models::{current_timestamp, new_id, NewReport, Report};
use crate::db::reports::{self, ReportQuery, REPORT_STATUSES};
use crate::db::{institutions, Store};
use crate::error::CivicError;
use crate::identity::Principal;

use super::events::{CivicEvent, EventBus};
use super::notifier::{Audience, Notice, NotificationDispatcher, NotificationKind};
use super::{optional_text, required_text};

#[derive(Debug, Clone, Deserialize)]
pub struct CreateReportInput {
    pub title: String,
    pub description: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub institution_id: Option<String>,
    #[serde(default)]
    pub department_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportStatusInput {
    pub status: String,
    /// Admin-only routing details
    #[serde(default)]
    pub distance_km: Option<f64>,
    #[serde(default)]
    pub route_info: Option<String>,
}

pub struct ReportService {
    store: Arc<Store>,
    events: Arc<EventBus>,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl ReportService {
    pub fn new(
        store: Arc<Store>,
        events: Arc<EventBus>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self { store, events, notifier }
    }

    pub fn create(&self, principal: &Principal, input: &CreateReportInput) -> Result<Report, CivicError> {
        let title = required_text("title", &input.title, 200)?;
        let description = required_text("description", &input.description, 5000)?;
        if !(-90.0..=90.0).contains(&input.latitude) || !(-180.0..=180.0).contains(&input.longitude) {
            return Err(CivicError::InvalidInput("Coordinates are out of range".into()));
        }
        let institution_id = optional_text("institution_id", input.institution_id.as_deref(), 64)?;
        let department_id = optional_text("department_id", input.department_id.as_deref(), 64)?;

        let report = self.store.with_conn(|conn| {
            // A department alone pins its institution
            let institution_id = match (institution_id, department_id) {
                (Some(inst), Some(dept)) => {
                    institutions::ensure_department_in_institution(conn, inst, dept)?;
                    Some(inst.to_string())
                }
                (None, Some(dept)) => Some(
                    institutions::get_department(conn, dept)?
                        .ok_or_else(|| CivicError::NotFound(format!("Department {}", dept)))?
                        .institution_id,
                ),
                (Some(inst), None) => {
                    if institutions::get_institution(conn, inst)?.is_none() {
                        return Err(CivicError::NotFound(format!("Institution {}", inst)));
                    }
                    Some(inst.to_string())
                }
                (None, None) => None,
            };

            let id = new_id();
            let now = current_timestamp();
            reports::insert_report(
                conn,
                &NewReport {
                    id: &id,
                    author_id: &principal.id,
                    device_id: principal.device_id(),
                    institution_id: institution_id.as_deref(),
                    department_id,
                    title,
                    description,
                    latitude: input.latitude,
                    longitude: input.longitude,
                    status: "pending",
                    distance_km: None,
                    route_info: None,
                    created_at: &now,
                    updated_at: &now,
                },
            )
        })?;

        info!(report = %report.id, author = %principal.id, "Report created");
        self.events.emit(CivicEvent::ReportCreated {
            id: report.id.clone(),
            institution_id: report.institution_id.clone(),
        });
        Ok(report)
    }

    /// Reports visible to the principal. No principal sees nothing.
    pub fn list(&self, principal: Option<&Principal>, query: &ReportQuery) -> Result<Vec<Report>, CivicError> {
        let Some(principal) = principal else {
            return Ok(Vec::new());
        };
        let scope = access::visible_scope(principal);
        self.store.with_conn(|conn| reports::list_reports(conn, &scope, query))
    }

    pub fn get(&self, principal: &Principal, report_id: &str) -> Result<Report, CivicError> {
        let report = self
            .store
            .with_conn(|conn| reports::get_report(conn, report_id))?
            .ok_or_else(|| CivicError::NotFound(format!("Report {}", report_id)))?;

        access::authorize(
            principal,
            &ResourceScope::of_report(&report),
            Action::Read,
            &format!("Report {}", report_id),
        )?;
        Ok(report)
    }

    /// Staff triage. Notifies the reporter once per distinct status.
    pub fn update_status(
        &self,
        principal: &Principal,
        report_id: &str,
        input: &ReportStatusInput,
    ) -> Result<Report, CivicError> {
        let status = input.status.trim();
        if !REPORT_STATUSES.contains(&status) {
            return Err(CivicError::InvalidInput(format!(
                "Invalid status '{}', expected one of {}",
                status,
                REPORT_STATUSES.join(", ")
            )));
        }
        let route_info = optional_text("route_info", input.route_info.as_deref(), 2000)?;
        if (input.distance_km.is_some() || route_info.is_some()) && !principal.is_admin() {
            return Err(CivicError::Forbidden("Only admins set routing details".into()));
        }
        if matches!(input.distance_km, Some(d) if !d.is_finite() || d < 0.0) {
            return Err(CivicError::InvalidInput("distance_km must be a non-negative number".into()));
        }

        let (before, updated) = self.store.with_conn(|conn| {
            conn.immediate_transaction::<_, CivicError, _>(|conn| {
                let report = reports::get_report(conn, report_id)?
                    .ok_or_else(|| CivicError::NotFound(format!("Report {}", report_id)))?;
                access::authorize(
                    principal,
                    &ResourceScope::of_report(&report),
                    Action::WriteStatus,
                    &format!("Report {}", report_id),
                )?;
                let updated =
                    reports::update_report_status(conn, report_id, status, input.distance_km, route_info)?;
                Ok((report.status, updated))
            })
        })?;

        info!(report = %report_id, from = %before, to = %status, by = %principal.id, "Report status updated");
        self.events.emit(CivicEvent::ReportStatusChanged {
            id: updated.id.clone(),
            status: updated.status.clone(),
            changed_by: principal.id.clone(),
        });

        if before != updated.status && updated.author_id != principal.id {
            self.notifier.dispatch(Notice::new(
                Audience::Principal(updated.author_id.clone()),
                NotificationKind::ReportStatus,
                "Report status updated",
                &format!("Your report '{}' is now {}", updated.title, updated.status),
                "report_status",
                format!("{}:{}", updated.id, updated.status),
            ));
        }

        Ok(updated)
    }
}
