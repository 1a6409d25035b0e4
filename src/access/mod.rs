//! Scope gate
//!
//! Decides whether a principal may act on a scoped resource (report,
//! message, and transitively replies and attachments), and narrows list
//! queries to what the principal may see.
//!
//! | Role                | Condition                    | Access                        |
//! |---------------------|------------------------------|-------------------------------|
//! | admin               | always                       | everything                    |
//! | institution_staff   | resource institution matches | read, status, reply           |
//! | department_staff    | resource department matches  | read, status, reply           |
//! | any                 | owns the resource            | read, edit content, reply     |
//! | anything else       |                              | denied                        |
//!
//! The first matching row wins. Absent values never match.

use crate::db::models::{Message, Report};
use crate::error::CivicError;
use crate::identity::{Principal, Role};

/// What the principal wants to do with a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Read,
    /// Edit the citizen-authored content
    WriteContent,
    /// Triage: status changes and other administrative writes
    WriteStatus,
    Reply,
}

/// Ownership and target scope of a resource
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceScope<'a> {
    pub author_id: Option<&'a str>,
    pub device_id: Option<&'a str>,
    pub institution_id: Option<&'a str>,
    pub department_id: Option<&'a str>,
}

impl<'a> ResourceScope<'a> {
    pub fn of_report(report: &'a Report) -> Self {
        Self {
            author_id: Some(report.author_id.as_str()),
            device_id: report.device_id.as_deref(),
            institution_id: report.institution_id.as_deref(),
            department_id: report.department_id.as_deref(),
        }
    }

    pub fn of_message(message: &'a Message) -> Self {
        Self {
            author_id: Some(message.sender_id.as_str()),
            device_id: message.device_id.as_deref(),
            institution_id: Some(message.institution_id.as_str()),
            department_id: message.department_id.as_deref(),
        }
    }
}

fn same(a: Option<&str>, b: Option<&str>) -> bool {
    matches!((a, b), (Some(x), Some(y)) if x == y)
}

/// Resource was authored by, or anonymously submitted from the device of,
/// this principal
pub fn is_owner(principal: &Principal, resource: &ResourceScope<'_>) -> bool {
    same(resource.author_id, Some(principal.id.as_str()))
        || same(resource.device_id, principal.device_id())
}

/// Staff whose scope covers the resource. Admin is not "in scope", it is
/// above scope.
fn staff_in_scope(principal: &Principal, resource: &ResourceScope<'_>) -> bool {
    match &principal.role {
        Role::InstitutionStaff { institution_id } => {
            same(resource.institution_id, Some(institution_id.as_str()))
        }
        Role::DepartmentStaff { department_id, .. } => {
            same(resource.department_id, Some(department_id.as_str()))
        }
        Role::Admin | Role::Anonymous { .. } => false,
    }
}

pub fn can_access(principal: &Principal, resource: &ResourceScope<'_>, action: Action) -> bool {
    if principal.is_admin() {
        return true;
    }
    if staff_in_scope(principal, resource) {
        return matches!(action, Action::Read | Action::WriteStatus | Action::Reply);
    }
    if is_owner(principal, resource) {
        return matches!(action, Action::Read | Action::WriteContent | Action::Reply);
    }
    false
}

/// Gate a single-resource operation, producing the error to return when
/// denied. Anonymous principals get `NotFound` so existence does not leak.
pub fn authorize(
    principal: &Principal,
    resource: &ResourceScope<'_>,
    action: Action,
    what: &str,
) -> Result<(), CivicError> {
    if can_access(principal, resource, action) {
        return Ok(());
    }
    if principal.is_anonymous() && action == Action::Read {
        return Err(CivicError::NotFound(what.to_string()));
    }
    Err(CivicError::Forbidden(format!("Not allowed to access {}", what)))
}

/// Filter applied to list queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeFilter {
    All,
    Institution(String),
    Department(String),
    /// Rows authored by the principal or submitted from its device
    Owner {
        principal_id: String,
        device_id: Option<String>,
    },
}

pub fn visible_scope(principal: &Principal) -> ScopeFilter {
    match &principal.role {
        Role::Admin => ScopeFilter::All,
        Role::InstitutionStaff { institution_id } => {
            ScopeFilter::Institution(institution_id.clone())
        }
        Role::DepartmentStaff { department_id, .. } => {
            ScopeFilter::Department(department_id.clone())
        }
        Role::Anonymous { device_id } => ScopeFilter::Owner {
            principal_id: principal.id.clone(),
            device_id: Some(device_id.clone()),
        },
    }
}

/// Which replies on a message a principal may list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyVisibility {
    All,
    /// Replies written by the owner or by any staff role
    OwnerAndStaff,
    Nothing,
}

pub fn reply_visibility(
    principal: &Principal,
    message: &ResourceScope<'_>,
) -> Result<ReplyVisibility, CivicError> {
    if principal.is_admin() || staff_in_scope(principal, message) {
        return Ok(ReplyVisibility::All);
    }
    if is_owner(principal, message) {
        return Ok(ReplyVisibility::OwnerAndStaff);
    }
    if principal.role.is_staff() {
        return Err(CivicError::Forbidden(
            "Message is outside your institution or department".into(),
        ));
    }
    Ok(ReplyVisibility::Nothing)
}

/// Content-Disposition for attachment downloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Inline,
    Attachment,
}

impl Disposition {
    /// `preview=1|true|yes` asks for inline display
    pub fn from_preview(preview: Option<&str>) -> Self {
        match preview.map(|p| p.trim().to_ascii_lowercase()) {
            Some(p) if matches!(p.as_str(), "1" | "true" | "yes") => Disposition::Inline,
            _ => Disposition::Attachment,
        }
    }

    pub fn header_value(&self, filename: &str) -> String {
        let kind = match self {
            Disposition::Inline => "inline",
            Disposition::Attachment => "attachment",
        };
        format!("{}; filename=\"{}\"", kind, filename.replace('"', ""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(id: &str, role: Role) -> Principal {
        Principal {
            id: id.into(),
            username: id.into(),
            role,
            registered: false,
        }
    }

    fn admin() -> Principal {
        principal("admin", Role::Admin)
    }

    fn inst_staff(inst: &str) -> Principal {
        principal("staff", Role::InstitutionStaff { institution_id: inst.into() })
    }

    fn dept_staff(dept: &str, inst: &str) -> Principal {
        principal(
            "dstaff",
            Role::DepartmentStaff {
                department_id: dept.into(),
                institution_id: inst.into(),
            },
        )
    }

    fn anon(id: &str, device: &str) -> Principal {
        principal(id, Role::Anonymous { device_id: device.into() })
    }

    fn resource<'a>(author: &'a str, device: Option<&'a str>, inst: &'a str, dept: Option<&'a str>) -> ResourceScope<'a> {
        ResourceScope {
            author_id: Some(author),
            device_id: device,
            institution_id: Some(inst),
            department_id: dept,
        }
    }

    #[test]
    fn test_admin_can_do_everything() {
        let r = resource("someone", None, "inst-a", None);
        for action in [Action::Read, Action::WriteContent, Action::WriteStatus, Action::Reply] {
            assert!(can_access(&admin(), &r, action));
        }
    }

    #[test]
    fn test_institution_staff_never_crosses_institutions() {
        let staff = inst_staff("inst-a");
        let own = resource("citizen", None, "inst-a", None);
        let other = resource("citizen", None, "inst-b", None);

        assert!(can_access(&staff, &own, Action::Read));
        assert!(can_access(&staff, &own, Action::WriteStatus));
        assert!(!can_access(&staff, &own, Action::WriteContent));
        for action in [Action::Read, Action::WriteContent, Action::WriteStatus, Action::Reply] {
            assert!(!can_access(&staff, &other, action));
        }
    }

    #[test]
    fn test_department_staff_matches_department_only() {
        let staff = dept_staff("dept-1", "inst-a");
        let in_dept = resource("c", None, "inst-a", Some("dept-1"));
        let other_dept = resource("c", None, "inst-a", Some("dept-2"));
        let no_dept = resource("c", None, "inst-a", None);

        assert!(can_access(&staff, &in_dept, Action::WriteStatus));
        assert!(!can_access(&staff, &other_dept, Action::Read));
        assert!(!can_access(&staff, &no_dept, Action::Read));
    }

    #[test]
    fn test_owner_by_device_cannot_change_status() {
        let owner = anon("p-abc", "abc123");
        let report = resource("someone-else", Some("abc123"), "inst-a", None);

        assert!(can_access(&owner, &report, Action::Read));
        assert!(can_access(&owner, &report, Action::WriteContent));
        assert!(!can_access(&owner, &report, Action::WriteStatus));
        assert!(!can_access(&anon("p-xyz", "xyz999"), &report, Action::Read));
    }

    #[test]
    fn test_missing_values_never_match() {
        let staff = dept_staff("dept-1", "inst-a");
        let r = ResourceScope::default();
        assert!(!can_access(&staff, &r, Action::Read));
        assert!(!is_owner(&principal("p", Role::Admin), &r));
    }

    #[test]
    fn test_anonymous_denied_read_is_not_found() {
        let report = resource("owner", Some("abc123"), "inst-a", None);
        let err = authorize(&anon("p-xyz", "xyz999"), &report, Action::Read, "Report r1").unwrap_err();
        assert!(matches!(err, CivicError::NotFound(_)));

        let err = authorize(&inst_staff("inst-b"), &report, Action::Read, "Report r1").unwrap_err();
        assert!(matches!(err, CivicError::Forbidden(_)));
    }

    #[test]
    fn test_visible_scope_per_role() {
        assert_eq!(visible_scope(&admin()), ScopeFilter::All);
        assert_eq!(
            visible_scope(&inst_staff("inst-a")),
            ScopeFilter::Institution("inst-a".into())
        );
        assert_eq!(
            visible_scope(&anon("p1", "abc123")),
            ScopeFilter::Owner {
                principal_id: "p1".into(),
                device_id: Some("abc123".into())
            }
        );
    }

    #[test]
    fn test_reply_visibility() {
        let msg = resource("p-owner", Some("dev-owner"), "inst-a", Some("dept-1"));

        assert_eq!(reply_visibility(&admin(), &msg).unwrap(), ReplyVisibility::All);
        assert_eq!(reply_visibility(&inst_staff("inst-a"), &msg).unwrap(), ReplyVisibility::All);
        assert_eq!(
            reply_visibility(&anon("p-owner", "dev-owner"), &msg).unwrap(),
            ReplyVisibility::OwnerAndStaff
        );
        assert!(matches!(
            reply_visibility(&inst_staff("inst-b"), &msg),
            Err(CivicError::Forbidden(_))
        ));
        assert_eq!(
            reply_visibility(&anon("p-other", "dev-other"), &msg).unwrap(),
            ReplyVisibility::Nothing
        );
    }

    #[test]
    fn test_preview_flag() {
        assert_eq!(Disposition::from_preview(Some("1")), Disposition::Inline);
        assert_eq!(Disposition::from_preview(Some("YES")), Disposition::Inline);
        assert_eq!(Disposition::from_preview(Some("0")), Disposition::Attachment);
        assert_eq!(Disposition::from_preview(None), Disposition::Attachment);
        assert_eq!(
            Disposition::Inline.header_value("photo.jpg"),
            "inline; filename=\"photo.jpg\""
        );
    }
}
