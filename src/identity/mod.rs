//! Principals and identity resolution
//!
//! A request is attributed to exactly one principal: the registered user
//! named by a valid session token, or the anonymous principal bound to the
//! request's device identifier (created on first contact).

pub mod resolver;

pub use resolver::IdentityResolver;

use serde::Serialize;

use crate::db::models::PrincipalRow;
use crate::db::principals::{ROLE_ADMIN, ROLE_ANONYMOUS, ROLE_DEPARTMENT_STAFF, ROLE_INSTITUTION_STAFF};
use crate::error::CivicError;

/// Longest device identifier accepted, in bytes
pub const MAX_DEVICE_ID_LEN: usize = 255;

/// Closed set of roles. Staff variants carry the scope they triage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Role {
    Admin,
    InstitutionStaff {
        institution_id: String,
    },
    DepartmentStaff {
        department_id: String,
        institution_id: String,
    },
    Anonymous {
        device_id: String,
    },
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => ROLE_ADMIN,
            Role::InstitutionStaff { .. } => ROLE_INSTITUTION_STAFF,
            Role::DepartmentStaff { .. } => ROLE_DEPARTMENT_STAFF,
            Role::Anonymous { .. } => ROLE_ANONYMOUS,
        }
    }

    pub fn is_staff(&self) -> bool {
        !matches!(self, Role::Anonymous { .. })
    }

    /// Institution this role is scoped to, if any
    pub fn institution_id(&self) -> Option<&str> {
        match self {
            Role::InstitutionStaff { institution_id } => Some(institution_id),
            Role::DepartmentStaff { institution_id, .. } => Some(institution_id),
            Role::Admin | Role::Anonymous { .. } => None,
        }
    }
}

/// True for role strings that belong to staff (used on reply snapshots)
pub fn is_staff_role_str(role: &str) -> bool {
    matches!(role, ROLE_ADMIN | ROLE_INSTITUTION_STAFF | ROLE_DEPARTMENT_STAFF)
}

/// The actor behind a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub id: String,
    pub username: String,
    #[serde(flatten)]
    pub role: Role,
    /// Has a password; anonymous device principals do not
    pub registered: bool,
}

impl Principal {
    /// Build from a stored row, checking the role columns are consistent
    pub fn from_row(row: &PrincipalRow) -> Result<Self, CivicError> {
        let broken = |what: &str| {
            CivicError::Internal(format!("Principal {} has {} but no {}", row.id, row.role, what))
        };

        let role = match row.role.as_str() {
            ROLE_ADMIN => Role::Admin,
            ROLE_INSTITUTION_STAFF => Role::InstitutionStaff {
                institution_id: row.institution_id.clone().ok_or_else(|| broken("institution"))?,
            },
            ROLE_DEPARTMENT_STAFF => Role::DepartmentStaff {
                department_id: row.department_id.clone().ok_or_else(|| broken("department"))?,
                institution_id: row.institution_id.clone().ok_or_else(|| broken("institution"))?,
            },
            ROLE_ANONYMOUS => Role::Anonymous {
                device_id: row.device_id.clone().ok_or_else(|| broken("device identifier"))?,
            },
            other => {
                return Err(CivicError::Internal(format!(
                    "Principal {} has unknown role '{}'",
                    row.id, other
                )))
            }
        };

        Ok(Self {
            id: row.id.clone(),
            username: row.username.clone(),
            role,
            registered: row.password_hash.is_some(),
        })
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Admin)
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.role, Role::Anonymous { .. })
    }

    /// Device identifier carried by the role, for anonymous-role principals
    pub fn device_id(&self) -> Option<&str> {
        match &self.role {
            Role::Anonymous { device_id } => Some(device_id),
            _ => None,
        }
    }

    /// Key under which this principal's contributions are recorded
    pub fn contributor(&self) -> ContributorKey {
        match (&self.role, self.registered) {
            (Role::Anonymous { device_id }, false) => ContributorKey::Device(device_id.clone()),
            _ => ContributorKey::Principal(self.id.clone()),
        }
    }
}

/// Contribution identity: a registered principal or a bare device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContributorKey {
    Principal(String),
    Device(String),
}

impl ContributorKey {
    pub fn principal_id(&self) -> Option<&str> {
        match self {
            ContributorKey::Principal(id) => Some(id),
            ContributorKey::Device(_) => None,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            ContributorKey::Device(id) => Some(id),
            ContributorKey::Principal(_) => None,
        }
    }
}

/// Session credentials taken from the `Authorization` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials(String);

impl Credentials {
    /// Accepts `Bearer <token>` and `Token <token>`
    pub fn from_authorization(value: &str) -> Option<Self> {
        let value = value.trim();
        let token = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("Token "))?
            .trim();

        if token.is_empty() {
            None
        } else {
            Some(Self(token.to_string()))
        }
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

/// Places a device identifier may arrive, in precedence order
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceIdSources<'a> {
    pub header: Option<&'a str>,
    pub body: Option<&'a str>,
    pub query: Option<&'a str>,
}

impl<'a> DeviceIdSources<'a> {
    /// First non-blank candidate: header, then body, then query
    pub fn pick(&self) -> Option<&'a str> {
        [self.header, self.body, self.query]
            .into_iter()
            .flatten()
            .find(|v| !v.trim().is_empty())
    }
}

/// Trim and validate a raw device identifier
pub fn normalize_device_id(raw: Option<&str>) -> Result<&str, CivicError> {
    let device_id = raw.map(str::trim).unwrap_or_default();
    if device_id.is_empty() {
        return Err(CivicError::MissingIdentity);
    }
    if device_id.len() > MAX_DEVICE_ID_LEN {
        return Err(CivicError::InvalidInput(format!(
            "Device identifier exceeds {} bytes",
            MAX_DEVICE_ID_LEN
        )));
    }
    Ok(device_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::current_timestamp;

    fn row(role: &str) -> PrincipalRow {
        PrincipalRow {
            id: "p1".into(),
            username: "someone".into(),
            password_hash: None,
            role: role.into(),
            institution_id: None,
            department_id: None,
            device_id: None,
            phone_number: None,
            is_active: 1,
            token_version: 0,
            created_at: current_timestamp(),
            updated_at: current_timestamp(),
        }
    }

    #[test]
    fn test_credentials_accept_bearer_and_token() {
        assert_eq!(Credentials::from_authorization("Bearer abc").unwrap().token(), "abc");
        assert_eq!(Credentials::from_authorization("Token xyz").unwrap().token(), "xyz");
        assert!(Credentials::from_authorization("Basic dXNlcg==").is_none());
        assert!(Credentials::from_authorization("Bearer   ").is_none());
    }

    #[test]
    fn test_device_id_precedence() {
        let sources = DeviceIdSources {
            header: Some("  "),
            body: Some("from-body"),
            query: Some("from-query"),
        };
        assert_eq!(sources.pick(), Some("from-body"));

        let sources = DeviceIdSources {
            header: Some("from-header"),
            body: Some("from-body"),
            query: None,
        };
        assert_eq!(sources.pick(), Some("from-header"));
        assert_eq!(DeviceIdSources::default().pick(), None);
    }

    #[test]
    fn test_normalize_device_id() {
        assert_eq!(normalize_device_id(Some("  abc123 ")).unwrap(), "abc123");
        assert!(matches!(normalize_device_id(Some("   ")), Err(CivicError::MissingIdentity)));
        assert!(matches!(normalize_device_id(None), Err(CivicError::MissingIdentity)));

        let long = "x".repeat(MAX_DEVICE_ID_LEN + 1);
        assert!(matches!(normalize_device_id(Some(&long)), Err(CivicError::InvalidInput(_))));
    }

    #[test]
    fn test_staff_row_without_scope_is_rejected() {
        let r = row(ROLE_INSTITUTION_STAFF);
        assert!(Principal::from_row(&r).is_err());

        let mut r = row(ROLE_DEPARTMENT_STAFF);
        r.institution_id = Some("inst".into());
        r.department_id = Some("dept".into());
        let p = Principal::from_row(&r).unwrap();
        assert_eq!(p.role.institution_id(), Some("inst"));
    }

    #[test]
    fn test_contributor_key_follows_registration() {
        let mut r = row(ROLE_ANONYMOUS);
        r.device_id = Some("device-9".into());
        let anon = Principal::from_row(&r).unwrap();
        assert_eq!(anon.contributor(), ContributorKey::Device("device-9".into()));

        r.password_hash = Some("$argon2id$...".into());
        let citizen = Principal::from_row(&r).unwrap();
        assert_eq!(citizen.contributor(), ContributorKey::Principal("p1".into()));
    }

    #[test]
    fn test_principal_serializes_role_inline() {
        let mut r = row(ROLE_INSTITUTION_STAFF);
        r.institution_id = Some("inst-1".into());
        let json = serde_json::to_value(Principal::from_row(&r).unwrap()).unwrap();
        assert_eq!(json["role"], "institution_staff");
        assert_eq!(json["institution_id"], "inst-1");
    }
}
