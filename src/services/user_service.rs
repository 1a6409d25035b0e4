//! User service - registration, login, staff management and the
//! institution/department directory

use std::sync::Arc;

use diesel::SqliteConnection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::{hash_password, verify_password};
use crate::db::models::{current_timestamp, new_id, Department, Institution, NewPrincipal, PrincipalRow};
use crate::db::principals::{self, ROLE_ADMIN, ROLE_ANONYMOUS, ROLE_DEPARTMENT_STAFF, ROLE_INSTITUTION_STAFF};
use crate::db::{institutions, Store};
use crate::error::CivicError;
use crate::identity::{normalize_device_id, IdentityResolver, Principal};
use crate::ledger;

use super::events::{CivicEvent, EventBus};
use super::{optional_text, require_admin, required_text};

const MAX_USERNAME_CHARS: usize = 150;
const MAX_PHONE_CHARS: usize = 15;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterInput {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    /// Staff role; only honoured when an admin registers someone
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub institution_id: Option<String>,
    #[serde(default)]
    pub department_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginInput {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaffInput {
    pub username: String,
    pub password: String,
    pub role: String,
    #[serde(default)]
    pub institution_id: Option<String>,
    #[serde(default)]
    pub department_id: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NameInput {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepartmentInput {
    pub institution_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActiveInput {
    pub is_active: bool,
}

/// A principal as shown to itself and to admins
#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    #[serde(flatten)]
    pub principal: Principal,
    pub phone_number: Option<String>,
    pub is_active: bool,
    pub created_at: String,
}

impl Profile {
    fn from_row(row: &PrincipalRow) -> Result<Self, CivicError> {
        Ok(Self {
            principal: Principal::from_row(row)?,
            phone_number: row.phone_number.clone(),
            is_active: row.is_active(),
            created_at: row.created_at.clone(),
        })
    }
}

/// Registration or login result. Admin-created accounts carry no token.
#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub user: Profile,
}

pub struct UserService {
    store: Arc<Store>,
    identity: Arc<IdentityResolver>,
    events: Arc<EventBus>,
}

impl UserService {
    pub fn new(store: Arc<Store>, identity: Arc<IdentityResolver>, events: Arc<EventBus>) -> Self {
        Self {
            store,
            identity,
            events,
        }
    }

    // =========================================================================
    // Registration and login
    // =========================================================================

    /// Register a citizen account bound to the calling device, or, when an
    /// admin asks for a staff role, a staff account
    pub fn register(
        &self,
        caller: Option<&Principal>,
        device_id: Option<&str>,
        input: &RegisterInput,
    ) -> Result<AuthResponse, CivicError> {
        let wants_staff = input
            .role
            .as_deref()
            .map(str::trim)
            .is_some_and(|r| !r.is_empty() && r != ROLE_ANONYMOUS);

        if wants_staff {
            let admin = caller.ok_or_else(|| CivicError::Forbidden("Admin role required".into()))?;
            let user = self.create_staff(
                admin,
                &StaffInput {
                    username: input.username.clone(),
                    password: input.password.clone(),
                    role: input.role.clone().unwrap_or_default(),
                    institution_id: input.institution_id.clone(),
                    department_id: input.department_id.clone(),
                    phone_number: input.phone_number.clone(),
                },
            )?;
            return Ok(AuthResponse { token: None, user });
        }

        self.register_citizen(device_id, input)
    }

    fn register_citizen(&self, device_id: Option<&str>, input: &RegisterInput) -> Result<AuthResponse, CivicError> {
        let device_id = normalize_device_id(device_id)?;
        let username = required_text("username", &input.username, MAX_USERNAME_CHARS)?;
        let phone_number = optional_text("phone_number", input.phone_number.as_deref(), MAX_PHONE_CHARS)?;
        let password_hash = hash_password(&input.password)?;

        let row = self.store.with_conn(|conn| {
            conn.immediate_transaction::<_, CivicError, _>(|conn| {
                ensure_username_free(conn, username)?;

                let row = match principals::find_by_device(conn, device_id)? {
                    Some(row) if row.password_hash.is_some() => {
                        return Err(CivicError::Conflict(
                            "This device already belongs to a registered account".into(),
                        ))
                    }
                    Some(row) if !row.is_active() => return Err(CivicError::Auth("Account is deactivated".into())),
                    Some(row) => principals::upgrade_to_registered(conn, &row.id, username, &password_hash, phone_number)?,
                    None => {
                        let id = new_id();
                        let now = current_timestamp();
                        insert_unique(
                            conn,
                            &NewPrincipal {
                                id: &id,
                                username,
                                password_hash: Some(&password_hash),
                                role: ROLE_ANONYMOUS,
                                institution_id: None,
                                department_id: None,
                                device_id: Some(device_id),
                                phone_number,
                                created_at: &now,
                                updated_at: &now,
                            },
                        )?
                    }
                };

                // Votes, reactions, shares and views made from the device now
                // belong to the account
                ledger::transfer_device_contributions(conn, device_id, &row.id)?;
                Ok(row)
            })
        })?;

        let token = self.identity.tokens().issue(&row)?;
        info!(principal = %row.id, username = %row.username, "Registered citizen");
        self.events.emit(CivicEvent::PrincipalRegistered {
            id: row.id.clone(),
            role: row.role.clone(),
        });

        Ok(AuthResponse {
            token: Some(token),
            user: Profile::from_row(&row)?,
        })
    }

    /// Username and password login, or device-only login for devices that
    /// have not been registered
    pub fn login(&self, device_id: Option<&str>, input: &LoginInput) -> Result<AuthResponse, CivicError> {
        let username = input.username.as_deref().map(str::trim).filter(|u| !u.is_empty());

        let row = match username {
            Some(username) => {
                let password = input
                    .password
                    .as_deref()
                    .ok_or_else(|| CivicError::InvalidInput("password is required".into()))?;
                let row = self
                    .store
                    .with_conn(|conn| principals::find_registered_by_username(conn, username))?;

                let Some(row) = row else {
                    return Err(CivicError::Auth("Invalid username or password".into()));
                };
                let hash = row.password_hash.as_deref().unwrap_or_default();
                if !verify_password(password, hash)? {
                    warn!(username = %username, "Failed password login");
                    return Err(CivicError::Auth("Invalid username or password".into()));
                }
                row
            }
            None => {
                let device_id = normalize_device_id(device_id)?;
                self.store.with_conn(|conn| {
                    let row = match principals::find_by_device(conn, device_id)? {
                        Some(row) => row,
                        None => {
                            let created = self.identity.create_or_fetch(conn, device_id)?;
                            principals::get_principal(conn, &created.id)?
                                .ok_or_else(|| CivicError::Internal("Device principal vanished".into()))?
                        }
                    };
                    if row.password_hash.is_some() {
                        return Err(CivicError::Auth("Password required for this device".into()));
                    }
                    Ok(row)
                })?
            }
        };

        if !row.is_active() {
            return Err(CivicError::Auth("Account is deactivated".into()));
        }

        let token = self.identity.tokens().issue(&row)?;
        info!(principal = %row.id, "Login");
        Ok(AuthResponse {
            token: Some(token),
            user: Profile::from_row(&row)?,
        })
    }

    pub fn me(&self, principal: &Principal) -> Result<Profile, CivicError> {
        let row = self
            .store
            .with_conn(|conn| principals::get_principal(conn, &principal.id))?
            .ok_or_else(|| CivicError::NotFound(format!("Principal {}", principal.id)))?;
        Profile::from_row(&row)
    }

    // =========================================================================
    // Staff management
    // =========================================================================

    pub fn create_staff(&self, admin: &Principal, input: &StaffInput) -> Result<Profile, CivicError> {
        require_admin(admin)?;
        let username = required_text("username", &input.username, MAX_USERNAME_CHARS)?;
        let phone_number = optional_text("phone_number", input.phone_number.as_deref(), MAX_PHONE_CHARS)?;
        let institution_id = optional_text("institution_id", input.institution_id.as_deref(), 64)?;
        let department_id = optional_text("department_id", input.department_id.as_deref(), 64)?;
        let role = match input.role.trim() {
            r @ (ROLE_ADMIN | ROLE_INSTITUTION_STAFF | ROLE_DEPARTMENT_STAFF) => r,
            other => {
                return Err(CivicError::InvalidInput(format!(
                    "Invalid staff role '{}', expected one of {}, {}, {}",
                    other, ROLE_ADMIN, ROLE_INSTITUTION_STAFF, ROLE_DEPARTMENT_STAFF
                )))
            }
        };
        let password_hash = hash_password(&input.password)?;

        let row = self.store.with_conn(|conn| {
            conn.immediate_transaction::<_, CivicError, _>(|conn| {
                let (institution_id, department_id) =
                    staff_scope(conn, role, institution_id, department_id)?;
                ensure_username_free(conn, username)?;

                let id = new_id();
                let now = current_timestamp();
                insert_unique(
                    conn,
                    &NewPrincipal {
                        id: &id,
                        username,
                        password_hash: Some(&password_hash),
                        role,
                        institution_id: institution_id.as_deref(),
                        department_id,
                        device_id: None,
                        phone_number,
                        created_at: &now,
                        updated_at: &now,
                    },
                )
            })
        })?;

        info!(principal = %row.id, role = %row.role, by = %admin.id, "Created staff account");
        self.events.emit(CivicEvent::PrincipalRegistered {
            id: row.id.clone(),
            role: row.role.clone(),
        });
        Profile::from_row(&row)
    }

    /// Activate or deactivate a principal. Every outstanding token of the
    /// target is revoked either way.
    pub fn set_active(&self, admin: &Principal, target_id: &str, active: bool) -> Result<Profile, CivicError> {
        require_admin(admin)?;
        if admin.id == target_id {
            return Err(CivicError::InvalidInput("Admins cannot change their own activation".into()));
        }

        let row = self.store.with_conn(|conn| {
            if !principals::set_active(conn, target_id, active)? {
                return Err(CivicError::NotFound(format!("Principal {}", target_id)));
            }
            principals::get_principal(conn, target_id)?
                .ok_or_else(|| CivicError::NotFound(format!("Principal {}", target_id)))
        })?;

        info!(principal = %target_id, active, by = %admin.id, "Principal activation changed");
        self.events.emit(CivicEvent::PrincipalActivationChanged {
            id: target_id.to_string(),
            active,
        });
        Profile::from_row(&row)
    }

    /// Create the named admin unless it already exists. Used on first start.
    pub fn bootstrap_admin(&self, username: &str, password: &str) -> Result<Profile, CivicError> {
        let username = required_text("username", username, MAX_USERNAME_CHARS)?;

        if let Some(row) = self
            .store
            .with_conn(|conn| principals::find_registered_by_username(conn, username))?
        {
            if row.role != ROLE_ADMIN {
                return Err(CivicError::Conflict(format!("'{}' exists and is not an admin", username)));
            }
            return Profile::from_row(&row);
        }

        let password_hash = hash_password(password)?;
        let id = new_id();
        let now = current_timestamp();
        let row = self.store.with_conn(|conn| {
            insert_unique(
                conn,
                &NewPrincipal {
                    id: &id,
                    username,
                    password_hash: Some(&password_hash),
                    role: ROLE_ADMIN,
                    institution_id: None,
                    department_id: None,
                    device_id: None,
                    phone_number: None,
                    created_at: &now,
                    updated_at: &now,
                },
            )
        })?;

        info!(principal = %row.id, username = %username, "Bootstrapped admin");
        self.events.emit(CivicEvent::PrincipalRegistered {
            id: row.id.clone(),
            role: row.role.clone(),
        });
        Profile::from_row(&row)
    }

    // =========================================================================
    // Directory
    // =========================================================================

    pub fn list_institutions(&self) -> Result<Vec<Institution>, CivicError> {
        self.store.with_conn(institutions::list_institutions)
    }

    pub fn create_institution(&self, admin: &Principal, input: &NameInput) -> Result<Institution, CivicError> {
        require_admin(admin)?;
        let name = required_text("name", &input.name, 200)?;
        let institution = self
            .store
            .with_conn(|conn| institutions::create_institution(conn, name))?;

        info!(institution = %institution.id, name = %institution.name, "Institution created");
        self.events.emit(CivicEvent::InstitutionCreated {
            id: institution.id.clone(),
            name: institution.name.clone(),
        });
        Ok(institution)
    }

    pub fn list_departments(&self, institution_id: Option<&str>) -> Result<Vec<Department>, CivicError> {
        self.store
            .with_conn(|conn| institutions::list_departments(conn, institution_id))
    }

    pub fn create_department(&self, admin: &Principal, input: &DepartmentInput) -> Result<Department, CivicError> {
        require_admin(admin)?;
        let institution_id = required_text("institution_id", &input.institution_id, 64)?;
        let name = required_text("name", &input.name, 200)?;
        let department = self
            .store
            .with_conn(|conn| institutions::create_department(conn, institution_id, name))?;

        info!(department = %department.id, institution = %institution_id, "Department created");
        self.events.emit(CivicEvent::DepartmentCreated {
            id: department.id.clone(),
            institution_id: department.institution_id.clone(),
        });
        Ok(department)
    }
}

fn ensure_username_free(conn: &mut SqliteConnection, username: &str) -> Result<(), CivicError> {
    if principals::find_registered_by_username(conn, username)?.is_some() {
        return Err(CivicError::Conflict(format!("Username '{}' is taken", username)));
    }
    Ok(())
}

fn insert_unique(conn: &mut SqliteConnection, new: &NewPrincipal<'_>) -> Result<PrincipalRow, CivicError> {
    principals::insert_principal(conn, new).map_err(|err| {
        if err.is_unique_violation() {
            CivicError::Conflict(format!("Username '{}' is taken", new.username))
        } else {
            err
        }
    })
}

/// Institution and department a staff role is scoped to. A department
/// implies its institution.
fn staff_scope<'a>(
    conn: &mut SqliteConnection,
    role: &str,
    institution_id: Option<&str>,
    department_id: Option<&'a str>,
) -> Result<(Option<String>, Option<&'a str>), CivicError> {
    match role {
        ROLE_ADMIN => Ok((None, None)),
        ROLE_INSTITUTION_STAFF => {
            let inst = institution_id
                .ok_or_else(|| CivicError::InvalidInput("institution_id is required for institution staff".into()))?;
            if institutions::get_institution(conn, inst)?.is_none() {
                return Err(CivicError::NotFound(format!("Institution {}", inst)));
            }
            Ok((Some(inst.to_string()), None))
        }
        _ => {
            let dept = department_id
                .ok_or_else(|| CivicError::InvalidInput("department_id is required for department staff".into()))?;
            let department = match institution_id {
                Some(inst) => institutions::ensure_department_in_institution(conn, inst, dept)?,
                None => institutions::get_department(conn, dept)?
                    .ok_or_else(|| CivicError::NotFound(format!("Department {}", dept)))?,
            };
            Ok((Some(department.institution_id), Some(dept)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenIssuer;
    use crate::config::Config;
    use crate::identity::{Credentials, Role};

    fn setup() -> (Arc<Store>, Arc<IdentityResolver>, UserService) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let tokens = Arc::new(TokenIssuer::new("user-test", 3600).unwrap());
        let identity = Arc::new(IdentityResolver::new(tokens, &Config::default()));
        let service = UserService::new(store.clone(), identity.clone(), Arc::new(EventBus::new()));
        (store, identity, service)
    }

    fn citizen(username: &str) -> RegisterInput {
        RegisterInput {
            username: username.into(),
            password: "nyumba-123".into(),
            phone_number: Some("0712000000".into()),
            role: None,
            institution_id: None,
            department_id: None,
        }
    }

    fn password_login(username: &str, password: &str) -> LoginInput {
        LoginInput {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    #[test]
    fn test_registration_upgrades_device_principal_in_place() {
        let (store, identity, service) = setup();
        let anon = store
            .with_conn(|conn| identity.resolve_or_create(conn, None, Some("dev-1")))
            .unwrap();

        let registered = service.register(None, Some("dev-1"), &citizen("amina")).unwrap();
        assert_eq!(registered.user.principal.id, anon.id);
        assert!(registered.user.principal.registered);
        assert_eq!(registered.user.principal.role, Role::Anonymous { device_id: "dev-1".into() });

        let token = registered.token.unwrap();
        let creds = Credentials::from_authorization(&format!("Bearer {}", token)).unwrap();
        let resolved = store.with_conn(|conn| identity.authenticate(conn, &creds)).unwrap();
        assert_eq!(resolved.id, anon.id);
    }

    #[test]
    fn test_registration_keeps_device_vote() {
        let (store, identity, service) = setup();
        let admin = service.bootstrap_admin("root", "root-pass").unwrap().principal;
        let anon = store
            .with_conn(|conn| identity.resolve_or_create(conn, None, Some("dev-1")))
            .unwrap();
        store
            .with_conn(|conn| {
                use diesel::connection::SimpleConnection;
                conn.batch_execute(&format!(
                    "INSERT INTO polls (id, question, allow_multiple, show_results, created_by, created_at, updated_at)
                        VALUES ('p1', 'Which road?', 0, 1, '{}', 't', 't');
                     INSERT INTO poll_options (id, poll_id, text, position) VALUES
                        ('o1', 'p1', 'North', 0), ('o2', 'p1', 'South', 1);",
                    admin.id
                ))?;
                Ok(())
            })
            .unwrap();
        let before = anon.contributor();
        store
            .with_conn(|conn| ledger::cast_vote(conn, "p1", &before, &["o1".to_string()]))
            .unwrap();

        let registered = service.register(None, Some("dev-1"), &citizen("amina")).unwrap();
        let after = registered.user.principal.contributor();
        assert_ne!(before, after);

        let err = store
            .with_conn(|conn| ledger::cast_vote(conn, "p1", &after, &["o2".to_string()]))
            .unwrap_err();
        assert!(matches!(err, CivicError::AlreadyContributed(_)));
    }

    #[test]
    fn test_registration_conflicts() {
        let (_, _, service) = setup();
        service.register(None, Some("dev-1"), &citizen("amina")).unwrap();

        assert!(matches!(
            service.register(None, Some("dev-2"), &citizen("amina")),
            Err(CivicError::Conflict(_))
        ));
        assert!(matches!(
            service.register(None, Some("dev-1"), &citizen("baraka")),
            Err(CivicError::Conflict(_))
        ));
        assert!(matches!(
            service.register(None, None, &citizen("baraka")),
            Err(CivicError::MissingIdentity)
        ));
    }

    #[test]
    fn test_password_and_device_login() {
        let (_, _, service) = setup();
        service.register(None, Some("dev-1"), &citizen("amina")).unwrap();

        assert!(service.login(None, &password_login("amina", "nyumba-123")).unwrap().token.is_some());
        assert!(matches!(
            service.login(None, &password_login("amina", "wrong-pass")),
            Err(CivicError::Auth(_))
        ));
        assert!(matches!(
            service.login(None, &password_login("nobody", "nyumba-123")),
            Err(CivicError::Auth(_))
        ));

        // Registered devices must use their password
        assert!(matches!(
            service.login(Some("dev-1"), &LoginInput::default()),
            Err(CivicError::Auth(_))
        ));
        let fresh = service.login(Some("dev-new"), &LoginInput::default()).unwrap();
        assert!(!fresh.user.principal.registered);
        let again = service.login(Some("dev-new"), &LoginInput::default()).unwrap();
        assert_eq!(fresh.user.principal.id, again.user.principal.id);
    }

    #[test]
    fn test_staff_creation_derives_institution_from_department() {
        let (store, _, service) = setup();
        let admin = service.bootstrap_admin("root", "root-pass").unwrap().principal;
        let (inst, dept) = store
            .with_conn(|conn| {
                let inst = institutions::create_institution(conn, "Water")?;
                let dept = institutions::create_department(conn, &inst.id, "Pipes")?;
                Ok((inst, dept))
            })
            .unwrap();

        let staff = service
            .create_staff(
                &admin,
                &StaffInput {
                    username: "fundi".into(),
                    password: "fundi-pass".into(),
                    role: ROLE_DEPARTMENT_STAFF.into(),
                    institution_id: None,
                    department_id: Some(dept.id.clone()),
                    phone_number: None,
                },
            )
            .unwrap();
        assert_eq!(
            staff.principal.role,
            Role::DepartmentStaff {
                department_id: dept.id.clone(),
                institution_id: inst.id.clone(),
            }
        );

        // Non-admins cannot register staff, even through the register route
        let mut input = citizen("mgeni");
        input.role = Some(ROLE_INSTITUTION_STAFF.into());
        input.institution_id = Some(inst.id.clone());
        assert!(matches!(
            service.register(Some(&staff.principal), None, &input),
            Err(CivicError::Forbidden(_))
        ));
        let created = service.register(Some(&admin), None, &input).unwrap();
        assert!(created.token.is_none());
    }

    #[test]
    fn test_deactivation_revokes_login() {
        let (_, _, service) = setup();
        let admin = service.bootstrap_admin("root", "root-pass").unwrap().principal;
        let user = service.register(None, Some("dev-1"), &citizen("amina")).unwrap().user;

        assert!(matches!(
            service.set_active(&admin, &admin.id, false),
            Err(CivicError::InvalidInput(_))
        ));
        let off = service.set_active(&admin, &user.principal.id, false).unwrap();
        assert!(!off.is_active);
        assert!(matches!(
            service.login(None, &password_login("amina", "nyumba-123")),
            Err(CivicError::Auth(_))
        ));
    }

    #[test]
    fn test_bootstrap_admin_is_idempotent() {
        let (_, _, service) = setup();
        let first = service.bootstrap_admin("root", "root-pass").unwrap();
        let second = service.bootstrap_admin("root", "ignored-pass").unwrap();
        assert_eq!(first.principal.id, second.principal.id);
    }

    #[test]
    fn test_directory_is_admin_managed() {
        let (_, _, service) = setup();
        let admin = service.bootstrap_admin("root", "root-pass").unwrap().principal;
        let inst = service
            .create_institution(&admin, &NameInput { name: "Health".into() })
            .unwrap();
        service
            .create_department(
                &admin,
                &DepartmentInput {
                    institution_id: inst.id.clone(),
                    name: "Clinics".into(),
                },
            )
            .unwrap();

        let citizen = Principal {
            id: "c".into(),
            username: "anon_c".into(),
            role: Role::Anonymous { device_id: "c".into() },
            registered: false,
        };
        assert!(matches!(
            service.create_institution(&citizen, &NameInput { name: "Roads".into() }),
            Err(CivicError::Forbidden(_))
        ));
        assert_eq!(service.list_departments(Some(&inst.id)).unwrap().len(), 1);
        assert_eq!(service.list_institutions().unwrap().len(), 1);
    }
}
