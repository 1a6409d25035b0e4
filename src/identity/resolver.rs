//! Identity resolver
//!
//! `resolve_or_create` may insert an anonymous principal; `lookup` never
//! writes. Concurrent first contact from one device is settled by the unique
//! index on `principals.device_id`: the loser of the insert race re-reads
//! and returns the winner's row.
//!
//! A device bound to a password account no longer identifies anyone on its
//! own: such callers must present a session token.

use std::sync::Arc;

use diesel::SqliteConnection;
use tracing::{debug, info, warn};

use super::{normalize_device_id, Credentials, Principal};
use crate::auth::TokenIssuer;
use crate::config::Config;
use crate::db::models::{current_timestamp, new_id, NewPrincipal, PrincipalRow};
use crate::db::principals::{self, ROLE_ANONYMOUS};
use crate::error::CivicError;

pub struct IdentityResolver {
    tokens: Arc<TokenIssuer>,
    label_prefix: String,
    label_len: usize,
}

impl IdentityResolver {
    pub fn new(tokens: Arc<TokenIssuer>, config: &Config) -> Self {
        Self {
            tokens,
            label_prefix: config.anonymous_username_prefix.clone(),
            label_len: config.anonymous_username_len,
        }
    }

    pub fn tokens(&self) -> &TokenIssuer {
        &self.tokens
    }

    /// Display label for an anonymous principal. Not unique.
    pub fn anonymous_label(&self, device_id: &str) -> String {
        let head: String = device_id.chars().take(self.label_len).collect();
        format!("{}{}", self.label_prefix, head)
    }

    /// Resolve the request's principal, creating an anonymous one on first
    /// device contact
    pub fn resolve_or_create(
        &self,
        conn: &mut SqliteConnection,
        credentials: Option<&Credentials>,
        device_id: Option<&str>,
    ) -> Result<Principal, CivicError> {
        if let Some(credentials) = credentials {
            return self.authenticate(conn, credentials);
        }

        let device_id = normalize_device_id(device_id)?;
        match principals::find_by_device(conn, device_id)? {
            Some(row) => device_principal(&row),
            None => self.create_or_fetch(conn, device_id),
        }
    }

    /// Resolve without side effects. `Ok(None)` when nothing identifies the
    /// caller or the device has never been seen.
    pub fn lookup(
        &self,
        conn: &mut SqliteConnection,
        credentials: Option<&Credentials>,
        device_id: Option<&str>,
    ) -> Result<Option<Principal>, CivicError> {
        if let Some(credentials) = credentials {
            return self.authenticate(conn, credentials).map(Some);
        }

        let device_id = match normalize_device_id(device_id) {
            Ok(id) => id,
            Err(CivicError::MissingIdentity) => return Ok(None),
            Err(e) => return Err(e),
        };

        principals::find_by_device(conn, device_id)?
            .map(|row| device_principal(&row))
            .transpose()
    }

    /// Principal named by a session token
    pub fn authenticate(
        &self,
        conn: &mut SqliteConnection,
        credentials: &Credentials,
    ) -> Result<Principal, CivicError> {
        let claims = self.tokens.validate(credentials.token())?;

        let row = principals::get_principal(conn, &claims.sub)?
            .ok_or_else(|| CivicError::Auth("Unknown principal".into()))?;

        if row.token_version != claims.ver {
            return Err(CivicError::Auth("Token has been revoked".into()));
        }

        debug!(principal = %row.id, "Authenticated session token");
        active_principal(&row)
    }

    /// Insert the anonymous principal for `device_id`, or return the row a
    /// concurrent request inserted first
    pub fn create_or_fetch(
        &self,
        conn: &mut SqliteConnection,
        device_id: &str,
    ) -> Result<Principal, CivicError> {
        let id = new_id();
        let label = self.anonymous_label(device_id);
        let now = current_timestamp();

        let new = NewPrincipal {
            id: &id,
            username: &label,
            password_hash: None,
            role: ROLE_ANONYMOUS,
            institution_id: None,
            department_id: None,
            device_id: Some(device_id),
            phone_number: None,
            created_at: &now,
            updated_at: &now,
        };

        match principals::insert_principal(conn, &new) {
            Ok(row) => {
                info!(principal = %row.id, label = %label, "Created anonymous principal");
                Principal::from_row(&row)
            }
            Err(err) if err.is_unique_violation() => {
                warn!(label = %label, "Lost device-principal insert race, re-reading winner");
                let row = principals::find_by_device(conn, device_id)?.ok_or_else(|| {
                    CivicError::Internal("Device principal missing after unique violation".into())
                })?;
                device_principal(&row)
            }
            Err(err) => Err(err),
        }
    }
}

/// Principal for a device-only caller. Registered devices need their token.
fn device_principal(row: &PrincipalRow) -> Result<Principal, CivicError> {
    if row.password_hash.is_some() {
        return Err(CivicError::Auth("Password required for this device".into()));
    }
    active_principal(row)
}

fn active_principal(row: &PrincipalRow) -> Result<Principal, CivicError> {
    if !row.is_active() {
        return Err(CivicError::Auth("Account is deactivated".into()));
    }
    Principal::from_row(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;
    use crate::identity::{ContributorKey, Role};
    use diesel::Connection;

    fn setup() -> (SqliteConnection, IdentityResolver) {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        init_schema(&mut conn).unwrap();
        let tokens = Arc::new(TokenIssuer::new("resolver-test", 3600).unwrap());
        (conn, IdentityResolver::new(tokens, &Config::default()))
    }

    #[test]
    fn test_first_contact_creates_then_reuses() {
        let (mut conn, resolver) = setup();
        let first = resolver.resolve_or_create(&mut conn, None, Some("abc123")).unwrap();
        let again = resolver.resolve_or_create(&mut conn, None, Some(" abc123 ")).unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(first.username, "anon_abc123");
        assert_eq!(first.role, Role::Anonymous { device_id: "abc123".into() });
        assert!(!first.registered);
    }

    #[test]
    fn test_label_truncates_to_eight_chars() {
        let (_, resolver) = setup();
        assert_eq!(resolver.anonymous_label("0123456789abcdef"), "anon_01234567");
        assert_eq!(resolver.anonymous_label("ñandú-ünïcødé"), "anon_ñandú-ün");
    }

    #[test]
    fn test_labels_collide_without_merging_principals() {
        let (mut conn, resolver) = setup();
        let a = resolver.resolve_or_create(&mut conn, None, Some("deadbeef-1")).unwrap();
        let b = resolver.resolve_or_create(&mut conn, None, Some("deadbeef-2")).unwrap();
        assert_eq!(a.username, b.username);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_create_or_fetch_recovers_from_existing_row() {
        let (mut conn, resolver) = setup();
        let winner = resolver.create_or_fetch(&mut conn, "race-device").unwrap();
        let loser = resolver.create_or_fetch(&mut conn, "race-device").unwrap();
        assert_eq!(winner.id, loser.id);
        assert_eq!(loser.contributor(), ContributorKey::Device("race-device".into()));
    }

    #[test]
    fn test_missing_device_is_missing_identity() {
        let (mut conn, resolver) = setup();
        let err = resolver.resolve_or_create(&mut conn, None, Some("   ")).unwrap_err();
        assert!(matches!(err, CivicError::MissingIdentity));
    }

    #[test]
    fn test_lookup_never_creates() {
        let (mut conn, resolver) = setup();
        assert!(resolver.lookup(&mut conn, None, Some("unseen")).unwrap().is_none());
        assert!(resolver.lookup(&mut conn, None, None).unwrap().is_none());
        assert!(principals::find_by_device(&mut conn, "unseen").unwrap().is_none());
    }

    #[test]
    fn test_invalid_token_does_not_fall_back_to_device() {
        let (mut conn, resolver) = setup();
        let creds = Credentials::from_authorization("Bearer not.a.jwt").unwrap();
        let err = resolver
            .resolve_or_create(&mut conn, Some(&creds), Some("abc123"))
            .unwrap_err();
        assert!(matches!(err, CivicError::Auth(_)));
        assert!(principals::find_by_device(&mut conn, "abc123").unwrap().is_none());
    }

    #[test]
    fn test_token_resolves_and_revocation_rejects() {
        let (mut conn, resolver) = setup();
        let principal = resolver.resolve_or_create(&mut conn, None, Some("dev-tok")).unwrap();
        let row = principals::get_principal(&mut conn, &principal.id).unwrap().unwrap();
        let token = resolver.tokens().issue(&row).unwrap();
        let creds = Credentials::from_authorization(&format!("Bearer {}", token)).unwrap();

        let resolved = resolver.resolve_or_create(&mut conn, Some(&creds), None).unwrap();
        assert_eq!(resolved.id, principal.id);

        principals::set_active(&mut conn, &principal.id, false).unwrap();
        let err = resolver.authenticate(&mut conn, &creds).unwrap_err();
        assert!(matches!(err, CivicError::Auth(_)));
    }

    #[test]
    fn test_registered_device_needs_token() {
        let (mut conn, resolver) = setup();
        let principal = resolver.resolve_or_create(&mut conn, None, Some("dev-reg")).unwrap();
        principals::upgrade_to_registered(&mut conn, &principal.id, "baraka", "$argon2id$stub", None).unwrap();

        let err = resolver.resolve_or_create(&mut conn, None, Some("dev-reg")).unwrap_err();
        assert!(matches!(err, CivicError::Auth(_)));
        let err = resolver.lookup(&mut conn, None, Some("dev-reg")).unwrap_err();
        assert!(matches!(err, CivicError::Auth(_)));

        let row = principals::get_principal(&mut conn, &principal.id).unwrap().unwrap();
        let token = resolver.tokens().issue(&row).unwrap();
        let creds = Credentials::from_authorization(&format!("Bearer {}", token)).unwrap();
        let resolved = resolver.resolve_or_create(&mut conn, Some(&creds), Some("dev-reg")).unwrap();
        assert_eq!(resolved.username, "baraka");
        assert!(resolved.registered);
    }

    #[test]
    fn test_deactivated_device_principal_rejected() {
        let (mut conn, resolver) = setup();
        let principal = resolver.resolve_or_create(&mut conn, None, Some("dev-off")).unwrap();
        principals::set_active(&mut conn, &principal.id, false).unwrap();

        let err = resolver.resolve_or_create(&mut conn, None, Some("dev-off")).unwrap_err();
        assert!(matches!(err, CivicError::Auth(_)));
    }
}
