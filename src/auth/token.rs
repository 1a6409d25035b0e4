//! Session tokens
//!
//! HS256 JWTs carrying the principal id, its role and the principal's
//! `token_version` at issue time. Bumping the version on the principal row
//! revokes every token issued before the bump.

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::db::models::PrincipalRow;
use crate::error::CivicError;

/// Payload stored in a session token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Principal ID
    pub sub: String,
    /// Role at issue time (informational; the row is authoritative)
    pub role: String,
    /// Principal token_version at issue time
    pub ver: i32,
    pub iat: u64,
    pub exp: u64,
}

/// Issues and validates session tokens
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expiry_secs: u64,
}

impl TokenIssuer {
    pub fn new(secret: &str, expiry_secs: u64) -> Result<Self, CivicError> {
        if secret.is_empty() {
            return Err(CivicError::Config("JWT secret must not be empty".into()));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            expiry_secs,
        })
    }

    /// Build from config; without a configured secret, tokens only survive
    /// until the process restarts
    pub fn from_config(config: &Config) -> Result<Self, CivicError> {
        match config.jwt_secret.as_deref() {
            Some(secret) => Self::new(secret, config.token_expiry_secs),
            None => {
                warn!("No jwt_secret configured; using a per-process random secret");
                let secret = format!("{}{}", uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
                Self::new(&secret, config.token_expiry_secs)
            }
        }
    }

    /// Issue a token for a principal row
    pub fn issue(&self, principal: &PrincipalRow) -> Result<String, CivicError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| CivicError::Internal(format!("System time error: {}", e)))?
            .as_secs();

        let claims = Claims {
            sub: principal.id.clone(),
            role: principal.role.clone(),
            ver: principal.token_version,
            iat: now,
            exp: now + self.expiry_secs,
        };

        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| CivicError::Internal(format!("Failed to generate token: {}", e)))
    }

    /// Verify signature and expiry, returning the claims
    pub fn validate(&self, token: &str) -> Result<Claims, CivicError> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|err| {
                let msg = match err.kind() {
                    ErrorKind::ExpiredSignature => "Token expired",
                    ErrorKind::InvalidSignature => "Invalid signature",
                    _ => "Invalid token",
                };
                CivicError::Auth(msg.into())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::current_timestamp;

    fn row() -> PrincipalRow {
        PrincipalRow {
            id: "principal-1".into(),
            username: "amina".into(),
            password_hash: None,
            role: "admin".into(),
            institution_id: None,
            department_id: None,
            device_id: None,
            phone_number: None,
            is_active: 1,
            token_version: 3,
            created_at: current_timestamp(),
            updated_at: current_timestamp(),
        }
    }

    #[test]
    fn test_issue_then_validate() {
        let issuer = TokenIssuer::new("test-secret", 3600).unwrap();
        let token = issuer.issue(&row()).unwrap();
        let claims = issuer.validate(&token).unwrap();
        assert_eq!(claims.sub, "principal-1");
        assert_eq!(claims.ver, 3);
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let token = TokenIssuer::new("one", 3600).unwrap().issue(&row()).unwrap();
        let err = TokenIssuer::new("two", 3600).unwrap().validate(&token).unwrap_err();
        assert!(matches!(err, CivicError::Auth(_)));
    }

    #[test]
    fn test_empty_secret_is_config_error() {
        assert!(matches!(TokenIssuer::new("", 60), Err(CivicError::Config(_))));
    }
}
