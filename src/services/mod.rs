//! Service layer for civic-intake
//!
//! Services encapsulate business logic between HTTP handlers and repositories.
//! Each service wraps database operations with:
//! - Input validation
//! - Scope gate checks against an explicit principal
//! - Transaction boundaries
//! - Event emission and notification dispatch after commit
//!
//! ## Architecture
//!
//! ```text
//! HTTP Handlers (thin, async)
//!     ↓ spawn_blocking
//! Service Layer (business logic, synchronous)
//!     ↓
//! Identity / Scope gate / Ledger
//!     ↓
//! Repository Layer (db/*.rs)
//!     ↓
//! SQLite Database
//! ```

pub mod analytics_service;
pub mod announcement_service;
pub mod events;
pub mod feed_service;
pub mod message_service;
pub mod notification_service;
pub mod notifier;
pub mod poll_service;
pub mod report_service;
pub mod user_service;

pub use analytics_service::AnalyticsService;
pub use announcement_service::AnnouncementService;
pub use events::{spawn_logging_listener, CivicEvent, EventBus, EventListener};
pub use feed_service::FeedService;
pub use message_service::MessageService;
pub use notification_service::NotificationService;
pub use notifier::{Audience, Notice, NotificationDispatcher, NotificationKind, StoreNotifier};
pub use poll_service::PollService;
pub use report_service::ReportService;
pub use user_service::UserService;

use std::sync::Arc;

use crate::auth::TokenIssuer;
use crate::config::Config;
use crate::db::Store;
use crate::error::CivicError;
use crate::identity::{ContributorKey, Credentials, IdentityResolver, Principal};

/// Identity material a request carries
#[derive(Debug, Clone, Copy, Default)]
pub struct Caller<'a> {
    pub credentials: Option<&'a Credentials>,
    pub device_id: Option<&'a str>,
}

/// Service container for dependency injection
///
/// Pass this to HttpServer for handler access.
pub struct Services {
    pub store: Arc<Store>,
    pub config: Arc<Config>,
    pub identity: Arc<IdentityResolver>,
    pub events: Arc<EventBus>,
    pub users: Arc<UserService>,
    pub reports: Arc<ReportService>,
    pub messages: Arc<MessageService>,
    pub polls: Arc<PollService>,
    pub feeds: Arc<FeedService>,
    pub notifications: Arc<NotificationService>,
    pub announcements: Arc<AnnouncementService>,
    pub analytics: Arc<AnalyticsService>,
}

impl Services {
    /// Create all services over one store, dispatching notifications to the
    /// store-backed inbox
    pub fn new(store: Arc<Store>, config: Arc<Config>) -> Result<Self, CivicError> {
        let notifier: Arc<dyn NotificationDispatcher> = Arc::new(StoreNotifier::new(store.clone()));
        Self::with_notifier(store, config, notifier)
    }

    /// Create all services with a custom notification dispatcher
    pub fn with_notifier(
        store: Arc<Store>,
        config: Arc<Config>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Result<Self, CivicError> {
        let tokens = Arc::new(TokenIssuer::from_config(&config)?);
        let identity = Arc::new(IdentityResolver::new(tokens, &config));
        let events = Arc::new(EventBus::new());

        Ok(Self {
            users: Arc::new(UserService::new(store.clone(), identity.clone(), events.clone())),
            reports: Arc::new(ReportService::new(store.clone(), events.clone(), notifier.clone())),
            messages: Arc::new(MessageService::new(
                store.clone(),
                config.clone(),
                events.clone(),
                notifier.clone(),
            )),
            polls: Arc::new(PollService::new(
                store.clone(),
                config.clone(),
                events.clone(),
                notifier.clone(),
            )),
            feeds: Arc::new(FeedService::new(store.clone(), events.clone(), notifier)),
            notifications: Arc::new(NotificationService::new(store.clone())),
            announcements: Arc::new(AnnouncementService::new(store.clone(), events.clone())),
            analytics: Arc::new(AnalyticsService::new(store.clone())),
            store,
            config,
            identity,
            events,
        })
    }

    /// Resolve the caller, creating an anonymous principal on first device
    /// contact
    pub fn resolve(&self, caller: Caller<'_>) -> Result<Principal, CivicError> {
        self.store
            .with_conn(|conn| self.identity.resolve_or_create(conn, caller.credentials, caller.device_id))
    }

    /// Resolve the caller without creating anything
    pub fn lookup(&self, caller: Caller<'_>) -> Result<Option<Principal>, CivicError> {
        self.store
            .with_conn(|conn| self.identity.lookup(conn, caller.credentials, caller.device_id))
    }
}

// ============================================================================
// Input validation helpers
// ============================================================================

/// Trimmed, non-empty text of at most `max` characters
pub(crate) fn required_text<'a>(field: &str, value: &'a str, max: usize) -> Result<&'a str, CivicError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(CivicError::InvalidInput(format!("{} is required", field)));
    }
    check_len(field, value, max)?;
    Ok(value)
}

/// Blank optional text becomes `None`
pub(crate) fn optional_text<'a>(
    field: &str,
    value: Option<&'a str>,
    max: usize,
) -> Result<Option<&'a str>, CivicError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => {
            check_len(field, v, max)?;
            Ok(Some(v))
        }
        None => Ok(None),
    }
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), CivicError> {
    if value.chars().count() > max {
        return Err(CivicError::InvalidInput(format!(
            "{} must be at most {} characters",
            field, max
        )));
    }
    Ok(())
}

/// Contributor key for read paths: the known principal, else the bare device
pub(crate) fn viewer_key(principal: Option<&Principal>, device_id: Option<&str>) -> Option<ContributorKey> {
    match principal {
        Some(p) => Some(p.contributor()),
        None => device_id
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(|d| ContributorKey::Device(d.to_string())),
    }
}

/// Only admins pass
pub(crate) fn require_admin(principal: &Principal) -> Result<(), CivicError> {
    if principal.is_admin() {
        Ok(())
    } else {
        Err(CivicError::Forbidden("Admin role required".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_helpers() {
        assert_eq!(required_text("ward", "  Kariakoo ", 100).unwrap(), "Kariakoo");
        assert!(matches!(required_text("ward", "   ", 100), Err(CivicError::InvalidInput(_))));
        assert!(required_text("ward", &"x".repeat(101), 100).is_err());
        assert_eq!(optional_text("street", Some("  "), 10).unwrap(), None);
        assert_eq!(optional_text("street", None, 10).unwrap(), None);
    }

    #[test]
    fn test_resolve_then_lookup_same_principal() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = Arc::new(Config {
            jwt_secret: Some("test-secret".into()),
            ..Config::default()
        });
        let services = Services::new(store, config).unwrap();

        let caller = Caller {
            credentials: None,
            device_id: Some("abc123"),
        };
        assert!(services.lookup(caller).unwrap().is_none());
        let created = services.resolve(caller).unwrap();
        assert_eq!(created.username, "anon_abc123");
        assert_eq!(services.lookup(caller).unwrap(), Some(created));
    }
}
