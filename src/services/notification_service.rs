//! Notification service - the principal's own inbox and push devices

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db::models::{Notification, PushDevice};
use crate::db::notifications;
use crate::db::Store;
use crate::error::CivicError;
use crate::identity::Principal;

use super::required_text;

const PLATFORMS: [&str; 3] = ["android", "ios", "web"];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboxQuery {
    #[serde(default)]
    pub unread: Option<String>,
}

impl InboxQuery {
    fn unread_only(&self) -> bool {
        matches!(
            self.unread.as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("1" | "true" | "yes")
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Inbox {
    pub unread: i64,
    pub results: Vec<Notification>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushDeviceInput {
    pub token: String,
    #[serde(default = "default_platform")]
    pub platform: String,
}

fn default_platform() -> String {
    "android".to_string()
}

pub struct NotificationService {
    store: Arc<Store>,
}

impl NotificationService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn list(&self, principal: &Principal, query: &InboxQuery) -> Result<Inbox, CivicError> {
        self.store.with_conn(|conn| {
            Ok(Inbox {
                unread: notifications::count_unread(conn, &principal.id)?,
                results: notifications::list_notifications(conn, &principal.id, query.unread_only())?,
            })
        })
    }

    /// Another principal's notification is reported as missing
    pub fn mark_read(&self, principal: &Principal, notification_id: &str) -> Result<Notification, CivicError> {
        self.store
            .with_conn(|conn| notifications::mark_read(conn, &principal.id, notification_id))?
            .ok_or_else(|| CivicError::NotFound(format!("Notification {}", notification_id)))
    }

    pub fn mark_all_read(&self, principal: &Principal) -> Result<usize, CivicError> {
        let marked = self
            .store
            .with_conn(|conn| notifications::mark_all_read(conn, &principal.id))?;
        debug!(principal = %principal.id, marked, "Marked notifications read");
        Ok(marked)
    }

    pub fn register_device(&self, principal: &Principal, input: &PushDeviceInput) -> Result<PushDevice, CivicError> {
        let token = required_text("token", &input.token, 512)?;
        let platform = input.platform.trim().to_ascii_lowercase();
        if !PLATFORMS.contains(&platform.as_str()) {
            return Err(CivicError::InvalidInput(format!(
                "Unknown platform '{}', expected one of {}",
                platform,
                PLATFORMS.join(", ")
            )));
        }

        let device = self
            .store
            .with_conn(|conn| notifications::upsert_push_device(conn, &principal.id, token, &platform))?;
        info!(principal = %principal.id, platform = %device.platform, "Registered push device");
        Ok(device)
    }
}
