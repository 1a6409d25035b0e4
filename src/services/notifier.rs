//! Notification dispatch
//!
//! Dispatch happens after the triggering transition has committed and never
//! reports failure back to it. Push delivery is out of process; the store
//! dispatcher only fills the in-app inbox.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::db::notifications::{self, NotificationDraft};
use crate::db::principals;
use crate::db::Store;
use crate::error::CivicError;

/// Longest notification body, in characters
pub const MAX_BODY_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    MessageReply,
    ReportStatus,
    Feed,
    Poll,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::MessageReply => "message_reply",
            NotificationKind::ReportStatus => "report_status",
            NotificationKind::Feed => "feed",
            NotificationKind::Poll => "poll",
        }
    }
}

/// Who receives a notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Principal(String),
    /// Active non-admin principals, optionally only those of one institution
    NonAdmins { institution_id: Option<String> },
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub audience: Audience,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub object_kind: String,
    pub object_id: String,
}

impl Notice {
    pub fn new(
        audience: Audience,
        kind: NotificationKind,
        title: impl Into<String>,
        body: &str,
        object_kind: &str,
        object_id: impl Into<String>,
    ) -> Self {
        Self {
            audience,
            kind,
            title: title.into(),
            body: truncate_chars(body, MAX_BODY_CHARS),
            object_kind: object_kind.to_string(),
            object_id: object_id.into(),
        }
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Fire-and-forget notification sink
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, notice: Notice);
}

/// Writes notices to the notification inbox
pub struct StoreNotifier {
    store: Arc<Store>,
}

impl StoreNotifier {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn deliver(&self, notice: &Notice) -> Result<usize, CivicError> {
        self.store.with_conn(|conn| {
            let recipients = match &notice.audience {
                Audience::Principal(id) => vec![id.clone()],
                Audience::NonAdmins { institution_id } => {
                    principals::list_non_admin_ids(conn, institution_id.as_deref())?
                }
            };

            notifications::notify_many(
                conn,
                &recipients,
                &NotificationDraft {
                    title: &notice.title,
                    body: &notice.body,
                    kind: notice.kind.as_str(),
                    object_kind: &notice.object_kind,
                    object_id: &notice.object_id,
                },
            )
        })
    }
}

impl NotificationDispatcher for StoreNotifier {
    fn dispatch(&self, notice: Notice) {
        match self.deliver(&notice) {
            Ok(written) => {
                debug!(kind = notice.kind.as_str(), object = %notice.object_id, written, "Dispatched notification");
            }
            Err(e) => {
                warn!(kind = notice.kind.as_str(), object = %notice.object_id, error = %e, "Notification dispatch failed");
            }
        }
    }
}
