//! Announcement service - public notices managed by admins
//!
//! Listings carry a short `preview` of the text; the full description is
//! only returned by the detail read.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::announcements;
use crate::db::models::{current_timestamp, new_id, Announcement, AnnouncementChanges, NewAnnouncement};
use crate::db::Store;
use crate::error::CivicError;
use crate::identity::Principal;

use super::events::{CivicEvent, EventBus};
use super::{optional_text, require_admin, required_text};

/// Characters of description shown in listings
pub const PREVIEW_CHARS: usize = 240;

const MAX_TITLE_CHARS: usize = 200;
const MAX_DESCRIPTION_CHARS: usize = 20_000;

#[derive(Debug, Clone, Deserialize)]
pub struct AnnouncementInput {
    pub title: String,
    pub description: String,
}

/// Partial update; omitted fields are kept
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnnouncementPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Listing entry
#[derive(Debug, Clone, Serialize)]
pub struct AnnouncementSummary {
    pub id: String,
    pub title: String,
    pub preview: String,
    pub is_truncated: bool,
    pub created_at: String,
}

/// Detail view with the full text
#[derive(Debug, Clone, Serialize)]
pub struct AnnouncementView {
    #[serde(flatten)]
    pub announcement: Announcement,
    pub preview: String,
    pub is_truncated: bool,
}

/// First `PREVIEW_CHARS` characters, right-trimmed and ended with an
/// ellipsis when the text is longer
pub fn preview(text: &str) -> (String, bool) {
    match text.char_indices().nth(PREVIEW_CHARS) {
        None => (text.to_string(), false),
        Some((cut, _)) => (format!("{}\u{2026}", text[..cut].trim_end()), true),
    }
}

impl From<Announcement> for AnnouncementSummary {
    fn from(a: Announcement) -> Self {
        let (preview, is_truncated) = preview(&a.description);
        Self {
            id: a.id,
            title: a.title,
            preview,
            is_truncated,
            created_at: a.created_at,
        }
    }
}

impl From<Announcement> for AnnouncementView {
    fn from(announcement: Announcement) -> Self {
        let (preview, is_truncated) = preview(&announcement.description);
        Self {
            announcement,
            preview,
            is_truncated,
        }
    }
}

pub struct AnnouncementService {
    store: Arc<Store>,
    events: Arc<EventBus>,
}

impl AnnouncementService {
    pub fn new(store: Arc<Store>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    /// Public listing, newest first
    pub fn list(&self, limit: i64, offset: i64) -> Result<Vec<AnnouncementSummary>, CivicError> {
        let rows = self
            .store
            .with_conn(|conn| announcements::list_announcements(conn, limit, offset))?;
        Ok(rows.into_iter().map(AnnouncementSummary::from).collect())
    }

    pub fn get(&self, announcement_id: &str) -> Result<AnnouncementView, CivicError> {
        self.store
            .with_conn(|conn| announcements::get_announcement(conn, announcement_id))?
            .map(AnnouncementView::from)
            .ok_or_else(|| CivicError::NotFound(format!("Announcement {}", announcement_id)))
    }

    pub fn create(&self, admin: &Principal, input: &AnnouncementInput) -> Result<AnnouncementView, CivicError> {
        require_admin(admin)?;
        let title = required_text("title", &input.title, MAX_TITLE_CHARS)?;
        let description = required_text("description", &input.description, MAX_DESCRIPTION_CHARS)?;

        let id = new_id();
        let now = current_timestamp();
        let announcement = self.store.with_conn(|conn| {
            announcements::insert_announcement(
                conn,
                &NewAnnouncement {
                    id: &id,
                    title,
                    description,
                    created_by: Some(&admin.id),
                    created_at: &now,
                    updated_at: &now,
                },
            )
        })?;

        info!(announcement = %announcement.id, by = %admin.id, "Announcement published");
        self.events.emit(CivicEvent::AnnouncementPublished {
            id: announcement.id.clone(),
        });
        Ok(announcement.into())
    }

    pub fn update(
        &self,
        admin: &Principal,
        announcement_id: &str,
        patch: &AnnouncementPatch,
    ) -> Result<AnnouncementView, CivicError> {
        require_admin(admin)?;
        let title = optional_text("title", patch.title.as_deref(), MAX_TITLE_CHARS)?;
        let description = optional_text("description", patch.description.as_deref(), MAX_DESCRIPTION_CHARS)?;
        if patch.title.is_some() && title.is_none() {
            return Err(CivicError::InvalidInput("title cannot be blank".into()));
        }
        if patch.description.is_some() && description.is_none() {
            return Err(CivicError::InvalidInput("description cannot be blank".into()));
        }

        let now = current_timestamp();
        let announcement = self
            .store
            .with_conn(|conn| {
                announcements::update_announcement(
                    conn,
                    announcement_id,
                    &AnnouncementChanges {
                        title,
                        description,
                        updated_at: &now,
                    },
                )
            })?
            .ok_or_else(|| CivicError::NotFound(format!("Announcement {}", announcement_id)))?;

        info!(announcement = %announcement_id, by = %admin.id, "Announcement updated");
        Ok(announcement.into())
    }

    pub fn delete(&self, admin: &Principal, announcement_id: &str) -> Result<(), CivicError> {
        require_admin(admin)?;
        if !self
            .store
            .with_conn(|conn| announcements::delete_announcement(conn, announcement_id))?
        {
            return Err(CivicError::NotFound(format!("Announcement {}", announcement_id)));
        }

        info!(announcement = %announcement_id, by = %admin.id, "Announcement deleted");
        self.events.emit(CivicEvent::AnnouncementDeleted {
            id: announcement_id.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;
    use diesel::connection::SimpleConnection;

    fn setup() -> AnnouncementService {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .with_conn(|conn| {
                conn.batch_execute(
                    "INSERT INTO principals (id, username, role, created_at, updated_at)
                        VALUES ('admin', 'root', 'admin', 't', 't');",
                )?;
                Ok(())
            })
            .unwrap();
        AnnouncementService::new(store, Arc::new(EventBus::new()))
    }

    fn admin() -> Principal {
        Principal {
            id: "admin".into(),
            username: "root".into(),
            role: Role::Admin,
            registered: true,
        }
    }

    fn input(description: &str) -> AnnouncementInput {
        AnnouncementInput {
            title: "Water rationing".into(),
            description: description.into(),
        }
    }

    #[test]
    fn test_preview_truncates_long_text() {
        let (short, cut) = preview("Tuesdays only");
        assert_eq!(short, "Tuesdays only");
        assert!(!cut);

        let long = "A".repeat(1024);
        let (text, cut) = preview(&long);
        assert!(cut);
        assert_eq!(text.chars().count(), PREVIEW_CHARS + 1);
        assert!(text.ends_with('\u{2026}'));

        let exact = "b".repeat(PREVIEW_CHARS);
        assert!(!preview(&exact).1);
    }

    #[test]
    fn test_preview_trims_before_ellipsis_and_respects_char_boundaries() {
        let text = format!("{} {}", "ñ".repeat(PREVIEW_CHARS - 1), "tail");
        let (cut, truncated) = preview(&text);
        assert!(truncated);
        assert_eq!(cut, format!("{}\u{2026}", "ñ".repeat(PREVIEW_CHARS - 1)));
    }

    #[test]
    fn test_list_previews_and_detail_is_full() {
        let service = setup();
        let long = "A".repeat(1024);
        let created = service.create(&admin(), &input(&long)).unwrap();

        let listed = service.list(50, 0).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_truncated);
        assert!(listed[0].preview.chars().count() <= PREVIEW_CHARS + 1);

        let detail = service.get(&created.announcement.id).unwrap();
        assert_eq!(detail.announcement.description, long);
    }

    #[test]
    fn test_only_admins_manage_announcements() {
        let service = setup();
        let citizen = Principal {
            id: "c".into(),
            username: "anon_c".into(),
            role: Role::Anonymous { device_id: "c".into() },
            registered: false,
        };
        assert!(matches!(
            service.create(&citizen, &input("x")),
            Err(CivicError::Forbidden(_))
        ));

        let created = service.create(&admin(), &input("x")).unwrap();
        let id = created.announcement.id.clone();
        let patch = AnnouncementPatch {
            description: Some("updated".into()),
            ..Default::default()
        };
        assert!(matches!(service.update(&citizen, &id, &patch), Err(CivicError::Forbidden(_))));
        let updated = service.update(&admin(), &id, &patch).unwrap();
        assert_eq!(updated.announcement.description, "updated");
        assert_eq!(updated.announcement.title, "Water rationing");

        let blank = AnnouncementPatch {
            title: Some("  ".into()),
            ..Default::default()
        };
        assert!(matches!(service.update(&admin(), &id, &blank), Err(CivicError::InvalidInput(_))));

        service.delete(&admin(), &id).unwrap();
        assert!(matches!(service.get(&id), Err(CivicError::NotFound(_))));
        assert!(matches!(service.delete(&admin(), &id), Err(CivicError::NotFound(_))));
    }
}
