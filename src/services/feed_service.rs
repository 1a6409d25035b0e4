//! Feed service - admin posts, reactions, shares and impressions

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::attachments::StoredAttachment;
use crate::db::feeds;
use crate::db::institutions;
use crate::db::models::{current_timestamp, new_id, Feed, NewFeed};
use crate::db::Store;
use crate::error::CivicError;
use crate::identity::Principal;
use crate::ledger::{self, Contribution, ContributionRecord, Outcome, ReactionKind};

use super::events::{CivicEvent, EventBus};
use super::message_service::AttachmentRef;
use super::notifier::{Audience, Notice, NotificationDispatcher, NotificationKind};
use super::{optional_text, require_admin, required_text, viewer_key};

const UUID_LEN: usize = 36;

#[derive(Debug, Clone, Deserialize)]
pub struct FeedInput {
    pub description: String,
    #[serde(default)]
    pub institution_id: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedQuery {
    #[serde(default)]
    pub institution: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

impl Default for FeedQuery {
    fn default() -> Self {
        Self {
            institution: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReactInput {
    pub reaction: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShareInput {
    #[serde(default)]
    pub message: Option<String>,
}

/// Which stored file of a feed to fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedMedia {
    Image,
    Video,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedView {
    pub id: String,
    pub posted_by: String,
    pub institution_id: Option<String>,
    pub description: String,
    pub has_image: bool,
    pub has_video: bool,
    pub link: Option<String>,
    pub impressions: i32,
    pub reactions: HashMap<&'static str, i64>,
    pub total_reactions: i64,
    pub share_count: i64,
    pub my_reaction: Option<String>,
    pub created_at: String,
}

pub struct FeedService {
    store: Arc<Store>,
    events: Arc<EventBus>,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl FeedService {
    pub fn new(store: Arc<Store>, events: Arc<EventBus>, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        Self {
            store,
            events,
            notifier,
        }
    }

    pub fn create(
        &self,
        admin: &Principal,
        input: &FeedInput,
        image: Option<&StoredAttachment>,
        video: Option<&StoredAttachment>,
    ) -> Result<FeedView, CivicError> {
        require_admin(admin)?;
        let description = required_text("description", &input.description, 5000)?;
        let institution_id = optional_text("institution_id", input.institution_id.as_deref(), 64)?;
        let link = optional_text("link", input.link.as_deref(), 500)?;
        if matches!(link, Some(l) if !(l.starts_with("http://") || l.starts_with("https://"))) {
            return Err(CivicError::InvalidInput("link must be an http(s) URL".into()));
        }

        let id = new_id();
        let now = current_timestamp();
        let feed = self.store.with_conn(|conn| {
            if let Some(inst) = institution_id {
                if institutions::get_institution(conn, inst)?.is_none() {
                    return Err(CivicError::NotFound(format!("Institution {}", inst)));
                }
            }
            feeds::insert_feed(
                conn,
                &NewFeed {
                    id: &id,
                    posted_by: &admin.id,
                    institution_id,
                    description,
                    image_path: image.map(|a| a.path.as_str()),
                    video_path: video.map(|a| a.path.as_str()),
                    link,
                    created_at: &now,
                    updated_at: &now,
                },
            )
        })?;

        info!(feed = %feed.id, institution = ?feed.institution_id, by = %admin.id, "Feed created");
        self.events.emit(CivicEvent::FeedCreated {
            id: feed.id.clone(),
            institution_id: feed.institution_id.clone(),
        });
        self.notifier.dispatch(Notice::new(
            Audience::NonAdmins {
                institution_id: feed.institution_id.clone(),
            },
            NotificationKind::Feed,
            "New Feed",
            &feed.description,
            "feed",
            feed.id.clone(),
        ));

        Ok(render(feed, &Aggregates::default()))
    }

    /// Newest first. Listing counts one impression per viewer and feed.
    pub fn list(
        &self,
        principal: Option<&Principal>,
        device_id: Option<&str>,
        query: &FeedQuery,
    ) -> Result<Vec<FeedView>, CivicError> {
        let viewer = viewer_key(principal, device_id);

        self.store.with_conn(|conn| {
            let mut rows = feeds::list_feeds(conn, query.institution.as_deref(), query.limit, query.offset)?;

            if let Some(key) = &viewer {
                for feed in rows.iter_mut() {
                    let record = ledger::contribute(conn, &feed.id, key, Contribution::Impression)?;
                    if record.outcome == Outcome::Recorded {
                        feed.impressions += 1;
                    }
                }
            }

            let ids: Vec<String> = rows.iter().map(|f| f.id.clone()).collect();
            let mut aggregates: HashMap<String, Aggregates> = HashMap::new();
            for (feed_id, reaction, count) in feeds::reaction_counts(conn, &ids)? {
                let entry = aggregates.entry(feed_id).or_default();
                if let Ok(kind) = ReactionKind::parse(&reaction) {
                    entry.reactions.insert(kind.as_str(), count);
                }
            }
            for (feed_id, count) in feeds::share_counts(conn, &ids)? {
                aggregates.entry(feed_id).or_default().shares = count;
            }
            if let Some(key) = &viewer {
                for (feed_id, reaction) in feeds::reactions_of(conn, key, &ids)? {
                    aggregates.entry(feed_id).or_default().mine = Some(reaction);
                }
            }

            debug!(count = rows.len(), viewer = ?viewer, "Listed feeds");
            Ok(rows
                .into_iter()
                .map(|feed| {
                    let agg = aggregates.remove(&feed.id).unwrap_or_default();
                    render(feed, &agg)
                })
                .collect())
        })
    }

    /// Admin delete. Returns the removed row so its media can be cleaned up.
    pub fn delete(&self, admin: &Principal, feed_id: &str) -> Result<Feed, CivicError> {
        require_admin(admin)?;
        let feed = self
            .store
            .with_conn(|conn| feeds::delete_feed(conn, feed_id))?
            .ok_or_else(|| CivicError::NotFound(format!("Feed {}", feed_id)))?;

        info!(feed = %feed_id, by = %admin.id, "Feed deleted");
        self.events.emit(CivicEvent::FeedDeleted { id: feed_id.to_string() });
        Ok(feed)
    }

    /// Set the caller's reaction, replacing any earlier one
    pub fn react(&self, principal: &Principal, feed_id: &str, input: &ReactInput) -> Result<ContributionRecord, CivicError> {
        let reaction = ReactionKind::parse(&input.reaction)?;
        let key = principal.contributor();
        let record = self
            .store
            .with_conn(|conn| ledger::contribute(conn, feed_id, &key, Contribution::React(reaction)))?;

        self.events.emit(CivicEvent::FeedReacted {
            feed_id: feed_id.to_string(),
            reaction: reaction.as_str().to_string(),
        });
        Ok(record)
    }

    pub fn share(&self, principal: &Principal, feed_id: &str, input: &ShareInput) -> Result<ContributionRecord, CivicError> {
        let message = optional_text("message", input.message.as_deref(), 500)?;
        let key = principal.contributor();
        let record = self
            .store
            .with_conn(|conn| ledger::contribute(conn, feed_id, &key, Contribution::Share { message }))?;

        self.events.emit(CivicEvent::FeedShared {
            feed_id: feed_id.to_string(),
        });
        Ok(record)
    }

    /// Stored image or video of a feed. Feeds are public.
    pub fn media(&self, feed_id: &str, which: FeedMedia) -> Result<AttachmentRef, CivicError> {
        let feed = self
            .store
            .with_conn(|conn| feeds::get_feed(conn, feed_id))?
            .ok_or_else(|| CivicError::NotFound(format!("Feed {}", feed_id)))?;

        let path = match which {
            FeedMedia::Image => feed.image_path,
            FeedMedia::Video => feed.video_path,
        };
        let path = path.ok_or_else(|| CivicError::NotFound("No media attached".into()))?;
        // Stored names are `<36-char uuid>-<original>`; present the original
        let name = match path.as_bytes().get(UUID_LEN) {
            Some(b'-') => path.get(UUID_LEN + 1..).unwrap_or_default(),
            _ => path.as_str(),
        };
        let name = if name.is_empty() { "attachment" } else { name }.to_string();
        Ok(AttachmentRef { name, path })
    }
}

#[derive(Debug, Default)]
struct Aggregates {
    reactions: HashMap<&'static str, i64>,
    shares: i64,
    mine: Option<String>,
}

fn render(feed: Feed, agg: &Aggregates) -> FeedView {
    let reactions: HashMap<&'static str, i64> = ReactionKind::ALL
        .iter()
        .map(|kind| (kind.as_str(), agg.reactions.get(kind.as_str()).copied().unwrap_or(0)))
        .collect();

    FeedView {
        total_reactions: reactions.values().sum(),
        reactions,
        share_count: agg.shares,
        my_reaction: agg.mine.clone(),
        has_image: feed.image_path.is_some(),
        has_video: feed.video_path.is_some(),
        id: feed.id,
        posted_by: feed.posted_by,
        institution_id: feed.institution_id,
        description: feed.description,
        link: feed.link,
        impressions: feed.impressions,
        created_at: feed.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::notifications;
    use crate::identity::Role;
    use crate::services::notifier::StoreNotifier;
    use diesel::connection::SimpleConnection;

    fn setup() -> (Arc<Store>, FeedService) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .with_conn(|conn| {
                conn.batch_execute(
                    "INSERT INTO institutions (id, name, created_at) VALUES ('inst-a', 'Water', 't'), ('inst-b', 'Roads', 't');
                     INSERT INTO principals (id, username, role, device_id, institution_id, created_at, updated_at) VALUES
                        ('admin', 'root', 'admin', NULL, NULL, 't', 't'),
                        ('citizen', 'anon_dev1', 'anonymous', 'dev1', NULL, 't', 't'),
                        ('staff-a', 'staff_a', 'institution_staff', NULL, 'inst-a', 't', 't'),
                        ('staff-b', 'staff_b', 'institution_staff', NULL, 'inst-b', 't', 't');",
                )?;
                Ok(())
            })
            .unwrap();
        let notifier = Arc::new(StoreNotifier::new(store.clone()));
        let service = FeedService::new(store.clone(), Arc::new(EventBus::new()), notifier);
        (store, service)
    }

    fn admin() -> Principal {
        Principal {
            id: "admin".into(),
            username: "root".into(),
            role: Role::Admin,
            registered: true,
        }
    }

    fn citizen() -> Principal {
        Principal {
            id: "citizen".into(),
            username: "anon_dev1".into(),
            role: Role::Anonymous { device_id: "dev1".into() },
            registered: false,
        }
    }

    fn post(institution: Option<&str>) -> FeedInput {
        FeedInput {
            description: "Water supply resumes on Friday".into(),
            institution_id: institution.map(str::to_string),
            link: None,
        }
    }

    fn react(kind: &str) -> ReactInput {
        ReactInput { reaction: kind.into() }
    }

    #[test]
    fn test_institution_feed_notifies_that_institution_only() {
        let (store, service) = setup();
        service.create(&admin(), &post(Some("inst-a")), None, None).unwrap();

        let counts = store
            .with_conn(|conn| {
                Ok((
                    notifications::count_unread(conn, "staff-a")?,
                    notifications::count_unread(conn, "staff-b")?,
                    notifications::count_unread(conn, "citizen")?,
                ))
            })
            .unwrap();
        assert_eq!(counts, (1, 0, 0));

        assert!(matches!(
            service.create(&citizen(), &post(None), None, None),
            Err(CivicError::Forbidden(_))
        ));
    }

    #[test]
    fn test_reaction_replaces_and_shows_as_mine() {
        let (_, service) = setup();
        let feed = service.create(&admin(), &post(None), None, None).unwrap();

        let first = service.react(&citizen(), &feed.id, &react("like")).unwrap();
        let second = service.react(&citizen(), &feed.id, &react("love")).unwrap();
        assert_eq!(first.outcome, Outcome::Recorded);
        assert_eq!(second.outcome, Outcome::Replaced);
        assert!(matches!(
            service.react(&citizen(), &feed.id, &react("angry")),
            Err(CivicError::InvalidContribution(_))
        ));

        let listed = service.list(Some(&citizen()), None, &FeedQuery::default()).unwrap();
        assert_eq!(listed[0].total_reactions, 1);
        assert_eq!(listed[0].reactions["love"], 1);
        assert_eq!(listed[0].reactions["like"], 0);
        assert_eq!(listed[0].my_reaction.as_deref(), Some("love"));
    }

    #[test]
    fn test_listing_counts_impressions_once_per_viewer() {
        let (_, service) = setup();
        service.create(&admin(), &post(None), None, None).unwrap();

        let first = service.list(None, Some("dev9"), &FeedQuery::default()).unwrap();
        assert_eq!(first[0].impressions, 1);
        let again = service.list(None, Some("dev9"), &FeedQuery::default()).unwrap();
        assert_eq!(again[0].impressions, 1);
        let other = service.list(Some(&citizen()), None, &FeedQuery::default()).unwrap();
        assert_eq!(other[0].impressions, 2);
        let nobody = service.list(None, None, &FeedQuery::default()).unwrap();
        assert_eq!(nobody[0].impressions, 2);
    }

    #[test]
    fn test_share_replaces_and_missing_feed_is_not_found() {
        let (_, service) = setup();
        let feed = service.create(&admin(), &post(None), None, None).unwrap();

        service.share(&citizen(), &feed.id, &ShareInput::default()).unwrap();
        let again = service
            .share(&citizen(), &feed.id, &ShareInput { message: Some("Tell everyone".into()) })
            .unwrap();
        assert_eq!(again.outcome, Outcome::Replaced);
        let listed = service.list(None, None, &FeedQuery::default()).unwrap();
        assert_eq!(listed[0].share_count, 1);

        assert!(matches!(
            service.share(&citizen(), "missing", &ShareInput::default()),
            Err(CivicError::NotFound(_))
        ));
    }

    #[test]
    fn test_media_and_delete() {
        let (_, service) = setup();
        let image = StoredAttachment {
            path: "3f2a9c1e-1111-2222-3333-444455556666-poster.png".into(),
            name: "poster.png".into(),
            size: 10,
        };
        let feed = service.create(&admin(), &post(None), Some(&image), None).unwrap();
        assert!(feed.has_image);

        let media = service.media(&feed.id, FeedMedia::Image).unwrap();
        assert_eq!(media.name, "poster.png");
        assert!(matches!(service.media(&feed.id, FeedMedia::Video), Err(CivicError::NotFound(_))));

        let removed = service.delete(&admin(), &feed.id).unwrap();
        assert_eq!(removed.image_path.as_deref(), Some(image.path.as_str()));
        assert!(matches!(service.delete(&admin(), &feed.id), Err(CivicError::NotFound(_))));
    }
}
