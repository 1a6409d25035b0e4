//! Poll service - admin-managed polls and voting

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::SqliteConnection;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Config;
use crate::db::models::{current_timestamp, flag, new_id, NewPoll, Poll, PollOption};
use crate::db::polls::{self, PollDefinition};
use crate::db::Store;
use crate::error::CivicError;
use crate::identity::{ContributorKey, Principal};
use crate::ledger::{self, Contribution, ContributionRecord};

use super::events::{CivicEvent, EventBus};
use super::notifier::{Audience, Notice, NotificationDispatcher, NotificationKind};
use super::{require_admin, required_text, viewer_key};

const MAX_QUESTION_CHARS: usize = 500;
const MAX_OPTION_CHARS: usize = 200;

/// Poll definition as sent on create and on full replacement
#[derive(Debug, Clone, Deserialize)]
pub struct PollInput {
    pub question: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub allow_multiple: bool,
    #[serde(default)]
    pub max_choices: Option<i32>,
    /// RFC 3339; stored normalized to UTC
    #[serde(default)]
    pub start_at: Option<String>,
    #[serde(default)]
    pub end_at: Option<String>,
    #[serde(default = "default_show_results")]
    pub show_results: bool,
}

fn default_show_results() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoteInput {
    pub option_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptionView {
    pub id: String,
    pub text: String,
    /// Hidden unless the poll shows results or the viewer is staff
    #[serde(skip_serializing_if = "Option::is_none")]
    pub votes_count: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollView {
    pub id: String,
    pub question: String,
    pub allow_multiple: bool,
    pub max_choices: usize,
    pub start_at: Option<String>,
    pub end_at: Option<String>,
    pub show_results: bool,
    pub is_open: bool,
    pub has_voted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_voters: Option<i64>,
    pub options: Vec<OptionView>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteResult {
    pub vote: ContributionRecord,
    pub poll: PollView,
}

/// Validated, normalized poll definition
struct CleanPoll<'a> {
    question: &'a str,
    options: Vec<String>,
    allow_multiple: bool,
    max_choices: Option<i32>,
    start_at: Option<String>,
    end_at: Option<String>,
    show_results: bool,
}

pub struct PollService {
    store: Arc<Store>,
    config: Arc<Config>,
    events: Arc<EventBus>,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl PollService {
    pub fn new(
        store: Arc<Store>,
        config: Arc<Config>,
        events: Arc<EventBus>,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            store,
            config,
            events,
            notifier,
        }
    }

    pub fn create(&self, admin: &Principal, input: &PollInput) -> Result<PollView, CivicError> {
        require_admin(admin)?;
        let clean = self.clean(input)?;

        let id = new_id();
        let now = current_timestamp();
        let view = self.store.with_conn(|conn| {
            let poll = conn.immediate_transaction::<_, CivicError, _>(|conn| {
                polls::insert_poll(
                    conn,
                    &NewPoll {
                        id: &id,
                        question: clean.question,
                        allow_multiple: flag(clean.allow_multiple),
                        max_choices: clean.max_choices,
                        start_at: clean.start_at.as_deref(),
                        end_at: clean.end_at.as_deref(),
                        show_results: flag(clean.show_results),
                        created_by: &admin.id,
                        created_at: &now,
                        updated_at: &now,
                    },
                    &clean.options,
                )
            })?;
            self.view(conn, poll, None, true)
        })?;

        info!(poll = %view.id, options = view.options.len(), by = %admin.id, "Poll created");
        self.events.emit(CivicEvent::PollCreated { id: view.id.clone() });
        self.notifier.dispatch(Notice::new(
            Audience::NonAdmins { institution_id: None },
            NotificationKind::Poll,
            "New Poll",
            &view.question,
            "poll",
            view.id.clone(),
        ));
        Ok(view)
    }

    /// Newest first, each flagged with whether the viewer has voted
    pub fn list(
        &self,
        principal: Option<&Principal>,
        device_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<PollView>, CivicError> {
        let viewer = viewer_key(principal, device_id);
        let staff = principal.is_some_and(|p| p.role.is_staff());

        self.store.with_conn(|conn| {
            let rows = polls::list_polls(conn, limit, offset)?;
            let ids: Vec<String> = rows.iter().map(|p| p.id.clone()).collect();

            let mut options: HashMap<String, Vec<PollOption>> = HashMap::new();
            for option in polls::options_for_polls(conn, &ids)? {
                options.entry(option.poll_id.clone()).or_default().push(option);
            }
            let voted: HashSet<String> = match &viewer {
                Some(key) => polls::voted_poll_ids(conn, key, &ids)?.into_iter().collect(),
                None => HashSet::new(),
            };

            let mut views = Vec::with_capacity(rows.len());
            for poll in rows {
                let opts = options.remove(&poll.id).unwrap_or_default();
                let has_voted = voted.contains(&poll.id);
                let total = if poll.shows_results() || staff {
                    Some(polls::count_voters(conn, &poll.id)?)
                } else {
                    None
                };
                views.push(render(poll, opts, has_voted, total, staff));
            }
            Ok(views)
        })
    }

    pub fn get(
        &self,
        principal: Option<&Principal>,
        device_id: Option<&str>,
        poll_id: &str,
    ) -> Result<PollView, CivicError> {
        let viewer = viewer_key(principal, device_id);
        let staff = principal.is_some_and(|p| p.role.is_staff());
        self.store.with_conn(|conn| {
            let poll = load(conn, poll_id)?;
            self.view(conn, poll, viewer.as_ref(), staff)
        })
    }

    /// Full replacement. Changing the option texts replaces the options and
    /// discards every vote cast so far.
    pub fn replace(&self, admin: &Principal, poll_id: &str, input: &PollInput) -> Result<PollView, CivicError> {
        require_admin(admin)?;
        let clean = self.clean(input)?;
        let now = current_timestamp();

        let (view, options_replaced) = self.store.with_conn(|conn| {
            let (poll, options_replaced) = conn.immediate_transaction::<_, CivicError, _>(|conn| {
                let existing: Vec<String> = polls::get_options(conn, poll_id)?
                    .into_iter()
                    .map(|o| o.text)
                    .collect();
                let options_replaced = existing != clean.options;

                let definition = PollDefinition {
                    question: clean.question,
                    allow_multiple: flag(clean.allow_multiple),
                    max_choices: clean.max_choices,
                    start_at: clean.start_at.as_deref(),
                    end_at: clean.end_at.as_deref(),
                    show_results: flag(clean.show_results),
                    updated_at: &now,
                };
                let new_options = options_replaced.then_some(clean.options.as_slice());
                let poll = polls::replace_poll(conn, poll_id, &definition, new_options)?
                    .ok_or_else(|| CivicError::NotFound(format!("Poll {}", poll_id)))?;
                Ok((poll, options_replaced))
            })?;
            Ok((self.view(conn, poll, None, true)?, options_replaced))
        })?;

        info!(poll = %poll_id, options_replaced, by = %admin.id, "Poll replaced");
        self.events.emit(CivicEvent::PollReplaced {
            id: poll_id.to_string(),
            options_replaced,
        });
        Ok(view)
    }

    pub fn delete(&self, admin: &Principal, poll_id: &str) -> Result<(), CivicError> {
        require_admin(admin)?;
        if !self.store.with_conn(|conn| polls::delete_poll(conn, poll_id))? {
            return Err(CivicError::NotFound(format!("Poll {}", poll_id)));
        }
        info!(poll = %poll_id, by = %admin.id, "Poll deleted");
        self.events.emit(CivicEvent::PollDeleted { id: poll_id.to_string() });
        Ok(())
    }

    /// One vote per contributor per poll
    pub fn vote(&self, principal: &Principal, poll_id: &str, input: &VoteInput) -> Result<VoteResult, CivicError> {
        let key = principal.contributor();
        let selection: Vec<String> = input.option_ids.iter().map(|id| id.trim().to_string()).collect();
        let staff = principal.role.is_staff();

        let (vote, poll) = self.store.with_conn(|conn| {
            let vote = ledger::contribute(conn, poll_id, &key, Contribution::Vote { option_ids: &selection })?;
            let poll = load(conn, poll_id)?;
            Ok((vote, self.view(conn, poll, Some(&key), staff)?))
        })?;

        self.events.emit(CivicEvent::VoteCast {
            poll_id: poll_id.to_string(),
            choices: selection.len(),
        });
        Ok(VoteResult { vote, poll })
    }

    fn view(
        &self,
        conn: &mut SqliteConnection,
        poll: Poll,
        viewer: Option<&ContributorKey>,
        staff: bool,
    ) -> Result<PollView, CivicError> {
        let options = polls::get_options(conn, &poll.id)?;
        let has_voted = match viewer {
            Some(key) => polls::find_vote(conn, &poll.id, key)?.is_some(),
            None => false,
        };
        let total = if poll.shows_results() || staff {
            Some(polls::count_voters(conn, &poll.id)?)
        } else {
            None
        };
        Ok(render(poll, options, has_voted, total, staff))
    }

    fn clean<'a>(&self, input: &'a PollInput) -> Result<CleanPoll<'a>, CivicError> {
        let question = required_text("question", &input.question, MAX_QUESTION_CHARS)?;

        let mut options = Vec::with_capacity(input.options.len());
        let mut seen = HashSet::new();
        for text in &input.options {
            let text = required_text("option", text, MAX_OPTION_CHARS)?;
            if !seen.insert(text.to_lowercase()) {
                return Err(CivicError::InvalidInput(format!("Duplicate option '{}'", text)));
            }
            options.push(text.to_string());
        }
        let (min, max) = (self.config.min_poll_options, self.config.max_poll_options);
        if options.len() < min || options.len() > max {
            return Err(CivicError::InvalidInput(format!(
                "A poll needs between {} and {} options",
                min, max
            )));
        }

        match (input.allow_multiple, input.max_choices) {
            (false, Some(n)) if n != 1 => {
                return Err(CivicError::InvalidInput(
                    "Single-choice polls allow exactly one choice".into(),
                ))
            }
            // Choosing every option is never accepted, so the cap stays below it
            (true, Some(n)) if n < 1 || n as usize >= options.len() => {
                return Err(CivicError::InvalidInput(format!(
                    "max_choices must be between 1 and {}",
                    options.len() - 1
                )))
            }
            _ => {}
        }

        let start_at = input.start_at.as_deref().map(normalize_timestamp).transpose()?;
        let end_at = input.end_at.as_deref().map(normalize_timestamp).transpose()?;
        if let (Some(start), Some(end)) = (&start_at, &end_at) {
            if end <= start {
                return Err(CivicError::InvalidInput("end_at must be after start_at".into()));
            }
        }

        Ok(CleanPoll {
            question,
            options,
            allow_multiple: input.allow_multiple,
            max_choices: input.max_choices,
            start_at,
            end_at,
            show_results: input.show_results,
        })
    }
}

fn load(conn: &mut SqliteConnection, poll_id: &str) -> Result<Poll, CivicError> {
    polls::get_poll(conn, poll_id)?.ok_or_else(|| CivicError::NotFound(format!("Poll {}", poll_id)))
}

fn render(poll: Poll, options: Vec<PollOption>, has_voted: bool, total: Option<i64>, staff: bool) -> PollView {
    let reveal = poll.shows_results() || staff;
    let now = current_timestamp();
    let is_open = poll.start_at.as_deref().map_or(true, |s| now.as_str() >= s)
        && poll.end_at.as_deref().map_or(true, |e| now.as_str() <= e);

    PollView {
        max_choices: ledger::effective_max_choices(&poll, options.len()),
        allow_multiple: poll.allows_multiple(),
        show_results: poll.shows_results(),
        is_open,
        has_voted,
        total_voters: total,
        options: options
            .into_iter()
            .map(|o| OptionView {
                id: o.id,
                text: o.text,
                votes_count: reveal.then_some(o.votes_count),
            })
            .collect(),
        id: poll.id,
        question: poll.question,
        start_at: poll.start_at,
        end_at: poll.end_at,
        created_at: poll.created_at,
        updated_at: poll.updated_at,
    }
}

/// RFC 3339, or a bare `YYYY-MM-DDTHH:MM:SS` read as UTC, to the store's
/// text format
fn normalize_timestamp(raw: &str) -> Result<String, CivicError> {
    let raw = raw.trim();
    let utc = match DateTime::parse_from_rfc3339(raw) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(_) => NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
            .map(|naive| naive.and_utc())
            .map_err(|_| CivicError::InvalidInput(format!("Invalid timestamp '{}'", raw)))?,
    };
    Ok(utc.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::notifications;
    use crate::identity::Role;
    use crate::services::notifier::StoreNotifier;
    use diesel::connection::SimpleConnection;

    fn setup() -> (Arc<Store>, PollService) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .with_conn(|conn| {
                conn.batch_execute(
                    "INSERT INTO institutions (id, name, created_at) VALUES ('inst-a', 'Water', 't');
                     INSERT INTO principals (id, username, role, device_id, institution_id, created_at, updated_at) VALUES
                        ('admin', 'root', 'admin', NULL, NULL, 't', 't'),
                        ('citizen', 'anon_dev1', 'anonymous', 'dev1', NULL, 't', 't'),
                        ('staff-a', 'staff_a', 'institution_staff', NULL, 'inst-a', 't', 't');",
                )?;
                Ok(())
            })
            .unwrap();
        let notifier = Arc::new(StoreNotifier::new(store.clone()));
        let service = PollService::new(
            store.clone(),
            Arc::new(Config::default()),
            Arc::new(EventBus::new()),
            notifier,
        );
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

    fn input(options: &[&str], allow_multiple: bool, show_results: bool) -> PollInput {
        PollInput {
            question: "Which road should be repaired first?".into(),
            options: options.iter().map(|s| s.to_string()).collect(),
            allow_multiple,
            max_choices: None,
            start_at: None,
            end_at: None,
            show_results,
        }
    }

    fn vote(ids: &[&str]) -> VoteInput {
        VoteInput {
            option_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_create_validates_and_notifies_non_admins() {
        let (store, service) = setup();
        assert!(matches!(
            service.create(&citizen(), &input(&["A", "B"], false, true)),
            Err(CivicError::Forbidden(_))
        ));
        assert!(matches!(
            service.create(&admin(), &input(&["A"], false, true)),
            Err(CivicError::InvalidInput(_))
        ));
        assert!(matches!(
            service.create(&admin(), &input(&["A", "a"], false, true)),
            Err(CivicError::InvalidInput(_))
        ));

        let poll = service.create(&admin(), &input(&["A", "B"], false, true)).unwrap();
        assert_eq!(poll.max_choices, 1);

        let (citizen_unread, staff_unread, admin_unread) = store
            .with_conn(|conn| {
                Ok((
                    notifications::count_unread(conn, "citizen")?,
                    notifications::count_unread(conn, "staff-a")?,
                    notifications::count_unread(conn, "admin")?,
                ))
            })
            .unwrap();
        assert_eq!((citizen_unread, staff_unread, admin_unread), (1, 1, 0));
    }

    #[test]
    fn test_single_choice_vote_once() {
        let (_, service) = setup();
        let poll = service.create(&admin(), &input(&["O1", "O2", "O3"], false, true)).unwrap();
        let o1 = poll.options[0].id.clone();
        let o2 = poll.options[1].id.clone();

        assert!(matches!(
            service.vote(&citizen(), &poll.id, &vote(&[&o1, &o2])),
            Err(CivicError::InvalidContribution(_))
        ));
        let result = service.vote(&citizen(), &poll.id, &vote(&[&o1])).unwrap();
        assert!(result.poll.has_voted);
        assert_eq!(result.poll.options[0].votes_count, Some(1));

        assert!(matches!(
            service.vote(&citizen(), &poll.id, &vote(&[&o2])),
            Err(CivicError::AlreadyContributed(_))
        ));
        let after = service.get(None, Some("dev1"), &poll.id).unwrap();
        assert!(after.has_voted);
        assert_eq!(after.options[0].votes_count, Some(1));
        assert_eq!(after.options[1].votes_count, Some(0));
        assert_eq!(after.total_voters, Some(1));
    }

    #[test]
    fn test_hidden_results_visible_to_staff_only() {
        let (_, service) = setup();
        let poll = service.create(&admin(), &input(&["A", "B"], false, false)).unwrap();

        let listed = service.list(Some(&citizen()), None, 50, 0).unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].options.iter().all(|o| o.votes_count.is_none()));
        assert!(listed[0].total_voters.is_none());

        let staff = Principal {
            id: "staff-a".into(),
            username: "staff_a".into(),
            role: Role::InstitutionStaff { institution_id: "inst-a".into() },
            registered: true,
        };
        let seen = service.get(Some(&staff), None, &poll.id).unwrap();
        assert!(seen.options.iter().all(|o| o.votes_count == Some(0)));
    }

    #[test]
    fn test_replace_with_new_options_discards_votes() {
        let (_, service) = setup();
        let poll = service.create(&admin(), &input(&["A", "B", "C"], false, true)).unwrap();
        service.vote(&citizen(), &poll.id, &vote(&[&poll.options[0].id])).unwrap();

        let mut same = input(&["A", "B", "C"], false, true);
        same.question = "Renamed".into();
        let kept = service.replace(&admin(), &poll.id, &same).unwrap();
        assert_eq!(kept.question, "Renamed");
        assert_eq!(kept.total_voters, Some(1));

        let changed = service
            .replace(&admin(), &poll.id, &input(&["X", "Y"], false, true))
            .unwrap();
        assert_eq!(changed.total_voters, Some(0));
        assert!(!service.get(None, Some("dev1"), &poll.id).unwrap().has_voted);

        service.delete(&admin(), &poll.id).unwrap();
        assert!(matches!(service.delete(&admin(), &poll.id), Err(CivicError::NotFound(_))));
    }

    #[test]
    fn test_time_window_and_caps_validated() {
        let (_, service) = setup();
        let mut windowed = input(&["A", "B", "C"], true, true);
        windowed.start_at = Some("2030-01-01T03:00:00+03:00".into());
        windowed.end_at = Some("2030-01-02T00:00:00".into());
        let poll = service.create(&admin(), &windowed).unwrap();
        assert_eq!(poll.start_at.as_deref(), Some("2030-01-01T00:00:00Z"));
        assert!(!poll.is_open);
        assert!(matches!(
            service.vote(&citizen(), &poll.id, &vote(&[&poll.options[0].id])),
            Err(CivicError::InvalidContribution(_))
        ));

        let mut backwards = input(&["A", "B"], false, true);
        backwards.start_at = Some("2030-01-02T00:00:00Z".into());
        backwards.end_at = Some("2030-01-01T00:00:00Z".into());
        assert!(service.create(&admin(), &backwards).is_err());

        let mut too_many = input(&["A", "B", "C"], true, true);
        too_many.max_choices = Some(3);
        assert!(matches!(service.create(&admin(), &too_many), Err(CivicError::InvalidInput(_))));
    }
}
