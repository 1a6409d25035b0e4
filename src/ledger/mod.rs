//! Contribution ledger
//!
//! At most one contribution of a kind per (subject, contributor):
//!
//! - votes are rejected on repeat
//! - reactions and shares replace the previous record
//! - impressions are recorded once and ignored afterwards
//!
//! Each attempt runs in one IMMEDIATE transaction, so the writer lock is
//! taken before the first read and counters never drift from the rows
//! backing them. Counter updates are relative (`col = col + 1`).
//!
//! When a device registers, its records move to the account
//! (`transfer_device_contributions`) so the pair stays unique across the
//! change of contributor key.

use std::collections::{HashMap, HashSet};

use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::db::diesel_schema::{
    feed_impressions, feed_reactions, feed_shares, feeds, poll_options, poll_vote_selections,
    poll_votes,
};
use crate::db::models::{
    current_timestamp, new_id, NewFeedImpression, NewFeedReaction, NewFeedShare, NewPollVote,
    NewVoteSelection, Poll, PollOption,
};
use crate::db::{feeds as feed_repo, polls as poll_repo};
use crate::error::{is_unique_violation, CivicError};
use crate::identity::ContributorKey;

/// Feed reaction values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionKind {
    Like,
    Love,
    Cry,
    Smile,
}

impl ReactionKind {
    pub const ALL: [ReactionKind; 4] = [
        ReactionKind::Like,
        ReactionKind::Love,
        ReactionKind::Cry,
        ReactionKind::Smile,
    ];

    pub fn parse(value: &str) -> Result<Self, CivicError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "like" => Ok(ReactionKind::Like),
            "love" => Ok(ReactionKind::Love),
            "cry" => Ok(ReactionKind::Cry),
            "smile" => Ok(ReactionKind::Smile),
            other => Err(CivicError::InvalidContribution(format!(
                "Unknown reaction '{}', expected like, love, cry or smile",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReactionKind::Like => "like",
            ReactionKind::Love => "love",
            ReactionKind::Cry => "cry",
            ReactionKind::Smile => "smile",
        }
    }
}

/// A contribution attempt and its payload
#[derive(Debug, Clone, Copy)]
pub enum Contribution<'a> {
    Vote { option_ids: &'a [String] },
    React(ReactionKind),
    Share { message: Option<&'a str> },
    Impression,
}

impl Contribution<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            Contribution::Vote { .. } => "vote",
            Contribution::React(_) => "reaction",
            Contribution::Share { .. } => "share",
            Contribution::Impression => "impression",
        }
    }
}

/// What an attempt did to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// No earlier record existed
    Recorded,
    /// An earlier record for the pair was replaced
    Replaced,
    /// Fire-once kind seen before; nothing written
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContributionRecord {
    /// Row written by this attempt; `None` when ignored
    pub id: Option<String>,
    pub kind: &'static str,
    pub subject_id: String,
    pub outcome: Outcome,
}

/// Record one contribution of `contributor` against `subject_id`
pub fn contribute(
    conn: &mut SqliteConnection,
    subject_id: &str,
    contributor: &ContributorKey,
    contribution: Contribution<'_>,
) -> Result<ContributionRecord, CivicError> {
    let kind = contribution.kind();
    let (id, outcome) = match contribution {
        Contribution::Vote { option_ids } => {
            let id = cast_vote(conn, subject_id, contributor, option_ids)?;
            (Some(id), Outcome::Recorded)
        }
        Contribution::React(reaction) => {
            let (id, outcome) = react(conn, subject_id, contributor, reaction)?;
            (Some(id), outcome)
        }
        Contribution::Share { message } => {
            let (id, outcome) = share(conn, subject_id, contributor, message)?;
            (Some(id), outcome)
        }
        Contribution::Impression => match record_impression(conn, subject_id, contributor)? {
            Some(id) => (Some(id), Outcome::Recorded),
            None => (None, Outcome::Ignored),
        },
    };

    Ok(ContributionRecord {
        id,
        kind,
        subject_id: subject_id.to_string(),
        outcome,
    })
}

// ============================================================================
// Votes
// ============================================================================

/// Check a selection against a poll and its options. Pure; `now` is an
/// ISO-8601 UTC timestamp in the store's text format.
pub fn validate_selection(
    poll: &Poll,
    options: &[PollOption],
    selection: &[String],
    now: &str,
) -> Result<(), CivicError> {
    if let Some(start) = poll.start_at.as_deref() {
        if now < start {
            return Err(CivicError::InvalidContribution(format!(
                "Poll opens at {}",
                start
            )));
        }
    }
    if let Some(end) = poll.end_at.as_deref() {
        if now > end {
            return Err(CivicError::InvalidContribution(format!("Poll closed at {}", end)));
        }
    }

    if selection.is_empty() {
        return Err(CivicError::InvalidContribution("Select at least one option".into()));
    }

    let chosen: HashSet<&str> = selection.iter().map(String::as_str).collect();
    if chosen.len() != selection.len() {
        return Err(CivicError::InvalidContribution("Duplicate options in selection".into()));
    }

    let known: HashSet<&str> = options.iter().map(|o| o.id.as_str()).collect();
    if let Some(stray) = chosen.iter().find(|id| !known.contains(*id)) {
        return Err(CivicError::InvalidContribution(format!(
            "Option {} does not belong to this poll",
            stray
        )));
    }

    if !poll.allows_multiple() && selection.len() > 1 {
        return Err(CivicError::InvalidContribution(
            "This poll accepts a single choice".into(),
        ));
    }

    let max = effective_max_choices(poll, options.len());
    if selection.len() > max {
        return Err(CivicError::InvalidContribution(format!(
            "At most {} option(s) may be selected",
            max
        )));
    }

    if selection.len() == options.len() {
        return Err(CivicError::InvalidContribution(
            "Selecting every option is not allowed".into(),
        ));
    }

    Ok(())
}

/// `max_choices` when set, else 1 for single choice, else all but one
pub fn effective_max_choices(poll: &Poll, option_count: usize) -> usize {
    match poll.max_choices {
        Some(max) => usize::try_from(max).unwrap_or(0),
        None if !poll.allows_multiple() => 1,
        None => option_count.saturating_sub(1),
    }
}

/// Cast a vote. A contributor votes once per poll; a second attempt, or
/// losing a concurrent insert, is `AlreadyContributed`.
pub fn cast_vote(
    conn: &mut SqliteConnection,
    poll_id: &str,
    contributor: &ContributorKey,
    selection: &[String],
) -> Result<String, CivicError> {
    conn.immediate_transaction(|conn| {
        let poll = poll_repo::get_poll(conn, poll_id)?
            .ok_or_else(|| CivicError::NotFound(format!("Poll {}", poll_id)))?;
        let options = poll_repo::get_options(conn, poll_id)?;

        let now = current_timestamp();
        validate_selection(&poll, &options, selection, &now)?;

        if poll_repo::find_vote(conn, poll_id, contributor)?.is_some() {
            return Err(CivicError::AlreadyContributed(format!(
                "Already voted in poll {}",
                poll_id
            )));
        }

        let vote_id = new_id();
        let inserted = diesel::insert_into(poll_votes::table)
            .values(&NewPollVote {
                id: &vote_id,
                poll_id,
                principal_id: contributor.principal_id(),
                device_id: contributor.device_id(),
                created_at: &now,
            })
            .execute(conn);
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(CivicError::AlreadyContributed(format!(
                    "Already voted in poll {}",
                    poll_id
                )))
            }
            Err(err) => return Err(err.into()),
        }

        let rows: Vec<NewVoteSelection<'_>> = selection
            .iter()
            .map(|option_id| NewVoteSelection {
                vote_id: &vote_id,
                option_id,
            })
            .collect();
        diesel::insert_into(poll_vote_selections::table)
            .values(&rows)
            .execute(conn)?;

        diesel::update(poll_options::table.filter(poll_options::id.eq_any(selection)))
            .set(poll_options::votes_count.eq(poll_options::votes_count + 1))
            .execute(conn)?;

        info!(poll = %poll_id, vote = %vote_id, choices = selection.len(), "Recorded poll vote");
        Ok(vote_id)
    })
}

// ============================================================================
// Reactions and shares
// ============================================================================

fn ensure_feed(conn: &mut SqliteConnection, feed_id: &str) -> Result<(), CivicError> {
    match feed_repo::get_feed(conn, feed_id)? {
        Some(_) => Ok(()),
        None => Err(CivicError::NotFound(format!("Feed {}", feed_id))),
    }
}

/// Set the contributor's reaction on a feed, replacing any earlier one
pub fn react(
    conn: &mut SqliteConnection,
    feed_id: &str,
    contributor: &ContributorKey,
    reaction: ReactionKind,
) -> Result<(String, Outcome), CivicError> {
    conn.immediate_transaction(|conn| {
        ensure_feed(conn, feed_id)?;

        let prior = feed_reactions::table
            .filter(feed_reactions::feed_id.eq(feed_id))
            .into_boxed();
        let prior = match contributor {
            ContributorKey::Principal(id) => prior.filter(feed_reactions::principal_id.eq(id.clone())),
            ContributorKey::Device(id) => prior.filter(feed_reactions::device_id.eq(id.clone())),
        };
        let prior_ids: Vec<String> = prior.select(feed_reactions::id).load(conn)?;
        if !prior_ids.is_empty() {
            diesel::delete(feed_reactions::table.filter(feed_reactions::id.eq_any(&prior_ids)))
                .execute(conn)?;
        }

        let id = new_id();
        let now = current_timestamp();
        diesel::insert_into(feed_reactions::table)
            .values(&NewFeedReaction {
                id: &id,
                feed_id,
                principal_id: contributor.principal_id(),
                device_id: contributor.device_id(),
                reaction: reaction.as_str(),
                created_at: &now,
            })
            .execute(conn)?;

        let outcome = if prior_ids.is_empty() {
            Outcome::Recorded
        } else {
            Outcome::Replaced
        };
        debug!(feed = %feed_id, reaction = reaction.as_str(), ?outcome, "Recorded feed reaction");
        Ok((id, outcome))
    })
}

/// Record a share of a feed, replacing any earlier share by the contributor
pub fn share(
    conn: &mut SqliteConnection,
    feed_id: &str,
    contributor: &ContributorKey,
    message: Option<&str>,
) -> Result<(String, Outcome), CivicError> {
    conn.immediate_transaction(|conn| {
        ensure_feed(conn, feed_id)?;

        let removed = match contributor {
            ContributorKey::Principal(id) => diesel::delete(
                feed_shares::table
                    .filter(feed_shares::feed_id.eq(feed_id))
                    .filter(feed_shares::principal_id.eq(id.as_str())),
            )
            .execute(conn)?,
            ContributorKey::Device(id) => diesel::delete(
                feed_shares::table
                    .filter(feed_shares::feed_id.eq(feed_id))
                    .filter(feed_shares::device_id.eq(id.as_str())),
            )
            .execute(conn)?,
        };

        let id = new_id();
        let now = current_timestamp();
        diesel::insert_into(feed_shares::table)
            .values(&NewFeedShare {
                id: &id,
                feed_id,
                principal_id: contributor.principal_id(),
                device_id: contributor.device_id(),
                message,
                created_at: &now,
            })
            .execute(conn)?;

        let outcome = if removed > 0 { Outcome::Replaced } else { Outcome::Recorded };
        debug!(feed = %feed_id, ?outcome, "Recorded feed share");
        Ok((id, outcome))
    })
}

// ============================================================================
// Impressions
// ============================================================================

/// Count a view of a feed once per contributor. Returns the marker id when
/// this call recorded the view, `None` when it had been seen already.
pub fn record_impression(
    conn: &mut SqliteConnection,
    feed_id: &str,
    contributor: &ContributorKey,
) -> Result<Option<String>, CivicError> {
    conn.immediate_transaction(|conn| {
        let id = new_id();
        let now = current_timestamp();
        let inserted = diesel::insert_or_ignore_into(feed_impressions::table)
            .values(&NewFeedImpression {
                id: &id,
                feed_id,
                principal_id: contributor.principal_id(),
                device_id: contributor.device_id(),
                created_at: &now,
            })
            .execute(conn)?;

        if inserted == 0 {
            return Ok(None);
        }

        diesel::update(feeds::table.filter(feeds::id.eq(feed_id)))
            .set(feeds::impressions.eq(feeds::impressions + 1))
            .execute(conn)?;
        Ok(Some(id))
    })
}

// ============================================================================
// Registration
// ============================================================================

/// Rows moved from a device onto the account that registered it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transferred {
    pub votes: usize,
    pub reactions: usize,
    pub shares: usize,
    pub impressions: usize,
}

/// `(subject_id, row_id, created_at)` of one stored contribution
type Held = (String, String, String);

#[derive(Debug, Clone, Copy)]
enum Keep {
    Earlier,
    Later,
}

/// Rows that lose when the device and the account both hold a record for the
/// same subject, as `(subject_id, row_id)`
fn collapse(account: &[Held], device: &[Held], keep: Keep) -> Vec<(String, String)> {
    let account: HashMap<&str, (&str, &str)> = account
        .iter()
        .map(|(subject, id, at)| (subject.as_str(), (id.as_str(), at.as_str())))
        .collect();

    device
        .iter()
        .filter_map(|(subject, id, at)| {
            let (account_id, account_at) = account.get(subject.as_str())?;
            let device_wins = match keep {
                Keep::Earlier => at.as_str() < *account_at,
                Keep::Later => at.as_str() > *account_at,
            };
            let loser = if device_wins { account_id.to_string() } else { id.clone() };
            Some((subject.clone(), loser))
        })
        .collect()
}

/// Re-key everything recorded under `device_id` to `principal_id`.
///
/// Records both keys hold for one subject collapse by their kind's rule: the
/// earlier vote stands, the later reaction or share stands, and a single
/// impression remains counted. Must run inside the caller's transaction.
pub fn transfer_device_contributions(
    conn: &mut SqliteConnection,
    device_id: &str,
    principal_id: &str,
) -> Result<Transferred, CivicError> {
    let moved = Transferred {
        votes: transfer_votes(conn, device_id, principal_id)?,
        reactions: transfer_reactions(conn, device_id, principal_id)?,
        shares: transfer_shares(conn, device_id, principal_id)?,
        impressions: transfer_impressions(conn, device_id, principal_id)?,
    };
    if moved != Transferred::default() {
        info!(principal = %principal_id, ?moved, "Moved device contributions to account");
    }
    Ok(moved)
}

fn transfer_votes(conn: &mut SqliteConnection, device_id: &str, principal_id: &str) -> Result<usize, CivicError> {
    let account: Vec<Held> = poll_votes::table
        .filter(poll_votes::principal_id.eq(principal_id))
        .select((poll_votes::poll_id, poll_votes::id, poll_votes::created_at))
        .load(conn)?;
    let device: Vec<Held> = poll_votes::table
        .filter(poll_votes::device_id.eq(device_id))
        .select((poll_votes::poll_id, poll_votes::id, poll_votes::created_at))
        .load(conn)?;

    let losers: Vec<String> = collapse(&account, &device, Keep::Earlier)
        .into_iter()
        .map(|(_, id)| id)
        .collect();
    if !losers.is_empty() {
        let released: Vec<String> = poll_vote_selections::table
            .filter(poll_vote_selections::vote_id.eq_any(&losers))
            .select(poll_vote_selections::option_id)
            .load(conn)?;
        for option_id in &released {
            diesel::update(poll_options::table.filter(poll_options::id.eq(option_id)))
                .set(poll_options::votes_count.eq(poll_options::votes_count - 1))
                .execute(conn)?;
        }
        diesel::delete(poll_vote_selections::table.filter(poll_vote_selections::vote_id.eq_any(&losers)))
            .execute(conn)?;
        diesel::delete(poll_votes::table.filter(poll_votes::id.eq_any(&losers))).execute(conn)?;
    }

    Ok(diesel::update(poll_votes::table.filter(poll_votes::device_id.eq(device_id)))
        .set((
            poll_votes::principal_id.eq(principal_id),
            poll_votes::device_id.eq(None::<&str>),
        ))
        .execute(conn)?)
}

fn transfer_reactions(conn: &mut SqliteConnection, device_id: &str, principal_id: &str) -> Result<usize, CivicError> {
    let account: Vec<Held> = feed_reactions::table
        .filter(feed_reactions::principal_id.eq(principal_id))
        .select((feed_reactions::feed_id, feed_reactions::id, feed_reactions::created_at))
        .load(conn)?;
    let device: Vec<Held> = feed_reactions::table
        .filter(feed_reactions::device_id.eq(device_id))
        .select((feed_reactions::feed_id, feed_reactions::id, feed_reactions::created_at))
        .load(conn)?;

    let losers: Vec<String> = collapse(&account, &device, Keep::Later)
        .into_iter()
        .map(|(_, id)| id)
        .collect();
    if !losers.is_empty() {
        diesel::delete(feed_reactions::table.filter(feed_reactions::id.eq_any(&losers))).execute(conn)?;
    }

    Ok(diesel::update(feed_reactions::table.filter(feed_reactions::device_id.eq(device_id)))
        .set((
            feed_reactions::principal_id.eq(principal_id),
            feed_reactions::device_id.eq(None::<&str>),
        ))
        .execute(conn)?)
}

fn transfer_shares(conn: &mut SqliteConnection, device_id: &str, principal_id: &str) -> Result<usize, CivicError> {
    let account: Vec<Held> = feed_shares::table
        .filter(feed_shares::principal_id.eq(principal_id))
        .select((feed_shares::feed_id, feed_shares::id, feed_shares::created_at))
        .load(conn)?;
    let device: Vec<Held> = feed_shares::table
        .filter(feed_shares::device_id.eq(device_id))
        .select((feed_shares::feed_id, feed_shares::id, feed_shares::created_at))
        .load(conn)?;

    let losers: Vec<String> = collapse(&account, &device, Keep::Later)
        .into_iter()
        .map(|(_, id)| id)
        .collect();
    if !losers.is_empty() {
        diesel::delete(feed_shares::table.filter(feed_shares::id.eq_any(&losers))).execute(conn)?;
    }

    Ok(diesel::update(feed_shares::table.filter(feed_shares::device_id.eq(device_id)))
        .set((
            feed_shares::principal_id.eq(principal_id),
            feed_shares::device_id.eq(None::<&str>),
        ))
        .execute(conn)?)
}

fn transfer_impressions(conn: &mut SqliteConnection, device_id: &str, principal_id: &str) -> Result<usize, CivicError> {
    let account: Vec<Held> = feed_impressions::table
        .filter(feed_impressions::principal_id.eq(principal_id))
        .select((feed_impressions::feed_id, feed_impressions::id, feed_impressions::created_at))
        .load(conn)?;
    let device: Vec<Held> = feed_impressions::table
        .filter(feed_impressions::device_id.eq(device_id))
        .select((feed_impressions::feed_id, feed_impressions::id, feed_impressions::created_at))
        .load(conn)?;

    for (feed_id, loser) in collapse(&account, &device, Keep::Earlier) {
        diesel::delete(feed_impressions::table.filter(feed_impressions::id.eq(&loser))).execute(conn)?;
        diesel::update(feeds::table.filter(feeds::id.eq(&feed_id)))
            .set(feeds::impressions.eq(feeds::impressions - 1))
            .execute(conn)?;
    }

    Ok(diesel::update(feed_impressions::table.filter(feed_impressions::device_id.eq(device_id)))
        .set((
            feed_impressions::principal_id.eq(principal_id),
            feed_impressions::device_id.eq(None::<&str>),
        ))
        .execute(conn)?)
}
