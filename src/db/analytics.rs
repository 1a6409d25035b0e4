//! Read-only fact queries behind the admin analytics report
//!
//! Each query returns raw rows narrowed by a creation-time window; the
//! analytics service does the grouping.

use diesel::prelude::*;

use super::diesel_schema::{feed_reactions, feeds, messages, poll_vote_selections, poll_votes, polls};
use super::models::Poll;
use crate::error::CivicError;

/// Inclusive window over `created_at`, in the store's timestamp format
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub start: Option<String>,
    pub end: Option<String>,
}

/// `(institution_id, department_id, problem_type, created_at)` per message
pub type MessageFact = (String, Option<String>, Option<String>, String);

pub fn message_facts(
    conn: &mut SqliteConnection,
    range: &TimeRange,
    institution_id: Option<&str>,
) -> Result<Vec<MessageFact>, CivicError> {
    let mut q = messages::table
        .select((
            messages::institution_id,
            messages::department_id,
            messages::problem_type,
            messages::created_at,
        ))
        .into_boxed();

    if let Some(start) = &range.start {
        q = q.filter(messages::created_at.ge(start.clone()));
    }
    if let Some(end) = &range.end {
        q = q.filter(messages::created_at.le(end.clone()));
    }
    if let Some(inst) = institution_id {
        q = q.filter(messages::institution_id.eq(inst.to_string()));
    }
    Ok(q.load(conn)?)
}

/// `(poll_id, vote_id, option_id)` for every selection of a vote cast in range
pub fn vote_selection_facts(
    conn: &mut SqliteConnection,
    range: &TimeRange,
) -> Result<Vec<(String, String, String)>, CivicError> {
    let mut q = poll_vote_selections::table
        .inner_join(poll_votes::table)
        .select((poll_votes::poll_id, poll_votes::id, poll_vote_selections::option_id))
        .into_boxed();

    if let Some(start) = &range.start {
        q = q.filter(poll_votes::created_at.ge(start.clone()));
    }
    if let Some(end) = &range.end {
        q = q.filter(poll_votes::created_at.le(end.clone()));
    }
    Ok(q.load(conn)?)
}

/// `(feed_id, reaction)` for every reaction recorded in range
pub fn reaction_facts(
    conn: &mut SqliteConnection,
    range: &TimeRange,
) -> Result<Vec<(String, String)>, CivicError> {
    let mut q = feed_reactions::table
        .select((feed_reactions::feed_id, feed_reactions::reaction))
        .into_boxed();

    if let Some(start) = &range.start {
        q = q.filter(feed_reactions::created_at.ge(start.clone()));
    }
    if let Some(end) = &range.end {
        q = q.filter(feed_reactions::created_at.le(end.clone()));
    }
    Ok(q.load(conn)?)
}

/// `(feed_id, created_at)` of every feed, optionally for one institution
pub fn feed_headers(
    conn: &mut SqliteConnection,
    institution_id: Option<&str>,
) -> Result<Vec<(String, String)>, CivicError> {
    let mut q = feeds::table
        .select((feeds::id, feeds::created_at))
        .order(feeds::created_at.desc())
        .into_boxed();
    if let Some(inst) = institution_id {
        q = q.filter(feeds::institution_id.eq(inst.to_string()));
    }
    Ok(q.load(conn)?)
}

/// Every poll, newest first
pub fn all_polls(conn: &mut SqliteConnection) -> Result<Vec<Poll>, CivicError> {
    Ok(polls::table
        .order((polls::created_at.desc(), polls::id.desc()))
        .load(conn)?)
}
