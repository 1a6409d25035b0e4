//! Poll operations
//!
//! Vote rows are written by the contribution ledger; this module covers
//! poll definitions and the read side of votes.

use diesel::prelude::*;

use super::diesel_schema::{poll_options, poll_vote_selections, poll_votes, polls};
use super::models::{new_id, NewPoll, NewPollOption, Poll, PollOption, PollVote};
use crate::error::CivicError;
use crate::identity::ContributorKey;

/// Full replacement of a poll's definition columns
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = polls)]
#[diesel(treat_none_as_null = true)]
pub struct PollDefinition<'a> {
    pub question: &'a str,
    pub allow_multiple: i32,
    pub max_choices: Option<i32>,
    pub start_at: Option<&'a str>,
    pub end_at: Option<&'a str>,
    pub show_results: i32,
    pub updated_at: &'a str,
}

pub fn insert_poll(
    conn: &mut SqliteConnection,
    new: &NewPoll<'_>,
    options: &[String],
) -> Result<Poll, CivicError> {
    diesel::insert_into(polls::table).values(new).execute(conn)?;
    insert_options(conn, new.id, options)?;
    get_poll(conn, new.id)?
        .ok_or_else(|| CivicError::Internal(format!("Poll {} vanished after insert", new.id)))
}

fn insert_options(conn: &mut SqliteConnection, poll_id: &str, options: &[String]) -> Result<(), CivicError> {
    let ids: Vec<String> = options.iter().map(|_| new_id()).collect();
    let rows: Vec<NewPollOption<'_>> = options
        .iter()
        .zip(ids.iter())
        .enumerate()
        .map(|(position, (text, id))| NewPollOption {
            id,
            poll_id,
            text,
            position: position as i32,
        })
        .collect();

    diesel::insert_into(poll_options::table)
        .values(&rows)
        .execute(conn)?;
    Ok(())
}

pub fn get_poll(conn: &mut SqliteConnection, poll_id: &str) -> Result<Option<Poll>, CivicError> {
    Ok(polls::table
        .filter(polls::id.eq(poll_id))
        .first(conn)
        .optional()?)
}

pub fn list_polls(conn: &mut SqliteConnection, limit: i64, offset: i64) -> Result<Vec<Poll>, CivicError> {
    Ok(polls::table
        .order((polls::created_at.desc(), polls::id.desc()))
        .limit(limit.clamp(1, 500))
        .offset(offset.max(0))
        .load(conn)?)
}

/// Options of one poll in display order
pub fn get_options(conn: &mut SqliteConnection, poll_id: &str) -> Result<Vec<PollOption>, CivicError> {
    Ok(poll_options::table
        .filter(poll_options::poll_id.eq(poll_id))
        .order(poll_options::position.asc())
        .load(conn)?)
}

/// Options of several polls in one query
pub fn options_for_polls(
    conn: &mut SqliteConnection,
    poll_ids: &[String],
) -> Result<Vec<PollOption>, CivicError> {
    Ok(poll_options::table
        .filter(poll_options::poll_id.eq_any(poll_ids))
        .order((poll_options::poll_id.asc(), poll_options::position.asc()))
        .load(conn)?)
}

/// Replace a poll's definition. When `options` is given the option set and
/// every recorded vote are replaced too, since old votes point at options
/// that no longer exist.
pub fn replace_poll(
    conn: &mut SqliteConnection,
    poll_id: &str,
    definition: &PollDefinition<'_>,
    options: Option<&[String]>,
) -> Result<Option<Poll>, CivicError> {
    let updated = diesel::update(polls::table.filter(polls::id.eq(poll_id)))
        .set(definition)
        .execute(conn)?;
    if updated == 0 {
        return Ok(None);
    }

    if let Some(options) = options {
        diesel::delete(poll_votes::table.filter(poll_votes::poll_id.eq(poll_id))).execute(conn)?;
        diesel::delete(poll_options::table.filter(poll_options::poll_id.eq(poll_id))).execute(conn)?;
        insert_options(conn, poll_id, options)?;
    }

    get_poll(conn, poll_id)
}

pub fn delete_poll(conn: &mut SqliteConnection, poll_id: &str) -> Result<bool, CivicError> {
    let deleted = diesel::delete(polls::table.filter(polls::id.eq(poll_id))).execute(conn)?;
    Ok(deleted > 0)
}

// ============================================================================
// Vote reads
// ============================================================================

pub fn find_vote(
    conn: &mut SqliteConnection,
    poll_id: &str,
    contributor: &ContributorKey,
) -> Result<Option<PollVote>, CivicError> {
    let q = poll_votes::table
        .filter(poll_votes::poll_id.eq(poll_id))
        .into_boxed();

    let q = match contributor {
        ContributorKey::Principal(id) => q.filter(poll_votes::principal_id.eq(id.clone())),
        ContributorKey::Device(id) => q.filter(poll_votes::device_id.eq(id.clone())),
    };

    Ok(q.first(conn).optional()?)
}

/// Subset of `poll_ids` the contributor has voted in
pub fn voted_poll_ids(
    conn: &mut SqliteConnection,
    contributor: &ContributorKey,
    poll_ids: &[String],
) -> Result<Vec<String>, CivicError> {
    let q = poll_votes::table
        .filter(poll_votes::poll_id.eq_any(poll_ids))
        .select(poll_votes::poll_id)
        .into_boxed();

    let q = match contributor {
        ContributorKey::Principal(id) => q.filter(poll_votes::principal_id.eq(id.clone())),
        ContributorKey::Device(id) => q.filter(poll_votes::device_id.eq(id.clone())),
    };

    Ok(q.load(conn)?)
}

pub fn count_voters(conn: &mut SqliteConnection, poll_id: &str) -> Result<i64, CivicError> {
    Ok(poll_votes::table
        .filter(poll_votes::poll_id.eq(poll_id))
        .count()
        .get_result(conn)?)
}

/// Option IDs chosen in one vote
pub fn vote_selections(conn: &mut SqliteConnection, vote_id: &str) -> Result<Vec<String>, CivicError> {
    Ok(poll_vote_selections::table
        .filter(poll_vote_selections::vote_id.eq(vote_id))
        .select(poll_vote_selections::option_id)
        .load(conn)?)
}
