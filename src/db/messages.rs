//! Message and reply operations

use diesel::prelude::*;
use serde::Deserialize;

use super::diesel_schema::{messages, replies};
use super::models::{current_timestamp, Message, NewMessage, NewReply, Reply};
use super::principals::{ROLE_ADMIN, ROLE_DEPARTMENT_STAFF, ROLE_INSTITUTION_STAFF};
use crate::access::{ReplyVisibility, ScopeFilter};
use crate::error::CivicError;

pub const MESSAGE_STATUSES: [&str; 4] = ["pending", "answered", "solved", "help_received"];

/// Query parameters for listing messages
#[derive(Debug, Clone, Deserialize)]
pub struct MessageQuery {
    #[serde(default)]
    pub institution: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    100
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            institution: None,
            department: None,
            status: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

pub fn insert_message(conn: &mut SqliteConnection, new: &NewMessage<'_>) -> Result<Message, CivicError> {
    diesel::insert_into(messages::table).values(new).execute(conn)?;
    get_message(conn, new.id)?
        .ok_or_else(|| CivicError::Internal(format!("Message {} vanished after insert", new.id)))
}

pub fn get_message(conn: &mut SqliteConnection, message_id: &str) -> Result<Option<Message>, CivicError> {
    Ok(messages::table
        .filter(messages::id.eq(message_id))
        .first(conn)
        .optional()?)
}

/// Messages a sender created at or after `since`
pub fn count_messages_since(
    conn: &mut SqliteConnection,
    sender_id: &str,
    since: &str,
) -> Result<i64, CivicError> {
    Ok(messages::table
        .filter(messages::sender_id.eq(sender_id))
        .filter(messages::created_at.ge(since))
        .count()
        .get_result(conn)?)
}

pub fn count_messages_by_sender(conn: &mut SqliteConnection, sender_id: &str) -> Result<i64, CivicError> {
    Ok(messages::table
        .filter(messages::sender_id.eq(sender_id))
        .count()
        .get_result(conn)?)
}

/// Messages visible under `scope`, newest first
pub fn list_messages(
    conn: &mut SqliteConnection,
    scope: &ScopeFilter,
    query: &MessageQuery,
) -> Result<Vec<Message>, CivicError> {
    let mut q = messages::table.into_boxed();

    q = match scope {
        ScopeFilter::All => q,
        ScopeFilter::Institution(inst) => q.filter(messages::institution_id.eq(inst.clone())),
        ScopeFilter::Department(dept) => q.filter(messages::department_id.eq(dept.clone())),
        ScopeFilter::Owner { principal_id, device_id } => match device_id {
            Some(dev) => q.filter(
                messages::sender_id
                    .nullable()
                    .eq(principal_id.clone())
                    .or(messages::device_id.eq(dev.clone())),
            ),
            None => q.filter(messages::sender_id.eq(principal_id.clone())),
        },
    };

    if let Some(ref inst) = query.institution {
        q = q.filter(messages::institution_id.eq(inst.clone()));
    }
    if let Some(ref dept) = query.department {
        q = q.filter(messages::department_id.eq(dept.clone()));
    }
    if let Some(ref status) = query.status {
        q = q.filter(messages::status.eq(status.clone()));
    }

    Ok(q.order((messages::created_at.desc(), messages::id.desc()))
        .limit(query.limit.clamp(1, 500))
        .offset(query.offset.max(0))
        .load(conn)?)
}

pub fn update_message_status(
    conn: &mut SqliteConnection,
    message_id: &str,
    status: &str,
) -> Result<Option<Message>, CivicError> {
    let now = current_timestamp();
    diesel::update(messages::table.filter(messages::id.eq(message_id)))
        .set((messages::status.eq(status), messages::updated_at.eq(&now)))
        .execute(conn)?;
    get_message(conn, message_id)
}

/// Move a pending message to answered. Other statuses are left alone.
pub fn mark_answered_if_pending(conn: &mut SqliteConnection, message_id: &str) -> Result<bool, CivicError> {
    let now = current_timestamp();
    let updated = diesel::update(
        messages::table
            .filter(messages::id.eq(message_id))
            .filter(messages::status.eq("pending")),
    )
    .set((messages::status.eq("answered"), messages::updated_at.eq(&now)))
    .execute(conn)?;
    Ok(updated > 0)
}

/// Stored attachment paths of every reply on a message
pub fn reply_attachment_paths(conn: &mut SqliteConnection, message_id: &str) -> Result<Vec<String>, CivicError> {
    let paths: Vec<Option<String>> = replies::table
        .filter(replies::message_id.eq(message_id))
        .select(replies::attachment_path)
        .load(conn)?;
    Ok(paths.into_iter().flatten().collect())
}

pub fn delete_message(conn: &mut SqliteConnection, message_id: &str) -> Result<bool, CivicError> {
    let deleted = diesel::delete(messages::table.filter(messages::id.eq(message_id))).execute(conn)?;
    Ok(deleted > 0)
}

/// Claim one reply slot on a message. The conditional increment is the cap
/// check, so concurrent replies cannot overshoot it.
pub fn reserve_reply_slot(
    conn: &mut SqliteConnection,
    message_id: &str,
    cap: i32,
) -> Result<bool, CivicError> {
    let updated = diesel::update(
        messages::table
            .filter(messages::id.eq(message_id))
            .filter(messages::reply_count.lt(cap)),
    )
    .set(messages::reply_count.eq(messages::reply_count + 1))
    .execute(conn)?;
    Ok(updated > 0)
}

// ============================================================================
// Replies
// ============================================================================

pub fn insert_reply(conn: &mut SqliteConnection, new: &NewReply<'_>) -> Result<Reply, CivicError> {
    diesel::insert_into(replies::table).values(new).execute(conn)?;
    get_reply(conn, new.id)?
        .ok_or_else(|| CivicError::Internal(format!("Reply {} vanished after insert", new.id)))
}

pub fn get_reply(conn: &mut SqliteConnection, reply_id: &str) -> Result<Option<Reply>, CivicError> {
    Ok(replies::table
        .filter(replies::id.eq(reply_id))
        .first(conn)
        .optional()?)
}

/// Replies on a message, oldest first, narrowed by `visibility`
pub fn list_replies(
    conn: &mut SqliteConnection,
    message_id: &str,
    visibility: ReplyVisibility,
    viewer_id: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<Reply>, CivicError> {
    let mut q = replies::table
        .filter(replies::message_id.eq(message_id))
        .into_boxed();

    match visibility {
        ReplyVisibility::All => {}
        ReplyVisibility::OwnerAndStaff => {
            q = q.filter(
                replies::sender_id
                    .eq(viewer_id.to_string())
                    .or(replies::sender_role.eq_any(vec![
                        ROLE_ADMIN,
                        ROLE_INSTITUTION_STAFF,
                        ROLE_DEPARTMENT_STAFF,
                    ])),
            );
        }
        ReplyVisibility::Nothing => return Ok(Vec::new()),
    }

    Ok(q.order((replies::created_at.asc(), replies::id.asc()))
        .limit(limit.clamp(1, 100))
        .offset(offset.max(0))
        .load(conn)?)
}
