//! Announcement operations

use diesel::prelude::*;

use super::diesel_schema::announcements;
use super::models::{Announcement, AnnouncementChanges, NewAnnouncement};
use crate::error::CivicError;

pub fn insert_announcement(
    conn: &mut SqliteConnection,
    new: &NewAnnouncement<'_>,
) -> Result<Announcement, CivicError> {
    diesel::insert_into(announcements::table).values(new).execute(conn)?;
    get_announcement(conn, new.id)?
        .ok_or_else(|| CivicError::Internal(format!("Announcement {} vanished after insert", new.id)))
}

pub fn get_announcement(
    conn: &mut SqliteConnection,
    announcement_id: &str,
) -> Result<Option<Announcement>, CivicError> {
    Ok(announcements::table
        .filter(announcements::id.eq(announcement_id))
        .first(conn)
        .optional()?)
}

/// Newest first
pub fn list_announcements(
    conn: &mut SqliteConnection,
    limit: i64,
    offset: i64,
) -> Result<Vec<Announcement>, CivicError> {
    Ok(announcements::table
        .order((announcements::created_at.desc(), announcements::id.desc()))
        .limit(limit.clamp(1, 500))
        .offset(offset.max(0))
        .load(conn)?)
}

/// Apply `changes`; `None` when the announcement does not exist
pub fn update_announcement(
    conn: &mut SqliteConnection,
    announcement_id: &str,
    changes: &AnnouncementChanges<'_>,
) -> Result<Option<Announcement>, CivicError> {
    let updated = diesel::update(announcements::table.filter(announcements::id.eq(announcement_id)))
        .set(changes)
        .execute(conn)?;
    if updated == 0 {
        return Ok(None);
    }
    get_announcement(conn, announcement_id)
}

pub fn delete_announcement(conn: &mut SqliteConnection, announcement_id: &str) -> Result<bool, CivicError> {
    let deleted = diesel::delete(announcements::table.filter(announcements::id.eq(announcement_id)))
        .execute(conn)?;
    Ok(deleted > 0)
}
