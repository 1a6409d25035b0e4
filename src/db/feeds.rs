//! Feed operations
//!
//! Reaction, share and impression rows are written by the contribution
//! ledger; this module covers feed posts and the aggregate reads.

use diesel::dsl::count_star;
use diesel::prelude::*;

use super::diesel_schema::{feed_reactions, feed_shares, feeds};
use super::models::{Feed, FeedReaction, NewFeed};
use crate::error::CivicError;
use crate::identity::ContributorKey;

pub fn insert_feed(conn: &mut SqliteConnection, new: &NewFeed<'_>) -> Result<Feed, CivicError> {
    diesel::insert_into(feeds::table).values(new).execute(conn)?;
    get_feed(conn, new.id)?
        .ok_or_else(|| CivicError::Internal(format!("Feed {} vanished after insert", new.id)))
}

pub fn get_feed(conn: &mut SqliteConnection, feed_id: &str) -> Result<Option<Feed>, CivicError> {
    Ok(feeds::table
        .filter(feeds::id.eq(feed_id))
        .first(conn)
        .optional()?)
}

pub fn list_feeds(
    conn: &mut SqliteConnection,
    institution_id: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<Feed>, CivicError> {
    let mut q = feeds::table.into_boxed();
    if let Some(inst) = institution_id {
        q = q.filter(feeds::institution_id.eq(inst.to_string()));
    }
    Ok(q.order((feeds::created_at.desc(), feeds::id.desc()))
        .limit(limit.clamp(1, 500))
        .offset(offset.max(0))
        .load(conn)?)
}

pub fn delete_feed(conn: &mut SqliteConnection, feed_id: &str) -> Result<Option<Feed>, CivicError> {
    let feed = get_feed(conn, feed_id)?;
    if feed.is_some() {
        diesel::delete(feeds::table.filter(feeds::id.eq(feed_id))).execute(conn)?;
    }
    Ok(feed)
}

/// `(feed_id, reaction, count)` for each reaction kind present
pub fn reaction_counts(
    conn: &mut SqliteConnection,
    feed_ids: &[String],
) -> Result<Vec<(String, String, i64)>, CivicError> {
    Ok(feed_reactions::table
        .filter(feed_reactions::feed_id.eq_any(feed_ids))
        .group_by((feed_reactions::feed_id, feed_reactions::reaction))
        .select((feed_reactions::feed_id, feed_reactions::reaction, count_star()))
        .load(conn)?)
}

/// `(feed_id, count)` for each shared feed
pub fn share_counts(
    conn: &mut SqliteConnection,
    feed_ids: &[String],
) -> Result<Vec<(String, i64)>, CivicError> {
    Ok(feed_shares::table
        .filter(feed_shares::feed_id.eq_any(feed_ids))
        .group_by(feed_shares::feed_id)
        .select((feed_shares::feed_id, count_star()))
        .load(conn)?)
}

pub fn find_reaction(
    conn: &mut SqliteConnection,
    feed_id: &str,
    contributor: &ContributorKey,
) -> Result<Option<FeedReaction>, CivicError> {
    let q = feed_reactions::table
        .filter(feed_reactions::feed_id.eq(feed_id))
        .into_boxed();
    let q = match contributor {
        ContributorKey::Principal(id) => q.filter(feed_reactions::principal_id.eq(id.clone())),
        ContributorKey::Device(id) => q.filter(feed_reactions::device_id.eq(id.clone())),
    };
    Ok(q.first(conn).optional()?)
}

/// `(feed_id, reaction)` pairs the contributor currently holds
pub fn reactions_of(
    conn: &mut SqliteConnection,
    contributor: &ContributorKey,
    feed_ids: &[String],
) -> Result<Vec<(String, String)>, CivicError> {
    let q = feed_reactions::table
        .filter(feed_reactions::feed_id.eq_any(feed_ids))
        .select((feed_reactions::feed_id, feed_reactions::reaction))
        .into_boxed();
    let q = match contributor {
        ContributorKey::Principal(id) => q.filter(feed_reactions::principal_id.eq(id.clone())),
        ContributorKey::Device(id) => q.filter(feed_reactions::device_id.eq(id.clone())),
    };
    Ok(q.load(conn)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;
    use diesel::connection::SimpleConnection;

    #[test]
    fn test_reaction_counts_group_by_kind() {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        init_schema(&mut conn).unwrap();
        conn.batch_execute(
            "INSERT INTO principals (id, username, role, created_at, updated_at)
                VALUES ('admin', 'root', 'admin', 't', 't');
             INSERT INTO feeds (id, posted_by, description, created_at, updated_at)
                VALUES ('f1', 'admin', 'Clinic opens Monday', 't', 't');
             INSERT INTO feed_reactions (id, feed_id, device_id, reaction, created_at) VALUES
                ('r1', 'f1', 'd1', 'like', 't'),
                ('r2', 'f1', 'd2', 'like', 't'),
                ('r3', 'f1', 'd3', 'love', 't');",
        )
        .unwrap();

        let mut counts = reaction_counts(&mut conn, &["f1".to_string()]).unwrap();
        counts.sort();
        assert_eq!(
            counts,
            vec![
                ("f1".to_string(), "like".to_string(), 2),
                ("f1".to_string(), "love".to_string(), 1),
            ]
        );

        let mine = reactions_of(&mut conn, &ContributorKey::Device("d3".into()), &["f1".to_string()]).unwrap();
        assert_eq!(mine, vec![("f1".to_string(), "love".to_string())]);
    }
}
