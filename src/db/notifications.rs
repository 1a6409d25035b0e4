//! Notification inbox and push device registry

use diesel::prelude::*;

use super::diesel_schema::{notifications, push_devices};
use super::models::{current_timestamp, new_id, NewNotification, NewPushDevice, Notification, PushDevice};
use crate::error::CivicError;

pub const NOTIFICATION_KINDS: [&str; 4] = ["message_reply", "report_status", "feed", "poll"];

/// Inbox page size
pub const INBOX_LIMIT: i64 = 100;

/// One notification fanned out to many recipients
#[derive(Debug, Clone)]
pub struct NotificationDraft<'a> {
    pub title: &'a str,
    pub body: &'a str,
    pub kind: &'a str,
    pub object_kind: &'a str,
    pub object_id: &'a str,
}

/// Insert `draft` once per recipient. Recipients already notified about the
/// same object are skipped. Returns the number of rows written.
pub fn notify_many(
    conn: &mut SqliteConnection,
    recipients: &[String],
    draft: &NotificationDraft<'_>,
) -> Result<usize, CivicError> {
    if recipients.is_empty() {
        return Ok(0);
    }
    let now = current_timestamp();
    let ids: Vec<String> = recipients.iter().map(|_| new_id()).collect();
    let rows: Vec<NewNotification<'_>> = recipients
        .iter()
        .zip(ids.iter())
        .map(|(recipient_id, id)| NewNotification {
            id,
            recipient_id,
            title: draft.title,
            body: draft.body,
            kind: draft.kind,
            object_kind: draft.object_kind,
            object_id: draft.object_id,
            created_at: &now,
        })
        .collect();

    Ok(diesel::insert_or_ignore_into(notifications::table)
        .values(&rows)
        .execute(conn)?)
}

/// Newest notifications of one recipient
pub fn list_notifications(
    conn: &mut SqliteConnection,
    recipient_id: &str,
    unread_only: bool,
) -> Result<Vec<Notification>, CivicError> {
    let mut q = notifications::table
        .filter(notifications::recipient_id.eq(recipient_id))
        .into_boxed();
    if unread_only {
        q = q.filter(notifications::read_at.is_null());
    }
    Ok(q.order((notifications::created_at.desc(), notifications::id.desc()))
        .limit(INBOX_LIMIT)
        .load(conn)?)
}

pub fn count_unread(conn: &mut SqliteConnection, recipient_id: &str) -> Result<i64, CivicError> {
    Ok(notifications::table
        .filter(notifications::recipient_id.eq(recipient_id))
        .filter(notifications::read_at.is_null())
        .count()
        .get_result(conn)?)
}

/// Mark one notification read. Notifications of other recipients are
/// treated as missing.
pub fn mark_read(
    conn: &mut SqliteConnection,
    recipient_id: &str,
    notification_id: &str,
) -> Result<Option<Notification>, CivicError> {
    let now = current_timestamp();
    diesel::update(
        notifications::table
            .filter(notifications::id.eq(notification_id))
            .filter(notifications::recipient_id.eq(recipient_id))
            .filter(notifications::read_at.is_null()),
    )
    .set(notifications::read_at.eq(&now))
    .execute(conn)?;

    Ok(notifications::table
        .filter(notifications::id.eq(notification_id))
        .filter(notifications::recipient_id.eq(recipient_id))
        .first(conn)
        .optional()?)
}

pub fn mark_all_read(conn: &mut SqliteConnection, recipient_id: &str) -> Result<usize, CivicError> {
    let now = current_timestamp();
    Ok(diesel::update(
        notifications::table
            .filter(notifications::recipient_id.eq(recipient_id))
            .filter(notifications::read_at.is_null()),
    )
    .set(notifications::read_at.eq(&now))
    .execute(conn)?)
}

// ============================================================================
// Push devices
// ============================================================================

/// Register a push token for a principal. A token seen before moves to the
/// new principal and is reactivated.
pub fn upsert_push_device(
    conn: &mut SqliteConnection,
    principal_id: &str,
    token: &str,
    platform: &str,
) -> Result<PushDevice, CivicError> {
    let now = current_timestamp();
    let id = new_id();
    diesel::insert_into(push_devices::table)
        .values(&NewPushDevice {
            id: &id,
            principal_id,
            token,
            platform,
            created_at: &now,
            updated_at: &now,
        })
        .on_conflict(push_devices::token)
        .do_update()
        .set((
            push_devices::principal_id.eq(principal_id),
            push_devices::platform.eq(platform),
            push_devices::is_active.eq(1),
            push_devices::updated_at.eq(&now),
        ))
        .execute(conn)?;

    Ok(push_devices::table
        .filter(push_devices::token.eq(token))
        .first(conn)?)
}

pub fn active_push_tokens(conn: &mut SqliteConnection, principal_id: &str) -> Result<Vec<String>, CivicError> {
    Ok(push_devices::table
        .filter(push_devices::principal_id.eq(principal_id))
        .filter(push_devices::is_active.eq(1))
        .select(push_devices::token)
        .load(conn)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::init_schema;
    use diesel::connection::SimpleConnection;

    fn setup() -> SqliteConnection {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        init_schema(&mut conn).unwrap();
        conn.batch_execute(
            "INSERT INTO principals (id, username, role, device_id, created_at, updated_at) VALUES
                ('p1', 'anon_d1', 'anonymous', 'd1', 't', 't'),
                ('p2', 'anon_d2', 'anonymous', 'd2', 't', 't');",
        )
        .unwrap();
        conn
    }

    fn draft(object_id: &str) -> NotificationDraft<'_> {
        NotificationDraft {
            title: "New poll",
            body: "Which road first?",
            kind: "poll",
            object_kind: "poll",
            object_id,
        }
    }

    #[test]
    fn test_same_object_notifies_once() {
        let mut conn = setup();
        let recipients = vec!["p1".to_string(), "p2".to_string()];

        assert_eq!(notify_many(&mut conn, &recipients, &draft("poll-1")).unwrap(), 2);
        assert_eq!(notify_many(&mut conn, &recipients, &draft("poll-1")).unwrap(), 0);
        assert_eq!(notify_many(&mut conn, &recipients, &draft("poll-2")).unwrap(), 2);
        assert_eq!(list_notifications(&mut conn, "p1", false).unwrap().len(), 2);
    }

    #[test]
    fn test_mark_read_is_scoped_to_recipient() {
        let mut conn = setup();
        notify_many(&mut conn, &["p1".to_string()], &draft("poll-1")).unwrap();
        let id = list_notifications(&mut conn, "p1", true).unwrap()[0].id.clone();

        assert!(mark_read(&mut conn, "p2", &id).unwrap().is_none());
        assert_eq!(count_unread(&mut conn, "p1").unwrap(), 1);

        let read = mark_read(&mut conn, "p1", &id).unwrap().unwrap();
        assert!(read.read_at.is_some());
        assert!(list_notifications(&mut conn, "p1", true).unwrap().is_empty());
    }

    #[test]
    fn test_push_token_moves_between_principals() {
        let mut conn = setup();
        upsert_push_device(&mut conn, "p1", "tok-1", "android").unwrap();
        let moved = upsert_push_device(&mut conn, "p2", "tok-1", "ios").unwrap();

        assert_eq!(moved.principal_id, "p2");
        assert_eq!(moved.platform, "ios");
        assert!(active_push_tokens(&mut conn, "p1").unwrap().is_empty());
        assert_eq!(active_push_tokens(&mut conn, "p2").unwrap(), vec!["tok-1".to_string()]);
    }
}
