//! Database schema bootstrap
//!
//! Tables are created with raw DDL the first time a database is opened and
//! tracked through a single-row `schema_version` table. The Diesel `table!`
//! definitions in `diesel_schema.rs` mirror this DDL column for column.

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_types::Integer;
use tracing::info;

use crate::error::CivicError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 2;

#[derive(QueryableByName)]
struct VersionRow {
    #[diesel(sql_type = Integer)]
    version: i32,
}

/// Initialize the database schema
pub fn init_schema(conn: &mut SqliteConnection) -> Result<(), CivicError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        conn.immediate_transaction(|conn| {
            create_tables(conn)?;
            set_schema_version(conn, SCHEMA_VERSION)
        })?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &mut SqliteConnection) -> Result<i32, CivicError> {
    conn.batch_execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")?;

    let row = diesel::sql_query("SELECT version FROM schema_version LIMIT 1")
        .get_result::<VersionRow>(conn)
        .optional()?;

    Ok(row.map(|r| r.version).unwrap_or(0))
}

fn set_schema_version(conn: &mut SqliteConnection, version: i32) -> Result<(), CivicError> {
    conn.batch_execute("DELETE FROM schema_version")?;
    diesel::sql_query("INSERT INTO schema_version (version) VALUES (?)")
        .bind::<Integer, _>(version)
        .execute(conn)?;
    Ok(())
}

fn create_tables(conn: &mut SqliteConnection) -> Result<(), CivicError> {
    conn.batch_execute(DIRECTORY_SCHEMA)?;
    conn.batch_execute(INTAKE_SCHEMA)?;
    conn.batch_execute(CONTRIBUTION_SCHEMA)?;
    conn.batch_execute(NOTIFICATION_SCHEMA)?;
    conn.batch_execute(ANNOUNCEMENT_SCHEMA)?;
    Ok(())
}

fn migrate_schema(conn: &mut SqliteConnection, from_version: i32) -> Result<(), CivicError> {
    conn.immediate_transaction(|conn| {
        if from_version < 2 {
            info!("Adding announcements table");
            conn.batch_execute(ANNOUNCEMENT_SCHEMA)?;
        }
        set_schema_version(conn, SCHEMA_VERSION)
    })
}

/// Institutions, departments and principals
const DIRECTORY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS institutions (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS departments (
    id TEXT PRIMARY KEY NOT NULL,
    institution_id TEXT NOT NULL REFERENCES institutions(id) ON DELETE CASCADE,
    name TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (institution_id, name)
);

CREATE TABLE IF NOT EXISTS principals (
    id TEXT PRIMARY KEY NOT NULL,
    username TEXT NOT NULL,
    password_hash TEXT,
    role TEXT NOT NULL CHECK (role IN ('admin', 'institution_staff', 'department_staff', 'anonymous')),
    institution_id TEXT REFERENCES institutions(id) ON DELETE SET NULL,
    department_id TEXT REFERENCES departments(id) ON DELETE SET NULL,
    device_id TEXT,
    phone_number TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    token_version INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- One principal per device identifier; the race-breaker for first contact
CREATE UNIQUE INDEX IF NOT EXISTS idx_principals_device
    ON principals(device_id) WHERE device_id IS NOT NULL;

-- Login names are unique among registered principals only
CREATE UNIQUE INDEX IF NOT EXISTS idx_principals_username
    ON principals(username) WHERE password_hash IS NOT NULL;
"#;

/// Reports, messages and replies
const INTAKE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS reports (
    id TEXT PRIMARY KEY NOT NULL,
    author_id TEXT NOT NULL REFERENCES principals(id),
    device_id TEXT,
    institution_id TEXT REFERENCES institutions(id) ON DELETE SET NULL,
    department_id TEXT REFERENCES departments(id) ON DELETE SET NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'received', 'solving', 'solved')),
    distance_km REAL,
    route_info TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reports_author ON reports(author_id);
CREATE INDEX IF NOT EXISTS idx_reports_device ON reports(device_id);
CREATE INDEX IF NOT EXISTS idx_reports_institution ON reports(institution_id);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY NOT NULL,
    sender_id TEXT NOT NULL REFERENCES principals(id),
    device_id TEXT,
    institution_id TEXT NOT NULL REFERENCES institutions(id),
    department_id TEXT REFERENCES departments(id),
    problem_type TEXT,
    other_problem TEXT,
    content TEXT NOT NULL,
    ward TEXT,
    street TEXT,
    sub_street TEXT,
    phone_number TEXT,
    attachment_path TEXT,
    attachment_name TEXT,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'answered', 'solved', 'help_received')),
    reply_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_sender ON messages(sender_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_institution ON messages(institution_id, department_id);

CREATE TABLE IF NOT EXISTS replies (
    id TEXT PRIMARY KEY NOT NULL,
    message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    sender_id TEXT NOT NULL REFERENCES principals(id),
    sender_role TEXT NOT NULL,
    content TEXT NOT NULL,
    attachment_path TEXT,
    attachment_name TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_replies_message ON replies(message_id, created_at);
"#;

/// Polls, feeds and the contribution ledger tables
///
/// Every contribution row names exactly one contributor column, and the
/// partial unique indexes give one row per (subject, contributor).
const CONTRIBUTION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS polls (
    id TEXT PRIMARY KEY NOT NULL,
    question TEXT NOT NULL,
    allow_multiple INTEGER NOT NULL DEFAULT 0,
    max_choices INTEGER,
    start_at TEXT,
    end_at TEXT,
    show_results INTEGER NOT NULL DEFAULT 0,
    created_by TEXT NOT NULL REFERENCES principals(id),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS poll_options (
    id TEXT PRIMARY KEY NOT NULL,
    poll_id TEXT NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
    text TEXT NOT NULL,
    position INTEGER NOT NULL,
    votes_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_poll_options_poll ON poll_options(poll_id, position);

CREATE TABLE IF NOT EXISTS poll_votes (
    id TEXT PRIMARY KEY NOT NULL,
    poll_id TEXT NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
    principal_id TEXT REFERENCES principals(id) ON DELETE CASCADE,
    device_id TEXT,
    created_at TEXT NOT NULL,
    CHECK ((principal_id IS NULL) <> (device_id IS NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_poll_votes_principal
    ON poll_votes(poll_id, principal_id) WHERE principal_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_poll_votes_device
    ON poll_votes(poll_id, device_id) WHERE device_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS poll_vote_selections (
    vote_id TEXT NOT NULL REFERENCES poll_votes(id) ON DELETE CASCADE,
    option_id TEXT NOT NULL REFERENCES poll_options(id) ON DELETE CASCADE,
    PRIMARY KEY (vote_id, option_id)
);

CREATE TABLE IF NOT EXISTS feeds (
    id TEXT PRIMARY KEY NOT NULL,
    posted_by TEXT NOT NULL REFERENCES principals(id),
    institution_id TEXT REFERENCES institutions(id) ON DELETE SET NULL,
    description TEXT NOT NULL,
    image_path TEXT,
    video_path TEXT,
    link TEXT,
    impressions INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS feed_reactions (
    id TEXT PRIMARY KEY NOT NULL,
    feed_id TEXT NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
    principal_id TEXT REFERENCES principals(id) ON DELETE CASCADE,
    device_id TEXT,
    reaction TEXT NOT NULL CHECK (reaction IN ('like', 'love', 'cry', 'smile')),
    created_at TEXT NOT NULL,
    CHECK ((principal_id IS NULL) <> (device_id IS NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_feed_reactions_principal
    ON feed_reactions(feed_id, principal_id) WHERE principal_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_feed_reactions_device
    ON feed_reactions(feed_id, device_id) WHERE device_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS feed_shares (
    id TEXT PRIMARY KEY NOT NULL,
    feed_id TEXT NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
    principal_id TEXT REFERENCES principals(id) ON DELETE CASCADE,
    device_id TEXT,
    message TEXT,
    created_at TEXT NOT NULL,
    CHECK ((principal_id IS NULL) <> (device_id IS NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_feed_shares_principal
    ON feed_shares(feed_id, principal_id) WHERE principal_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_feed_shares_device
    ON feed_shares(feed_id, device_id) WHERE device_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS feed_impressions (
    id TEXT PRIMARY KEY NOT NULL,
    feed_id TEXT NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
    principal_id TEXT REFERENCES principals(id) ON DELETE CASCADE,
    device_id TEXT,
    created_at TEXT NOT NULL,
    CHECK ((principal_id IS NULL) <> (device_id IS NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_feed_impressions_principal
    ON feed_impressions(feed_id, principal_id) WHERE principal_id IS NOT NULL;
CREATE UNIQUE INDEX IF NOT EXISTS idx_feed_impressions_device
    ON feed_impressions(feed_id, device_id) WHERE device_id IS NOT NULL;
"#;

/// Notifications and push device registrations
const NOTIFICATION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY NOT NULL,
    recipient_id TEXT NOT NULL REFERENCES principals(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    body TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('message_reply', 'report_status', 'feed', 'poll')),
    object_kind TEXT NOT NULL,
    object_id TEXT NOT NULL,
    read_at TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (recipient_id, kind, object_kind, object_id)
);

CREATE INDEX IF NOT EXISTS idx_notifications_recipient ON notifications(recipient_id, created_at);

CREATE TABLE IF NOT EXISTS push_devices (
    id TEXT PRIMARY KEY NOT NULL,
    principal_id TEXT NOT NULL REFERENCES principals(id) ON DELETE CASCADE,
    token TEXT NOT NULL UNIQUE,
    platform TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Public announcements (v2)
const ANNOUNCEMENT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS announcements (
    id TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    created_by TEXT REFERENCES principals(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_announcements_created ON announcements(created_at);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_is_idempotent() {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        init_schema(&mut conn).unwrap();
        init_schema(&mut conn).unwrap();
        assert_eq!(get_schema_version(&mut conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_v1_database_gains_announcements() {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        conn.batch_execute(DIRECTORY_SCHEMA).unwrap();
        get_schema_version(&mut conn).unwrap();
        set_schema_version(&mut conn, 1).unwrap();

        init_schema(&mut conn).unwrap();
        assert_eq!(get_schema_version(&mut conn).unwrap(), SCHEMA_VERSION);
        conn.batch_execute(
            "INSERT INTO announcements (id, title, description, created_at, updated_at)
                 VALUES ('a1', 'Water rationing', 'Tuesdays and Fridays', 't', 't')",
        )
        .unwrap();
    }

    #[test]
    fn test_contribution_rows_require_exactly_one_contributor() {
        let mut conn = SqliteConnection::establish(":memory:").unwrap();
        init_schema(&mut conn).unwrap();
        conn.batch_execute(
            "INSERT INTO principals (id, username, role, created_at, updated_at)
                 VALUES ('admin-1', 'root', 'admin', 't', 't');
             INSERT INTO polls (id, question, created_by, created_at, updated_at)
                 VALUES ('p1', 'q', 'admin-1', 't', 't');",
        )
        .unwrap();

        let neither = conn.batch_execute(
            "INSERT INTO poll_votes (id, poll_id, created_at) VALUES ('v1', 'p1', 't')",
        );
        assert!(neither.is_err());

        let both = conn.batch_execute(
            "INSERT INTO poll_votes (id, poll_id, principal_id, device_id, created_at)
                 VALUES ('v2', 'p1', 'admin-1', 'dev', 't')",
        );
        assert!(both.is_err());
    }
}
