//! SQLite store for civic-intake
//!
//! ## Architecture
//!
//! - One r2d2 pool of Diesel `SqliteConnection`s per process
//! - WAL journal, `busy_timeout` and foreign keys applied per pooled connection
//! - Repository modules (`principals`, `reports`, ...) are free functions over
//!   `&mut SqliteConnection`; services own transaction boundaries
//!
//! ## Tables
//!
//! - `principals` - registered users and anonymous device principals
//! - `institutions`, `departments` - triage scopes
//! - `reports`, `messages`, `replies` - scoped resources
//! - `polls`, `poll_options`, `poll_votes`, `poll_vote_selections` - polls
//! - `feeds`, `feed_reactions`, `feed_shares`, `feed_impressions` - feeds
//! - `notifications`, `push_devices` - notification inbox
//! - `announcements` - public notices

pub mod analytics;
pub mod announcements;
pub mod diesel_schema;
pub mod feeds;
pub mod institutions;
pub mod messages;
pub mod models;
pub mod notifications;
pub mod polls;
pub mod principals;
pub mod reports;
pub mod schema;

use std::path::Path;
use std::time::Duration;

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::CivicError;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Pragmas applied every time the pool hands out a fresh connection
#[derive(Debug, Clone, Copy)]
struct ConnectionPragmas {
    busy_timeout_ms: u64,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionPragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Pooled SQLite store
pub struct Store {
    pool: DbPool,
}

impl Store {
    /// Open or create the store described by `config`
    pub fn open(config: &Config) -> Result<Self, CivicError> {
        Self::open_path(
            &config.database_path(),
            config.pool_size,
            config.busy_timeout_ms,
        )
    }

    /// Open or create a file-backed store
    pub fn open_path(path: &Path, pool_size: u32, busy_timeout_ms: u64) -> Result<Self, CivicError> {
        info!(path = ?path, pool_size, "Opening SQLite database");

        let url = path
            .to_str()
            .ok_or_else(|| CivicError::Config(format!("Non UTF-8 database path: {:?}", path)))?;

        // journal_mode is persistent for file databases, so set it once up front
        let mut setup = SqliteConnection::establish(url)
            .map_err(|e| CivicError::StoreUnavailable(format!("Failed to open SQLite: {}", e)))?;
        setup.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA journal_mode = WAL;",
            busy_timeout_ms
        ))?;
        schema::init_schema(&mut setup)?;
        drop(setup);

        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_timeout(Duration::from_millis(busy_timeout_ms.max(1_000)))
            .connection_customizer(Box::new(ConnectionPragmas { busy_timeout_ms }))
            .build(ConnectionManager::<SqliteConnection>::new(url))
            .map_err(|e| CivicError::StoreUnavailable(format!("Failed to build pool: {}", e)))?;

        Ok(Self { pool })
    }

    /// Open an in-memory store (for testing)
    ///
    /// Every SQLite `:memory:` connection is its own database, so the pool is
    /// pinned to a single connection that is never recycled.
    pub fn open_in_memory() -> Result<Self, CivicError> {
        debug!("Opening in-memory SQLite database");

        let pool = Pool::builder()
            .max_size(1)
            .max_lifetime(None)
            .idle_timeout(None)
            .connection_customizer(Box::new(ConnectionPragmas { busy_timeout_ms: 1_000 }))
            .build(ConnectionManager::<SqliteConnection>::new(":memory:"))
            .map_err(|e| CivicError::StoreUnavailable(format!("Failed to build pool: {}", e)))?;

        let store = Self { pool };
        store.with_conn(schema::init_schema)?;
        Ok(store)
    }

    /// Check out a pooled connection
    pub fn conn(&self) -> Result<DbConn, CivicError> {
        Ok(self.pool.get()?)
    }

    /// Run `f` against a pooled connection
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, CivicError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, CivicError>,
    {
        let mut conn = self.conn()?;
        f(&mut *conn)
    }

    /// Row counts for the health endpoint
    pub fn stats(&self) -> Result<StoreStats, CivicError> {
        use diesel_schema::{feeds, messages, polls, principals, reports};

        self.with_conn(|conn| {
            Ok(StoreStats {
                principals: principals::table.count().get_result(conn)?,
                reports: reports::table.count().get_result(conn)?,
                messages: messages::table.count().get_result(conn)?,
                polls: polls::table.count().get_result(conn)?,
                feeds: feeds::table.count().get_result(conn)?,
            })
        })
    }
}

/// Store statistics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub principals: i64,
    pub reports: i64,
    pub messages: i64,
    pub polls: i64,
    pub feeds: i64,
}
