//! Civic Intake - report and message intake backend for municipal services
//!
//! Citizens file geolocated reports and messages from a phone app without
//! creating an account; the device identifier is their identity until they
//! register. Institution and department staff triage what falls in their
//! scope. Polls and feeds collect votes, reactions, shares and impressions
//! through one idempotent contribution ledger.
//!
//! ## Architecture
//!
//! ```text
//! http (hyper) ──spawn_blocking──> services ──> identity / access / ledger
//!                                      │                 │
//!                                      ├── EventBus      └── db (diesel + r2d2, SQLite)
//!                                      └── NotificationDispatcher
//! ```
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/civic-intake/
//! ├── civic.db               # SQLite database (WAL)
//! ├── attachments/           # <uuid>-<name> uploads
//! └── config.toml            # Configuration
//! ```

pub mod access;
pub mod attachments;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod identity;
pub mod ledger;
pub mod services;

pub use attachments::AttachmentStore;
pub use config::Config;
pub use db::Store;
pub use error::{CivicError, Result};
pub use http::HttpServer;
pub use identity::{Principal, Role};
pub use services::Services;
