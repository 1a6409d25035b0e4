//! Diesel model definitions for database tables
//!
//! - Queryable structs: for SELECT queries (reading data)
//! - Insertable structs: for INSERT queries (writing data)
//!
//! Field order matches the column order in `diesel_schema.rs`.

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use super::diesel_schema::*;

// ============================================================================
// Timestamp / ID Helpers (SQLite stores timestamps as TEXT)
// ============================================================================

/// Get current UTC timestamp as ISO 8601 string for SQLite TEXT columns
pub fn current_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Start of the current UTC day, in the same TEXT format
pub fn start_of_today() -> String {
    chrono::Utc::now().format("%Y-%m-%dT00:00:00Z").to_string()
}

/// Fresh row identifier
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// SQLite has no bool; flags are stored as 0/1 INTEGER
pub fn flag(value: bool) -> i32 {
    i32::from(value)
}

// ============================================================================
// Directory Models
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = institutions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Institution {
    pub id: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = institutions)]
pub struct NewInstitution<'a> {
    pub id: &'a str,
    pub name: &'a str,
    pub created_at: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = departments)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Department {
    pub id: String,
    pub institution_id: String,
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = departments)]
pub struct NewDepartment<'a> {
    pub id: &'a str,
    pub institution_id: &'a str,
    pub name: &'a str,
    pub created_at: &'a str,
}

/// Principal row. `password_hash` is never serialized.
#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = principals)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PrincipalRow {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: Option<String>,
    pub role: String,
    pub institution_id: Option<String>,
    pub department_id: Option<String>,
    pub device_id: Option<String>,
    pub phone_number: Option<String>,
    pub is_active: i32,
    pub token_version: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl PrincipalRow {
    pub fn is_active(&self) -> bool {
        self.is_active != 0
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = principals)]
pub struct NewPrincipal<'a> {
    pub id: &'a str,
    pub username: &'a str,
    pub password_hash: Option<&'a str>,
    pub role: &'a str,
    pub institution_id: Option<&'a str>,
    pub department_id: Option<&'a str>,
    pub device_id: Option<&'a str>,
    pub phone_number: Option<&'a str>,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

// ============================================================================
// Intake Models
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = reports)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Report {
    pub id: String,
    pub author_id: String,
    pub device_id: Option<String>,
    pub institution_id: Option<String>,
    pub department_id: Option<String>,
    pub title: String,
    pub description: String,
    pub latitude: f64,
    pub longitude: f64,
    pub status: String,
    pub distance_km: Option<f64>,
    pub route_info: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = reports)]
pub struct NewReport<'a> {
    pub id: &'a str,
    pub author_id: &'a str,
    pub device_id: Option<&'a str>,
    pub institution_id: Option<&'a str>,
    pub department_id: Option<&'a str>,
    pub title: &'a str,
    pub description: &'a str,
    pub latitude: f64,
    pub longitude: f64,
    pub status: &'a str,
    pub distance_km: Option<f64>,
    pub route_info: Option<&'a str>,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = messages)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub device_id: Option<String>,
    pub institution_id: String,
    pub department_id: Option<String>,
    pub problem_type: Option<String>,
    pub other_problem: Option<String>,
    pub content: String,
    pub ward: Option<String>,
    pub street: Option<String>,
    pub sub_street: Option<String>,
    pub phone_number: Option<String>,
    #[serde(skip_serializing)]
    pub attachment_path: Option<String>,
    pub attachment_name: Option<String>,
    pub status: String,
    pub reply_count: i32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = messages)]
pub struct NewMessage<'a> {
    pub id: &'a str,
    pub sender_id: &'a str,
    pub device_id: Option<&'a str>,
    pub institution_id: &'a str,
    pub department_id: Option<&'a str>,
    pub problem_type: Option<&'a str>,
    pub other_problem: Option<&'a str>,
    pub content: &'a str,
    pub ward: Option<&'a str>,
    pub street: Option<&'a str>,
    pub sub_street: Option<&'a str>,
    pub phone_number: Option<&'a str>,
    pub attachment_path: Option<&'a str>,
    pub attachment_name: Option<&'a str>,
    pub status: &'a str,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = replies)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Reply {
    pub id: String,
    pub message_id: String,
    pub sender_id: String,
    pub sender_role: String,
    pub content: String,
    #[serde(skip_serializing)]
    pub attachment_path: Option<String>,
    pub attachment_name: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = replies)]
pub struct NewReply<'a> {
    pub id: &'a str,
    pub message_id: &'a str,
    pub sender_id: &'a str,
    pub sender_role: &'a str,
    pub content: &'a str,
    pub attachment_path: Option<&'a str>,
    pub attachment_name: Option<&'a str>,
    pub created_at: &'a str,
}

// ============================================================================
// Poll Models
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = polls)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Poll {
    pub id: String,
    pub question: String,
    pub allow_multiple: i32,
    pub max_choices: Option<i32>,
    pub start_at: Option<String>,
    pub end_at: Option<String>,
    pub show_results: i32,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Poll {
    pub fn allows_multiple(&self) -> bool {
        self.allow_multiple != 0
    }

    pub fn shows_results(&self) -> bool {
        self.show_results != 0
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = polls)]
pub struct NewPoll<'a> {
    pub id: &'a str,
    pub question: &'a str,
    pub allow_multiple: i32,
    pub max_choices: Option<i32>,
    pub start_at: Option<&'a str>,
    pub end_at: Option<&'a str>,
    pub show_results: i32,
    pub created_by: &'a str,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = poll_options)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PollOption {
    pub id: String,
    pub poll_id: String,
    pub text: String,
    pub position: i32,
    pub votes_count: i32,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = poll_options)]
pub struct NewPollOption<'a> {
    pub id: &'a str,
    pub poll_id: &'a str,
    pub text: &'a str,
    pub position: i32,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = poll_votes)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PollVote {
    pub id: String,
    pub poll_id: String,
    pub principal_id: Option<String>,
    pub device_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = poll_votes)]
pub struct NewPollVote<'a> {
    pub id: &'a str,
    pub poll_id: &'a str,
    pub principal_id: Option<&'a str>,
    pub device_id: Option<&'a str>,
    pub created_at: &'a str,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = poll_vote_selections)]
pub struct NewVoteSelection<'a> {
    pub vote_id: &'a str,
    pub option_id: &'a str,
}

// ============================================================================
// Feed Models
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = feeds)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Feed {
    pub id: String,
    pub posted_by: String,
    pub institution_id: Option<String>,
    pub description: String,
    pub image_path: Option<String>,
    pub video_path: Option<String>,
    pub link: Option<String>,
    pub impressions: i32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = feeds)]
pub struct NewFeed<'a> {
    pub id: &'a str,
    pub posted_by: &'a str,
    pub institution_id: Option<&'a str>,
    pub description: &'a str,
    pub image_path: Option<&'a str>,
    pub video_path: Option<&'a str>,
    pub link: Option<&'a str>,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = feed_reactions)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct FeedReaction {
    pub id: String,
    pub feed_id: String,
    pub principal_id: Option<String>,
    pub device_id: Option<String>,
    pub reaction: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = feed_reactions)]
pub struct NewFeedReaction<'a> {
    pub id: &'a str,
    pub feed_id: &'a str,
    pub principal_id: Option<&'a str>,
    pub device_id: Option<&'a str>,
    pub reaction: &'a str,
    pub created_at: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = feed_shares)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct FeedShare {
    pub id: String,
    pub feed_id: String,
    pub principal_id: Option<String>,
    pub device_id: Option<String>,
    pub message: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = feed_shares)]
pub struct NewFeedShare<'a> {
    pub id: &'a str,
    pub feed_id: &'a str,
    pub principal_id: Option<&'a str>,
    pub device_id: Option<&'a str>,
    pub message: Option<&'a str>,
    pub created_at: &'a str,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = feed_impressions)]
pub struct NewFeedImpression<'a> {
    pub id: &'a str,
    pub feed_id: &'a str,
    pub principal_id: Option<&'a str>,
    pub device_id: Option<&'a str>,
    pub created_at: &'a str,
}

// ============================================================================
// Notification Models
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = notifications)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Notification {
    pub id: String,
    pub recipient_id: String,
    pub title: String,
    pub body: String,
    pub kind: String,
    pub object_kind: String,
    pub object_id: String,
    pub read_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = notifications)]
pub struct NewNotification<'a> {
    pub id: &'a str,
    pub recipient_id: &'a str,
    pub title: &'a str,
    pub body: &'a str,
    pub kind: &'a str,
    pub object_kind: &'a str,
    pub object_id: &'a str,
    pub created_at: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable, Serialize)]
#[diesel(table_name = push_devices)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PushDevice {
    pub id: String,
    pub principal_id: String,
    pub token: String,
    pub platform: String,
    pub is_active: i32,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = push_devices)]
pub struct NewPushDevice<'a> {
    pub id: &'a str,
    pub principal_id: &'a str,
    pub token: &'a str,
    pub platform: &'a str,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}


// ============================================================================
// Announcement Models
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = announcements)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Announcement {
    pub id: String,
    pub title: String,
    pub description: String,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = announcements)]
pub struct NewAnnouncement<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub description: &'a str,
    pub created_by: Option<&'a str>,
    pub created_at: &'a str,
    pub updated_at: &'a str,
}

/// Partial update; `None` fields are left alone
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = announcements)]
pub struct AnnouncementChanges<'a> {
    pub title: Option<&'a str>,
    pub description: Option<&'a str>,
    pub updated_at: &'a str,
}
