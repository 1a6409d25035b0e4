//! Analytics service - admin report over messages, polls and feed reactions
//!
//! Every figure is computed from the stored rows on each call. Query
//! parameters:
//!
//! - `start`, `end`: inclusive window, `YYYY-MM-DD` or RFC 3339. A bare
//!   date covers the whole day.
//! - `institution`: narrows message figures and the per-feed breakdown
//! - `daily`: per-day message counts by institution (needs both bounds)
//! - `per_feed`: reaction breakdown per feed

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::analytics::{self, MessageFact, TimeRange};
use crate::db::models::{Poll, PollOption};
use crate::db::{institutions, polls as poll_repo, Store};
use crate::error::CivicError;
use crate::identity::Principal;
use crate::ledger::ReactionKind;

use super::require_admin;

/// Longest window the daily breakdown will bucket
pub const MAX_DAILY_BUCKETS: i64 = 366;

const STORE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalyticsQuery {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub institution: Option<String>,
    #[serde(default)]
    pub daily: Option<String>,
    #[serde(default)]
    pub per_feed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProblemTypeCount {
    /// `other` when the sender gave none
    pub problem_type: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionCount {
    pub option_id: String,
    pub text: String,
    pub votes_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollStats {
    pub poll_id: String,
    pub question: String,
    pub total_voters: i64,
    pub options: Vec<OptionCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedReactionStats {
    pub feed_id: String,
    pub created_at: String,
    pub total_reactions: i64,
    pub by_type: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactionStats {
    pub total: i64,
    pub by_type: BTreeMap<String, i64>,
    pub per_feed: Vec<FeedReactionStats>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstitutionCount {
    pub institution_id: String,
    pub institution_name: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepartmentCount {
    pub department_id: Option<String>,
    /// `Department (Institution)`, empty for messages without a department
    pub department_name: String,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdminStats {
    pub problem_type_stats: Vec<ProblemTypeCount>,
    pub poll_stats: Vec<PollStats>,
    pub feed_reactions: ReactionStats,
    pub messages_by_institution: Vec<InstitutionCount>,
    pub messages_by_department: Vec<DepartmentCount>,
    /// Day (`YYYY-MM-DD`) to per-institution counts
    pub messages_daily: Option<BTreeMap<String, Vec<InstitutionCount>>>,
}

/// Parsed form of `AnalyticsQuery`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsRequest {
    pub range: TimeRange,
    pub institution_id: Option<String>,
    pub daily: bool,
    pub per_feed: bool,
}

impl StatsRequest {
    pub fn parse(query: &AnalyticsQuery) -> Result<Self, CivicError> {
        let start = query.start.as_deref().map(|s| parse_bound(s, Bound::Start)).transpose()?;
        let end = query.end.as_deref().map(|s| parse_bound(s, Bound::End)).transpose()?;
        if let (Some(start), Some(end)) = (&start, &end) {
            if start > end {
                return Err(CivicError::InvalidInput("start must not be after end".into()));
            }
        }

        Ok(Self {
            range: TimeRange {
                start: start.map(|t| t.format(STORE_FORMAT).to_string()),
                end: end.map(|t| t.format(STORE_FORMAT).to_string()),
            },
            institution_id: query
                .institution
                .as_deref()
                .map(str::trim)
                .filter(|i| !i.is_empty())
                .map(str::to_string),
            daily: truthy(query.daily.as_deref()),
            per_feed: truthy(query.per_feed.as_deref()),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Bound {
    Start,
    End,
}

fn parse_bound(value: &str, bound: Bound) -> Result<DateTime<Utc>, CivicError> {
    let value = value.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Ok(at.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| {
        CivicError::InvalidInput(format!("'{}' is not a date (YYYY-MM-DD) or RFC 3339 time", value))
    })?;
    let at = match bound {
        Bound::Start => day.and_hms_opt(0, 0, 0),
        Bound::End => day.and_hms_opt(23, 59, 59),
    };
    at.map(|t| t.and_utc())
        .ok_or_else(|| CivicError::InvalidInput(format!("'{}' is out of range", value)))
}

fn truthy(value: Option<&str>) -> bool {
    value
        .map(|v| v.trim().to_ascii_lowercase())
        .is_some_and(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
}

pub struct AnalyticsService {
    store: Arc<Store>,
}

impl AnalyticsService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn admin_stats(&self, admin: &Principal, query: &AnalyticsQuery) -> Result<AdminStats, CivicError> {
        require_admin(admin)?;
        let request = StatsRequest::parse(query)?;
        self.compute(&request)
    }

    pub fn compute(&self, request: &StatsRequest) -> Result<AdminStats, CivicError> {
        let institution = request.institution_id.as_deref();

        self.store.with_conn(|conn| {
            let messages = analytics::message_facts(conn, &request.range, institution)?;
            let selections = analytics::vote_selection_facts(conn, &request.range)?;
            let reactions = analytics::reaction_facts(conn, &request.range)?;
            let polls = analytics::all_polls(conn)?;
            let poll_ids: Vec<String> = polls.iter().map(|p| p.id.clone()).collect();
            let options = poll_repo::options_for_polls(conn, &poll_ids)?;
            let feeds = if request.per_feed {
                analytics::feed_headers(conn, institution)?
            } else {
                Vec::new()
            };

            let institution_names: HashMap<String, String> = institutions::list_institutions(conn)?
                .into_iter()
                .map(|i| (i.id, i.name))
                .collect();
            let department_names: HashMap<String, String> = institutions::list_departments(conn, None)?
                .into_iter()
                .map(|d| {
                    let inst = institution_names.get(&d.institution_id).cloned().unwrap_or_default();
                    (d.id, format!("{} ({})", d.name, inst))
                })
                .collect();

            let messages_daily = if request.daily {
                daily_buckets(&request.range, &messages, &institution_names)?
            } else {
                None
            };

            debug!(
                messages = messages.len(),
                votes = selections.len(),
                reactions = reactions.len(),
                "Computed admin analytics"
            );

            Ok(AdminStats {
                problem_type_stats: problem_type_counts(&messages),
                poll_stats: poll_stats(&polls, &options, &selections),
                feed_reactions: reaction_stats(&reactions, request.per_feed.then_some(feeds.as_slice())),
                messages_by_institution: institution_counts(messages.iter().map(|m| m.0.as_str()), &institution_names),
                messages_by_department: department_counts(&messages, &department_names),
                messages_daily,
            })
        })
    }
}

/// Sort `(key, count)` pairs by count descending, then key
fn ranked<K: Ord>(counts: HashMap<K, i64>) -> Vec<(K, i64)> {
    let mut ranked: Vec<(K, i64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}

fn problem_type_counts(messages: &[MessageFact]) -> Vec<ProblemTypeCount> {
    let mut counts: HashMap<String, i64> = HashMap::new();
    for (_, _, problem_type, _) in messages {
        let key = problem_type
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or("other");
        *counts.entry(key.to_string()).or_default() += 1;
    }
    ranked(counts)
        .into_iter()
        .map(|(problem_type, count)| ProblemTypeCount { problem_type, count })
        .collect()
}

fn poll_stats(polls: &[Poll], options: &[PollOption], selections: &[(String, String, String)]) -> Vec<PollStats> {
    let mut voters: HashMap<&str, HashSet<&str>> = HashMap::new();
    let mut picks: HashMap<&str, i64> = HashMap::new();
    for (poll_id, vote_id, option_id) in selections {
        voters.entry(poll_id.as_str()).or_default().insert(vote_id.as_str());
        *picks.entry(option_id.as_str()).or_default() += 1;
    }

    polls
        .iter()
        .map(|poll| PollStats {
            poll_id: poll.id.clone(),
            question: poll.question.clone(),
            total_voters: voters.get(poll.id.as_str()).map_or(0, |v| v.len() as i64),
            options: options
                .iter()
                .filter(|o| o.poll_id == poll.id)
                .map(|o| OptionCount {
                    option_id: o.id.clone(),
                    text: o.text.clone(),
                    votes_count: picks.get(o.id.as_str()).copied().unwrap_or(0),
                })
                .collect(),
        })
        .collect()
}

fn empty_breakdown() -> BTreeMap<String, i64> {
    ReactionKind::ALL.iter().map(|k| (k.as_str().to_string(), 0)).collect()
}

fn reaction_stats(reactions: &[(String, String)], feeds: Option<&[(String, String)]>) -> ReactionStats {
    let mut by_type = empty_breakdown();
    let mut by_feed: HashMap<&str, BTreeMap<String, i64>> = HashMap::new();
    for (feed_id, reaction) in reactions {
        *by_type.entry(reaction.clone()).or_default() += 1;
        *by_feed
            .entry(feed_id.as_str())
            .or_insert_with(empty_breakdown)
            .entry(reaction.clone())
            .or_default() += 1;
    }

    let per_feed = feeds
        .unwrap_or_default()
        .iter()
        .map(|(feed_id, created_at)| {
            let by_type = by_feed.remove(feed_id.as_str()).unwrap_or_else(empty_breakdown);
            FeedReactionStats {
                feed_id: feed_id.clone(),
                created_at: created_at.clone(),
                total_reactions: by_type.values().sum(),
                by_type,
            }
        })
        .collect();

    ReactionStats {
        total: reactions.len() as i64,
        by_type,
        per_feed,
    }
}

fn institution_counts<'a>(
    institution_ids: impl Iterator<Item = &'a str>,
    names: &HashMap<String, String>,
) -> Vec<InstitutionCount> {
    let mut counts: HashMap<&str, i64> = HashMap::new();
    for id in institution_ids {
        *counts.entry(id).or_default() += 1;
    }
    ranked(counts)
        .into_iter()
        .map(|(id, count)| InstitutionCount {
            institution_id: id.to_string(),
            institution_name: names.get(id).cloned().unwrap_or_default(),
            count,
        })
        .collect()
}

fn department_counts(messages: &[MessageFact], names: &HashMap<String, String>) -> Vec<DepartmentCount> {
    let mut counts: HashMap<Option<&str>, i64> = HashMap::new();
    for (_, department_id, _, _) in messages {
        *counts.entry(department_id.as_deref()).or_default() += 1;
    }
    ranked(counts)
        .into_iter()
        .map(|(id, count)| DepartmentCount {
            department_id: id.map(str::to_string),
            department_name: id.and_then(|d| names.get(d)).cloned().unwrap_or_default(),
            count,
        })
        .collect()
}

/// Per-day counts for every day of a bounded window; `None` without both
/// bounds
fn daily_buckets(
    range: &TimeRange,
    messages: &[MessageFact],
    names: &HashMap<String, String>,
) -> Result<Option<BTreeMap<String, Vec<InstitutionCount>>>, CivicError> {
    let (Some(start), Some(end)) = (&range.start, &range.end) else {
        return Ok(None);
    };
    let first = day_of(start)?;
    let last = day_of(end)?;
    let days = (last - first).num_days() + 1;
    if days > MAX_DAILY_BUCKETS {
        return Err(CivicError::InvalidInput(format!(
            "Daily breakdown covers at most {} days",
            MAX_DAILY_BUCKETS
        )));
    }

    let mut buckets = BTreeMap::new();
    for offset in 0..days {
        let day = (first + Duration::days(offset)).format("%Y-%m-%d").to_string();
        let ids = messages
            .iter()
            .filter(|m| m.3.starts_with(&day))
            .map(|m| m.0.as_str());
        let counts = institution_counts(ids, names);
        buckets.insert(day, counts);
    }
    Ok(Some(buckets))
}

fn day_of(timestamp: &str) -> Result<NaiveDate, CivicError> {
    timestamp
        .get(..10)
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .ok_or_else(|| CivicError::Internal(format!("Malformed timestamp {}", timestamp)))
}
