use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveTime, TimeZone};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::db::{Database, KnownApps};

pub const SECONDS_PER_DAY: i64 = 86_400;

const DATE_FORMAT: &str = "%Y-%m-%d";
const RANGE_SEPARATOR: &str = "to";

/// Structured search intent. Every term of the input lands in exactly one of
/// `app_filters` or `free_text_terms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    pub min_timestamp: i64,
    pub max_timestamp: i64,
    pub app_filters: BTreeSet<String>,
    pub free_text_terms: Vec<String>,
    pub full_text: bool,
}

impl SearchQuery {
    /// Unfiltered query covering the 24 hours starting at `day_start`.
    pub fn for_day(day_start: i64) -> Self {
        Self {
            min_timestamp: day_start,
            max_timestamp: day_start + SECONDS_PER_DAY,
            app_filters: BTreeSet::new(),
            free_text_terms: Vec::new(),
            full_text: false,
        }
    }

    pub fn has_filters(&self) -> bool {
        !self.app_filters.is_empty() || !self.free_text_terms.is_empty()
    }

    pub fn contains_timestamp(&self, timestamp: i64) -> bool {
        timestamp >= self.min_timestamp && timestamp < self.max_timestamp
    }
}

/// Unix timestamp of local midnight at the start of `date`. Falls back to
/// UTC midnight when the local midnight does not exist (DST gap).
pub fn local_midnight(date: NaiveDate) -> i64 {
    let midnight = date.and_time(NaiveTime::MIN);
    match Local.from_local_datetime(&midnight).earliest() {
        Some(local) => local.timestamp(),
        None => midnight.and_utc().timestamp(),
    }
}

fn parse_date_token(token: &str) -> Option<NaiveDate> {
    let bytes = token.as_bytes();
    let shaped = bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
    if !shaped {
        return None;
    }
    NaiveDate::parse_from_str(token, DATE_FORMAT).ok()
}

/// Leading `YYYY-MM-DD` or `YYYY-MM-DD to YYYY-MM-DD`. Returns the half-open
/// interval and how many tokens were consumed.
fn leading_date_range(tokens: &[&str]) -> Option<((i64, i64), usize)> {
    let start = parse_date_token(tokens.first()?)?;
    let start_ts = local_midnight(start);

    let end = tokens
        .get(1)
        .filter(|sep| sep.eq_ignore_ascii_case(RANGE_SEPARATOR))
        .and_then(|_| tokens.get(2))
        .and_then(|token| parse_date_token(token));

    match end {
        Some(end) => {
            let end_ts = local_midnight(end);
            Some(((start_ts.min(end_ts), start_ts.max(end_ts)), 3))
        }
        None => Some(((start_ts, start_ts + SECONDS_PER_DAY), 1)),
    }
}

/// Parse free text into a [`SearchQuery`]. Without a leading date the interval
/// is the local day containing `today`.
pub fn parse_query(text: &str, full_text: bool, known: &KnownApps, today: NaiveDate) -> SearchQuery {
    let tokens: Vec<&str> = text.split_whitespace().collect();

    let ((min_timestamp, max_timestamp), consumed) = leading_date_range(&tokens)
        .unwrap_or_else(|| {
            let start = local_midnight(today);
            ((start, start + SECONDS_PER_DAY), 0)
        });

    let mut app_filters = BTreeSet::new();
    let mut free_text_terms = Vec::new();
    for token in &tokens[consumed..] {
        let term = token.to_lowercase();
        if known.classifies_as_app(&term) {
            app_filters.insert(term);
        } else {
            free_text_terms.push(term);
        }
    }

    SearchQuery {
        min_timestamp,
        max_timestamp,
        app_filters,
        free_text_terms,
        full_text,
    }
}

/// Parses queries against the store's known applications and evaluates them
/// against persisted rows. The known-app list is fetched on first use and
/// kept until [`QueryEngine::invalidate`] is called.
pub struct QueryEngine {
    db: Database,
    known_apps: RwLock<Option<Arc<KnownApps>>>,
}

impl QueryEngine {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            known_apps: RwLock::new(None),
        }
    }

    pub async fn known_apps(&self) -> Result<Arc<KnownApps>> {
        if let Some(cached) = self.known_apps.read().await.as_ref() {
            return Ok(Arc::clone(cached));
        }

        let mut guard = self.known_apps.write().await;
        if let Some(cached) = guard.as_ref() {
            return Ok(Arc::clone(cached));
        }

        let fetched = Arc::new(
            self.db
                .fetch_known_apps()
                .await
                .context("failed to load known applications")?,
        );
        debug!(
            "Cached {} app ids and {} app names for query parsing",
            fetched.app_ids.len(),
            fetched.app_names.len()
        );
        *guard = Some(Arc::clone(&fetched));
        Ok(fetched)
    }

    /// Drop the cached known-app list; the next parse refetches it.
    pub async fn invalidate(&self) {
        *self.known_apps.write().await = None;
    }

    pub async fn parse(&self, text: &str, full_text: bool) -> Result<SearchQuery> {
        let known = self.known_apps().await?;
        Ok(parse_query(text, full_text, &known, Local::now().date_naive()))
    }

    /// Timestamps of persisted snapshots that match `query`, ascending.
    pub async fn matching_stored_timestamps(&self, query: &SearchQuery) -> Result<Vec<i64>> {
        if !query.has_filters() {
            let timestamps = self.db.fetch_timestamps_since(query.min_timestamp).await?;
            return Ok(timestamps
                .into_iter()
                .take_while(|ts| *ts < query.max_timestamp)
                .collect());
        }

        let rows = self
            .db
            .fetch_snapshots_in_range(query.min_timestamp, query.max_timestamp)
            .await?;
        Ok(rows
            .iter()
            .filter(|snapshot| query.matches(snapshot))
            .map(|snapshot| snapshot.timestamp)
            .collect())
    }
}
