use chrono::{Datelike, Duration, NaiveDateTime};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another instance of the application has locked the database
    #[error("Another instance of feedkeeper appears to be running. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Timestamp Formats
// ============================================================================

/// Sortable local timestamp used for `last_retrieved` and `row_insert_date_time`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Universal sortable pattern used for `article_date`.
pub const ARTICLE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%SZ";

/// Rendered in place of a publication date that could not be parsed.
pub const UNKNOWN_ARTICLE_DATE: &str = "0001-01-01 00:00:00Z";

/// Format a timestamp the way the `feeds` and `articles` tables store it.
pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Seed used when a backdate falls outside the representable range.
pub const EARLIEST_TIMESTAMP: &str = "0001-01-01 00:00:00";

/// `now` minus `days`, formatted for `last_retrieved`.
///
/// EDGE-007: An out-of-range backdate from config yields [`EARLIEST_TIMESTAMP`],
/// which still leaves the feed due on the next cycle.
fn backdated_timestamp(now: NaiveDateTime, days: i64) -> String {
    match Duration::try_days(days).and_then(|backdate| now.checked_sub_signed(backdate)) {
        Some(seeded) if seeded.year() >= 1 => format_timestamp(seeded),
        _ => {
            tracing::warn!(backdate_days = days, "Backdate out of range, seeding earliest timestamp");
            EARLIEST_TIMESTAMP.to_string()
        }
    }
}

/// Parse a stored `last_retrieved` / `row_insert_date_time` value.
///
/// Accepts the exact sortable format only (plus surrounding whitespace).
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT).ok()
}

// ============================================================================
// Helper Types
// ============================================================================

/// Internal row type for `feeds` queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub feed_name: String,
    pub feed_url: String,
    pub last_retrieved: String,
    pub retrieve_limit_hrs: String,
    pub retention_days: String,
}

impl FeedDbRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            id: self.id,
            name: self.feed_name,
            url: self.feed_url,
            last_retrieved: self.last_retrieved,
            retrieve_limit_hrs: self.retrieve_limit_hrs,
            retention_days: self.retention_days,
        }
    }
}

/// Internal row type for `articles` queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleDbRow {
    pub id: i64,
    pub feed_name: String,
    pub article_url: String,
    pub article_date: String,
    pub headline_text: String,
    pub article_text: Option<String>,
    pub article_summary: Option<String>,
    pub row_insert_date_time: String,
}

impl ArticleDbRow {
    pub(crate) fn into_article(self) -> Article {
        Article {
            id: self.id,
            feed_name: self.feed_name,
            url: self.article_url,
            headline: self.headline_text,
            summary: self.article_summary.unwrap_or_default(),
            body: self.article_text.unwrap_or_default(),
            published_at: self.article_date,
            inserted_at: self.row_insert_date_time,
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Values applied to a subscription that arrives without store-side settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedDefaults {
    /// Minimum hours between two fetches of the same feed.
    pub retrieve_limit_hrs: i64,
    /// Days an article is kept after its last import.
    pub retention_days: i64,
    /// How far in the past `last_retrieved` is seeded so a new feed is due at once.
    pub backdate_days: i64,
}

impl Default for FeedDefaults {
    fn default() -> Self {
        Self {
            retrieve_limit_hrs: 1,
            retention_days: 45,
            backdate_days: 4,
        }
    }
}

/// A feed subscription.
///
/// `name` is the stable external key: articles reference their feed by name, not
/// by `id`, so renaming a feed must go through [`Database::upsert_feed`] with the
/// feed's id, which rewrites the article keys in the same transaction.
///
/// `retrieve_limit_hrs` and `retention_days` are kept as the free-form text the
/// `feeds` table stores. Use [`Feed::retrieve_limit_hours`] and
/// [`Feed::retention_days_value`] to read them; an unparsable value yields `None`.
///
/// [`Database::upsert_feed`]: super::Database::upsert_feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feed {
    /// Store-assigned key; `<= 0` means "not yet persisted".
    pub id: i64,
    pub name: String,
    pub url: String,
    pub last_retrieved: String,
    pub retrieve_limit_hrs: String,
    pub retention_days: String,
}

impl Feed {
    /// Build a subscription that has never been fetched.
    ///
    /// `last_retrieved` is seeded `defaults.backdate_days` before `now`, which makes
    /// the feed eligible for refresh on the next cycle.
    pub fn new_subscription(
        name: impl Into<String>,
        url: impl Into<String>,
        defaults: &FeedDefaults,
        now: NaiveDateTime,
    ) -> Self {
        Self {
            id: -1,
            name: name.into(),
            url: url.into(),
            last_retrieved: backdated_timestamp(now, defaults.backdate_days),
            retrieve_limit_hrs: defaults.retrieve_limit_hrs.to_string(),
            retention_days: defaults.retention_days.to_string(),
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.id > 0
    }

    pub fn retrieve_limit_hours(&self) -> Option<i64> {
        self.retrieve_limit_hrs.trim().parse().ok()
    }

    pub fn retention_days_value(&self) -> Option<i64> {
        self.retention_days.trim().parse().ok()
    }

    pub fn last_retrieved_at(&self) -> Option<NaiveDateTime> {
        parse_timestamp(&self.last_retrieved)
    }
}

/// One stored article.
///
/// `(feed_name, url)` is the dedup key. Empty `summary`/`body` are stored as
/// empty text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Article {
    pub id: i64,
    pub feed_name: String,
    pub url: String,
    pub headline: String,
    pub summary: String,
    pub body: String,
    /// Publication date in [`ARTICLE_DATE_FORMAT`].
    pub published_at: String,
    /// Import time in [`TIMESTAMP_FORMAT`]; drives retention.
    pub inserted_at: String,
}

impl Article {
    /// Articles without a headline, or without both body and summary, are never stored.
    pub fn is_storable(&self) -> bool {
        !self.headline.trim().is_empty()
            && (!self.body.trim().is_empty() || !self.summary.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_new_subscription_is_backdated() {
        let defaults = FeedDefaults::default();
        let feed = Feed::new_subscription("tech", "https://a.com/rss", &defaults, at(2024, 3, 10, 12));

        assert_eq!(feed.id, -1);
        assert!(!feed.is_persisted());
        assert_eq!(feed.last_retrieved, "2024-03-06 12:00:00");
        assert_eq!(feed.retrieve_limit_hours(), Some(1));
        assert_eq!(feed.retention_days_value(), Some(45));
    }

    #[test]
    fn test_out_of_range_backdate_seeds_earliest() {
        let now = at(2024, 3, 10, 12);
        for backdate_days in [i64::MAX / 1000, i64::MAX, 1_000_000] {
            let defaults = FeedDefaults {
                backdate_days,
                ..FeedDefaults::default()
            };
            let feed = Feed::new_subscription("tech", "https://a.com/rss", &defaults, now);
            assert_eq!(feed.last_retrieved, EARLIEST_TIMESTAMP);
            assert_eq!(feed.last_retrieved_at(), Some(at(1, 1, 1, 0)));
        }
    }

    #[test]
    fn test_unparsable_settings_yield_none() {
        let feed = Feed {
            id: 3,
            name: "x".into(),
            url: "https://x.com".into(),
            last_retrieved: "yesterday".into(),
            retrieve_limit_hrs: "often".into(),
            retention_days: "".into(),
        };
        assert_eq!(feed.retrieve_limit_hours(), None);
        assert_eq!(feed.retention_days_value(), None);
        assert_eq!(feed.last_retrieved_at(), None);
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = at(2023, 7, 1, 9);
        assert_eq!(parse_timestamp(&format_timestamp(now)), Some(now));
    }

    #[test]
    fn test_article_storable_rules() {
        let mut article = Article {
            headline: "Title".into(),
            ..Default::default()
        };
        assert!(!article.is_storable(), "headline alone is not enough");

        article.summary = "  ".into();
        assert!(!article.is_storable(), "whitespace summary does not count");

        article.body = "<p>Body</p>".into();
        assert!(article.is_storable());

        article.headline = String::new();
        assert!(!article.is_storable(), "body without headline is rejected");
    }
}
