use chrono::{Duration, NaiveDateTime};

use crate::storage::Feed;

/// Whether `feed` may be fetched again at `now`.
///
/// Eligible iff `now` is strictly past `last_retrieved + retrieve_limit_hrs`.
/// An unparsable limit or timestamp makes the feed ineligible, as does a limit
/// too large to add to the timestamp.
pub fn is_eligible_for_refresh(feed: &Feed, now: NaiveDateTime) -> bool {
    let Some(limit_hours) = feed.retrieve_limit_hours() else {
        return false;
    };
    let Some(last_retrieved) = feed.last_retrieved_at() else {
        return false;
    };

    Duration::try_hours(limit_hours)
        .and_then(|limit| last_retrieved.checked_add_signed(limit))
        .is_some_and(|renewal| now > renewal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{format_timestamp, FeedDefaults};
    use chrono::NaiveDate;

    fn at(d: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, d)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn feed(last_retrieved: &str, limit: &str) -> Feed {
        Feed {
            id: 1,
            name: "tech".into(),
            url: "https://example.com/rss".into(),
            last_retrieved: last_retrieved.into(),
            retrieve_limit_hrs: limit.into(),
            retention_days: "45".into(),
        }
    }

    #[test]
    fn test_not_eligible_right_after_retrieval() {
        let now = at(10, 12, 0);
        assert!(!is_eligible_for_refresh(&feed(&format_timestamp(now), "1"), now));
    }

    #[test]
    fn test_window_boundary_is_exclusive() {
        let f = feed("2024-06-10 12:00:00", "2");
        assert!(!is_eligible_for_refresh(&f, at(10, 13, 59)));
        assert!(!is_eligible_for_refresh(&f, at(10, 14, 0)));
        assert!(is_eligible_for_refresh(&f, at(10, 14, 1)));
    }

    #[test]
    fn test_zero_limit_is_eligible_once_time_moves() {
        let f = feed("2024-06-10 12:00:00", "0");
        assert!(is_eligible_for_refresh(&f, at(10, 12, 1)));
    }

    #[test]
    fn test_unparsable_values_are_ineligible() {
        let now = at(20, 0, 0);
        assert!(!is_eligible_for_refresh(&feed("2024-06-10 12:00:00", "hourly"), now));
        assert!(!is_eligible_for_refresh(&feed("", "1"), now));
        assert!(!is_eligible_for_refresh(&feed("10/06/2024 12:00", "1"), now));
        assert!(!is_eligible_for_refresh(
            &feed("2024-06-10 12:00:00", &i64::MAX.to_string()),
            now
        ));
    }

    #[test]
    fn test_new_subscription_is_immediately_eligible() {
        let now = at(10, 12, 0);
        let f = Feed::new_subscription("tech", "https://example.com", &FeedDefaults::default(), now);
        assert!(is_eligible_for_refresh(&f, now));
    }
}
