//! Integration tests for the subscription lifecycle: subscribe, import, rename,
//! edit, expire, remove.
//!
//! Each test creates its own database. These tests exercise the storage layer
//! end-to-end, verifying that operations compose correctly across feeds and
//! articles.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use pretty_assertions::assert_eq;

use feedkeeper::storage::{format_timestamp, Article, Database, Feed, FeedDefaults};
use feedkeeper::sync::{validate_subscription, SubscriptionError};

async fn test_db() -> Database {
    Database::open(":memory:").await.unwrap()
}

fn t0() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 1)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap()
}

fn article(feed: &str, n: u32, inserted_at: NaiveDateTime) -> Article {
    Article {
        feed_name: feed.to_string(),
        url: format!("https://example.com/{}/{}", feed, n),
        headline: format!("Headline {}", n),
        summary: format!("Summary {}", n),
        published_at: "2024-03-01 07:00:00Z".to_string(),
        inserted_at: format_timestamp(inserted_at),
        ..Article::default()
    }
}

async fn subscribe(db: &Database, name: &str) -> Feed {
    let feed = Feed::new_subscription(
        name,
        format!("https://{}.example.com/rss", name),
        &FeedDefaults::default(),
        t0(),
    );
    db.save_feed(&feed).await.unwrap()
}

// ============================================================================
// Subscribe Tests
// ============================================================================

#[tokio::test]
async fn test_subscribe_feed_appears_in_list() {
    let db = test_db().await;

    let feed = subscribe(&db, "tech").await;
    assert!(feed.is_persisted());

    let feeds = db.get_all_feeds().await.unwrap();
    assert_eq!(feeds, vec![feed.clone()]);
    assert_eq!(feeds[0].retrieve_limit_hrs, "1");
    assert_eq!(feeds[0].retention_days, "45");
    assert!(db.feed_exists("tech").await.unwrap());
    assert!(db.feed_exists_by_id(feed.id).await.unwrap());
}

#[tokio::test]
async fn test_saving_same_subscription_twice_keeps_one_row() {
    let db = test_db().await;

    let first = subscribe(&db, "tech").await;
    let second = subscribe(&db, "tech").await;

    assert_eq!(first.id, second.id);
    assert_eq!(db.get_all_feeds().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_new_subscription_validated_against_existing() {
    let db = test_db().await;
    subscribe(&db, "tech").await;
    let existing = db.get_all_feeds().await.unwrap();

    let clash = Feed::new_subscription(
        "other",
        "HTTPS://TECH.example.com/rss",
        &FeedDefaults::default(),
        t0(),
    );
    assert!(matches!(
        validate_subscription(&existing, &clash, false),
        Err(SubscriptionError::DuplicateUrl(_))
    ));

    let fresh = Feed::new_subscription(
        "science",
        "https://science.example.com/rss",
        &FeedDefaults::default(),
        t0(),
    );
    assert!(validate_subscription(&existing, &fresh, false).is_ok());
}

// ============================================================================
// Import Tests
// ============================================================================

#[tokio::test]
async fn test_import_persists_feed_and_articles_together() {
    let db = test_db().await;
    let feed = subscribe(&db, "tech").await;

    let refreshed = Feed {
        last_retrieved: format_timestamp(t0()),
        ..feed.clone()
    };
    let batch = vec![article("tech", 1, t0()), article("tech", 2, t0())];
    let summary = db.complete_feed_import(&refreshed, &batch).await.unwrap();
    assert_eq!((summary.inserted, summary.updated), (2, 0));

    let stored = db.get_feed_by_id(feed.id).await.unwrap().unwrap();
    assert_eq!(stored.last_retrieved, "2024-03-01 08:00:00");

    let max_id = db.get_max_article_id("tech").await.unwrap();
    let range = db.get_articles_in_range("tech", 0, max_id).await.unwrap();
    assert_eq!(range.len(), 2);
    assert_eq!(range[1].headline, "Headline 2");
}

#[tokio::test]
async fn test_reimport_updates_instead_of_duplicating() {
    let db = test_db().await;
    let feed = subscribe(&db, "tech").await;

    db.complete_feed_import(&feed, &[article("tech", 1, t0())])
        .await
        .unwrap();

    let mut revised = article("tech", 1, t0() + Duration::hours(3));
    revised.headline = "Headline 1 (updated)".to_string();
    let summary = db.complete_feed_import(&feed, &[revised]).await.unwrap();
    assert_eq!((summary.inserted, summary.updated), (0, 1));

    let articles = db.get_articles_for_feed("tech").await.unwrap();
    assert_eq!(articles.len(), 1);
    assert_eq!(articles[0].headline, "Headline 1 (updated)");
    assert_eq!(articles[0].inserted_at, "2024-03-01 11:00:00");
}

// ============================================================================
// Rename Tests
// ============================================================================

#[tokio::test]
async fn test_rename_moves_articles_to_new_name() {
    let db = test_db().await;
    let feed = subscribe(&db, "tech").await;
    db.complete_feed_import(&feed, &[article("tech", 1, t0()), article("tech", 2, t0())])
        .await
        .unwrap();

    let renamed = Feed {
        name: "technology".to_string(),
        ..feed.clone()
    };
    let existing = db.get_all_feeds().await.unwrap();
    validate_subscription(&existing, &renamed, false).unwrap();
    let saved = db.save_feed(&renamed).await.unwrap();

    assert_eq!(saved.id, feed.id);
    assert!(!db.feed_exists("tech").await.unwrap());
    assert_eq!(db.count_articles("tech").await.unwrap(), 0);
    assert_eq!(db.count_articles("technology").await.unwrap(), 2);
    assert!(
        db.article_exists("technology", "https://example.com/tech/1")
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_rename_onto_existing_name_is_refused() {
    let db = test_db().await;
    let tech = subscribe(&db, "tech").await;
    subscribe(&db, "science").await;

    let renamed = Feed {
        name: "science".to_string(),
        ..tech
    };
    let existing = db.get_all_feeds().await.unwrap();
    assert!(matches!(
        validate_subscription(&existing, &renamed, false),
        Err(SubscriptionError::DuplicateName(_))
    ));
}

// ============================================================================
// Expiry Tests
// ============================================================================

#[tokio::test]
async fn test_expiry_uses_each_feeds_own_retention() {
    let db = test_db().await;
    let short = Feed {
        retention_days: "2".to_string(),
        ..subscribe(&db, "short").await
    };
    db.save_feed(&short).await.unwrap();
    let long = subscribe(&db, "long").await;

    db.complete_feed_import(&short, &[article("short", 1, t0())])
        .await
        .unwrap();
    db.complete_feed_import(&long, &[article("long", 1, t0())])
        .await
        .unwrap();

    // One day inside the short window: nothing goes
    let deleted = db
        .delete_all_expired_articles_at(t0() + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(deleted, 0);

    let deleted = db
        .delete_all_expired_articles_at(t0() + Duration::days(3))
        .await
        .unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(db.count_articles("short").await.unwrap(), 0);
    assert_eq!(db.count_articles("long").await.unwrap(), 1);
}

// ============================================================================
// Remove Tests
// ============================================================================

#[tokio::test]
async fn test_remove_feed_deletes_its_articles() {
    let db = test_db().await;
    let tech = subscribe(&db, "tech").await;
    let science = subscribe(&db, "science").await;
    db.complete_feed_import(&tech, &[article("tech", 1, t0())])
        .await
        .unwrap();
    db.complete_feed_import(&science, &[article("science", 1, t0())])
        .await
        .unwrap();

    assert!(db.remove_feed(tech.id).await.unwrap());
    assert!(!db.remove_feed(tech.id).await.unwrap());

    assert_eq!(db.get_all_feeds().await.unwrap(), vec![science]);
    assert_eq!(db.count_articles("tech").await.unwrap(), 0);
    assert_eq!(db.count_articles("science").await.unwrap(), 1);
    assert_eq!(db.get_max_article_id("tech").await.unwrap(), -1);
}

// ============================================================================
// Persistence Tests
// ============================================================================

#[tokio::test]
async fn test_file_database_survives_reopen_and_repairs_schema() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rss.db");
    let path = path.to_str().unwrap();

    {
        let db = Database::open(path).await.unwrap();
        let feed = subscribe(&db, "tech").await;
        db.complete_feed_import(&feed, &[article("tech", 1, t0())])
            .await
            .unwrap();
    }

    let db = Database::open(path).await.unwrap();
    assert!(db.missing_tables().await.unwrap().is_empty());
    assert_eq!(db.get_all_feeds().await.unwrap().len(), 1);
    assert_eq!(db.count_articles("tech").await.unwrap(), 1);
}
