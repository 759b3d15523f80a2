use sqlx::SqliteConnection;

use super::articles::{rename_feed_articles_in, upsert_article_in};
use super::schema::Database;
use super::types::{Article, DatabaseError, Feed, FeedDbRow};

/// Counts produced by [`Database::complete_feed_import`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: usize,
    pub updated: usize,
    /// Articles dropped for lacking a headline or any body/summary text.
    pub rejected: usize,
}

// ============================================================================
// Connection-level helpers (shared by pool and transaction callers)
// ============================================================================

pub(crate) async fn feed_exists_by_id_in(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<bool, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feeds WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count > 0)
}

pub(crate) async fn feed_exists_by_name_in(
    conn: &mut SqliteConnection,
    name: &str,
) -> Result<bool, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feeds WHERE feed_name = ?")
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count > 0)
}

async fn get_feed_by_id_in(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<Feed>, sqlx::Error> {
    let row = sqlx::query_as::<_, FeedDbRow>(
        r#"
        SELECT id, feed_name, feed_url, last_retrieved, retrieve_limit_hrs, retention_days
        FROM feeds
        WHERE id = ?
    "#,
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(FeedDbRow::into_feed))
}

async fn insert_feed_in(conn: &mut SqliteConnection, feed: &Feed) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO feeds (feed_name, feed_url, last_retrieved, retrieve_limit_hrs, retention_days)
        VALUES (?, ?, ?, ?, ?)
    "#,
    )
    .bind(&feed.name)
    .bind(&feed.url)
    .bind(&feed.last_retrieved)
    .bind(&feed.retrieve_limit_hrs)
    .bind(&feed.retention_days)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert-or-update a feed.
///
/// Addressed by id when `feed.id > 0` and that row exists: a changed name is first
/// cascaded onto the feed's articles, then every column is rewritten. Otherwise
/// the feed is addressed by name and everything but the name is rewritten.
/// Absent feeds are inserted with a fresh id.
///
/// Callers wrap this in a transaction so the cascade and the update commit together.
pub(crate) async fn upsert_feed_in(
    conn: &mut SqliteConnection,
    feed: &Feed,
) -> Result<(), sqlx::Error> {
    if feed.is_persisted() {
        if let Some(current) = get_feed_by_id_in(conn, feed.id).await? {
            if current.name != feed.name {
                let moved = rename_feed_articles_in(conn, &current.name, &feed.name).await?;
                tracing::info!(
                    from = %current.name,
                    to = %feed.name,
                    articles = moved,
                    "Feed renamed"
                );
            }

            sqlx::query(
                r#"
                UPDATE feeds SET
                    feed_name = ?,
                    feed_url = ?,
                    last_retrieved = ?,
                    retrieve_limit_hrs = ?,
                    retention_days = ?
                WHERE id = ?
            "#,
            )
            .bind(&feed.name)
            .bind(&feed.url)
            .bind(&feed.last_retrieved)
            .bind(&feed.retrieve_limit_hrs)
            .bind(&feed.retention_days)
            .bind(feed.id)
            .execute(&mut *conn)
            .await?;
            return Ok(());
        }
    }

    if feed_exists_by_name_in(conn, &feed.name).await? {
        sqlx::query(
            r#"
            UPDATE feeds SET
                feed_url = ?,
                last_retrieved = ?,
                retrieve_limit_hrs = ?,
                retention_days = ?
            WHERE feed_name = ?
        "#,
        )
        .bind(&feed.url)
        .bind(&feed.last_retrieved)
        .bind(&feed.retrieve_limit_hrs)
        .bind(&feed.retention_days)
        .bind(&feed.name)
        .execute(&mut *conn)
        .await?;
    } else {
        insert_feed_in(conn, feed).await?;
    }

    Ok(())
}

impl Database {
    // ========================================================================
    // Feed Queries
    // ========================================================================

    pub async fn feed_exists_by_id(&self, id: i64) -> Result<bool, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        Ok(feed_exists_by_id_in(&mut conn, id).await?)
    }

    pub async fn feed_exists(&self, name: &str) -> Result<bool, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        Ok(feed_exists_by_name_in(&mut conn, name).await?)
    }

    /// All feeds ordered by name
    pub async fn get_all_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let rows = sqlx::query_as::<_, FeedDbRow>(
            r#"
            SELECT id, feed_name, feed_url, last_retrieved, retrieve_limit_hrs, retention_days
            FROM feeds
            ORDER BY feed_name
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FeedDbRow::into_feed).collect())
    }

    pub async fn get_feed_by_id(&self, id: i64) -> Result<Option<Feed>, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        Ok(get_feed_by_id_in(&mut conn, id).await?)
    }

    pub async fn get_feed_by_name(&self, name: &str) -> Result<Option<Feed>, DatabaseError> {
        let row = sqlx::query_as::<_, FeedDbRow>(
            r#"
            SELECT id, feed_name, feed_url, last_retrieved, retrieve_limit_hrs, retention_days
            FROM feeds
            WHERE feed_name = ?
        "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(FeedDbRow::into_feed))
    }

    // ========================================================================
    // Feed Mutations
    // ========================================================================

    /// Insert or update a feed atomically, cascading a rename onto its articles.
    ///
    /// Applying the same feed twice leaves a single row.
    pub async fn upsert_feed(&self, feed: &Feed) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;
        upsert_feed_in(&mut tx, feed).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Upsert a feed and read back the stored row by name.
    ///
    /// This is the create/update entry point for subscription editors: the returned
    /// feed carries the store-assigned id.
    pub async fn save_feed(&self, feed: &Feed) -> Result<Feed, DatabaseError> {
        self.upsert_feed(feed).await?;
        self.get_feed_by_name(&feed.name)
            .await?
            .ok_or_else(|| DatabaseError::Other(sqlx::Error::RowNotFound))
    }

    /// Delete a feed row by id.
    ///
    /// Does not touch articles: call [`Database::delete_articles_for_feed`] first,
    /// or use [`Database::remove_feed`] which does both in one transaction.
    pub async fn delete_feed_by_id(&self, id: i64) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Remove a feed and all of its articles.
    ///
    /// Returns `true` when the feed existed and is now gone, `false` for ids that
    /// are not persisted or not present.
    pub async fn remove_feed(&self, id: i64) -> Result<bool, DatabaseError> {
        if id <= 0 {
            return Ok(false);
        }

        let mut tx = self.pool.begin().await?;
        let Some(feed) = get_feed_by_id_in(&mut tx, id).await? else {
            return Ok(false);
        };

        let articles = sqlx::query("DELETE FROM articles WHERE feed_name = ?")
            .bind(&feed.name)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let still_there = feed_exists_by_id_in(&mut tx, id).await?;
        tx.commit().await?;

        tracing::info!(feed = %feed.name, articles = articles, "Feed removed");
        Ok(!still_there)
    }

    /// Write one feed header plus its articles as a single atomic unit.
    ///
    /// The feed is upserted first (including any rename cascade), then each storable
    /// article is upserted by `(feed_name, url)`. Articles are re-keyed to
    /// `feed.name`. If any statement fails the whole import is rolled back.
    pub async fn complete_feed_import(
        &self,
        feed: &Feed,
        articles: &[Article],
    ) -> Result<ImportSummary, DatabaseError> {
        let mut summary = ImportSummary::default();
        let mut tx = self.pool.begin().await?;

        upsert_feed_in(&mut tx, feed).await?;

        for article in articles {
            if !article.is_storable() {
                summary.rejected += 1;
                continue;
            }
            let keyed;
            let article = if article.feed_name == feed.name {
                article
            } else {
                keyed = Article {
                    feed_name: feed.name.clone(),
                    ..article.clone()
                };
                &keyed
            };
            if upsert_article_in(&mut tx, article).await? {
                summary.inserted += 1;
            } else {
                summary.updated += 1;
            }
        }

        tx.commit().await?;

        tracing::debug!(
            feed = %feed.name,
            inserted = summary.inserted,
            updated = summary.updated,
            rejected = summary.rejected,
            "Feed import committed"
        );
        Ok(summary)
    }
}
