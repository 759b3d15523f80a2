use chrono::NaiveDateTime;
use sqlx::SqliteConnection;

use super::schema::Database;
use super::types::{format_timestamp, Article, ArticleDbRow, DatabaseError};

const ARTICLE_COLUMNS: &str = "id, feed_name, article_url, article_date, headline_text, \
     article_text, article_summary, row_insert_date_time";

// ============================================================================
// Connection-level helpers
// ============================================================================

pub(crate) async fn article_exists_in(
    conn: &mut SqliteConnection,
    feed_name: &str,
    url: &str,
) -> Result<bool, sqlx::Error> {
    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM articles WHERE feed_name = ? AND article_url = ?")
            .bind(feed_name)
            .bind(url)
            .fetch_one(&mut *conn)
            .await?;
    Ok(count > 0)
}

/// Insert-or-update one article keyed by `(feed_name, url)`.
///
/// Every other column is overwritten on update, `row_insert_date_time` included,
/// so re-importing an article restarts its retention window.
///
/// Returns `true` when a new row was inserted.
pub(crate) async fn upsert_article_in(
    conn: &mut SqliteConnection,
    article: &Article,
) -> Result<bool, sqlx::Error> {
    if article_exists_in(conn, &article.feed_name, &article.url).await? {
        sqlx::query(
            r#"
            UPDATE articles SET
                article_date = ?,
                headline_text = ?,
                article_text = ?,
                article_summary = ?,
                row_insert_date_time = ?
            WHERE feed_name = ? AND article_url = ?
        "#,
        )
        .bind(&article.published_at)
        .bind(&article.headline)
        .bind(&article.body)
        .bind(&article.summary)
        .bind(&article.inserted_at)
        .bind(&article.feed_name)
        .bind(&article.url)
        .execute(&mut *conn)
        .await?;
        return Ok(false);
    }

    sqlx::query(
        r#"
        INSERT INTO articles (
            feed_name, article_url, article_date, headline_text,
            article_text, article_summary, row_insert_date_time
        )
        VALUES (?, ?, ?, ?, ?, ?, ?)
    "#,
    )
    .bind(&article.feed_name)
    .bind(&article.url)
    .bind(&article.published_at)
    .bind(&article.headline)
    .bind(&article.body)
    .bind(&article.summary)
    .bind(&article.inserted_at)
    .execute(&mut *conn)
    .await?;
    Ok(true)
}

/// Re-key every article of `old_name` onto `new_name`. Returns the rows moved.
pub(crate) async fn rename_feed_articles_in(
    conn: &mut SqliteConnection,
    old_name: &str,
    new_name: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE articles SET feed_name = ? WHERE feed_name = ?")
        .bind(new_name)
        .bind(old_name)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

impl Database {
    // ========================================================================
    // Article Queries
    // ========================================================================

    pub async fn article_exists(&self, feed_name: &str, url: &str) -> Result<bool, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        Ok(article_exists_in(&mut conn, feed_name, url).await?)
    }

    /// All articles of a feed in insertion (id) order
    pub async fn get_articles_for_feed(
        &self,
        feed_name: &str,
    ) -> Result<Vec<Article>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM articles WHERE feed_name = ? ORDER BY id",
            ARTICLE_COLUMNS
        );
        let rows = sqlx::query_as::<_, ArticleDbRow>(&sql)
            .bind(feed_name)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ArticleDbRow::into_article).collect())
    }

    /// Articles of a feed whose id lies in `id_begin..=id_end`.
    ///
    /// Lets a reader page through a feed without loading it whole; pair it with
    /// [`Database::get_max_article_id`].
    pub async fn get_articles_in_range(
        &self,
        feed_name: &str,
        id_begin: i64,
        id_end: i64,
    ) -> Result<Vec<Article>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM articles WHERE feed_name = ? AND id >= ? AND id <= ? ORDER BY id",
            ARTICLE_COLUMNS
        );
        let rows = sqlx::query_as::<_, ArticleDbRow>(&sql)
            .bind(feed_name)
            .bind(id_begin)
            .bind(id_end)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(ArticleDbRow::into_article).collect())
    }

    /// Highest article id stored for a feed, or -1 when it has none.
    pub async fn get_max_article_id(&self, feed_name: &str) -> Result<i64, DatabaseError> {
        let (max,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(id) FROM articles WHERE feed_name = ?")
                .bind(feed_name)
                .fetch_one(&self.pool)
                .await?;
        Ok(max.unwrap_or(-1))
    }

    pub async fn count_articles(&self, feed_name: &str) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles WHERE feed_name = ?")
            .bind(feed_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // ========================================================================
    // Article Mutations
    // ========================================================================

    /// Insert or update a single article. Returns `true` on insert.
    ///
    /// Bulk imports should go through [`Database::complete_feed_import`], which
    /// commits the feed header and its articles together.
    pub async fn upsert_article(&self, article: &Article) -> Result<bool, DatabaseError> {
        let mut conn = self.pool.acquire().await?;
        Ok(upsert_article_in(&mut conn, article).await?)
    }

    pub async fn delete_articles_for_feed(&self, feed_name: &str) -> Result<u64, DatabaseError> {
        let result = sqlx::query("DELETE FROM articles WHERE feed_name = ?")
            .bind(feed_name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete every article older than its owning feed's retention window.
    ///
    /// An article is expired when `now` is past `row_insert_date_time` plus the
    /// feed's `retention_days`. One set-based statement joins the two tables.
    /// Feeds whose retention does not parse as a day count produce a NULL
    /// deadline in SQLite and their articles are kept.
    pub async fn delete_all_expired_articles_at(
        &self,
        now: NaiveDateTime,
    ) -> Result<u64, DatabaseError> {
        let result = sqlx::query(
            r#"
            DELETE FROM articles
            WHERE id IN (
                SELECT a.id
                FROM articles a
                JOIN feeds f ON a.feed_name = f.feed_name
                WHERE datetime(?) > datetime(
                    a.row_insert_date_time,
                    '+' || trim(f.retention_days) || ' days'
                )
            )
        "#,
        )
        .bind(format_timestamp(now))
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::info!(deleted = deleted, "Expired articles purged");
        }
        Ok(deleted)
    }

    /// [`Database::delete_all_expired_articles_at`] against the local clock.
    pub async fn delete_all_expired_articles(&self) -> Result<u64, DatabaseError> {
        self.delete_all_expired_articles_at(chrono::Local::now().naive_local())
            .await
    }
}
