use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

/// Tables the store cannot work without.
const REQUIRED_TABLES: [&str; 2] = ["feeds", "articles"];

// ============================================================================
// Database
// ============================================================================

/// Handle to the feed store.
///
/// Cloning is cheap; all clones share one connection pool.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection, verify the schema and repair it if needed
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process holds the
    /// database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Migration` if the schema cannot be created.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // SEC-010: Pre-create the DB file user-only so it never exists with umask permissions
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::OpenOptionsExt;
            let db_path = std::path::Path::new(path);
            if !db_path.exists() {
                if let Some(parent) = db_path.parent().filter(|p| p.exists()) {
                    tracing::debug!(dir = %parent.display(), "Creating database file");
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // If creation fails, SQLite will report the error at connect_with.
                }
            }
        }

        // busy_timeout=5000: wait up to 5 seconds for a lock before SQLITE_BUSY
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };

        let missing = db.missing_tables().await.map_err(DatabaseError::from_sqlx)?;
        if !missing.is_empty() {
            tracing::warn!(missing = ?missing, "Schema incomplete, repairing");
        }

        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::Other(e) => DatabaseError::Migration(e.to_string()),
            locked => locked,
        })?;
        Ok(db)
    }

    /// Names of required tables that are absent from the schema.
    pub async fn missing_tables(&self) -> Result<Vec<&'static str>, sqlx::Error> {
        let mut missing = Vec::new();
        for table in REQUIRED_TABLES {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
            if count == 0 {
                missing.push(table);
            }
        }
        Ok(missing)
    }

    /// Create any missing tables and indexes atomically.
    ///
    /// Every statement is `IF NOT EXISTS`, so running this on a healthy database
    /// is a no-op and running it on a damaged one recreates what is gone.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        // last_retrieved, retrieve_limit_hrs and retention_days stay TEXT: rows written
        // by other tools may hold free-form values, which read back as "not eligible".
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feed_name TEXT UNIQUE NOT NULL,
                feed_url TEXT NOT NULL,
                last_retrieved TEXT NOT NULL,
                retrieve_limit_hrs TEXT NOT NULL,
                retention_days TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // feed_name is a soft key into feeds(feed_name); renames are cascaded by hand.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                feed_name TEXT NOT NULL,
                article_url TEXT NOT NULL,
                article_date TEXT NOT NULL,
                headline_text TEXT NOT NULL,
                article_text TEXT,
                article_summary TEXT,
                row_insert_date_time TEXT NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_feed_name ON articles(feed_name)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_article_url ON articles(article_url)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_creates_schema() {
        let db = Database::open(":memory:").await.unwrap();
        assert!(db.missing_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_table_is_recreated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rss.db");
        let path = path.to_str().unwrap();

        let db = Database::open(path).await.unwrap();
        sqlx::query("DROP TABLE articles")
            .execute(&db.pool)
            .await
            .unwrap();
        assert_eq!(db.missing_tables().await.unwrap(), vec!["articles"]);
        db.pool.close().await;

        let reopened = Database::open(path).await.unwrap();
        assert!(reopened.missing_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = Database::open(":memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.migrate().await.unwrap();
        assert!(db.missing_tables().await.unwrap().is_empty());
    }
}
