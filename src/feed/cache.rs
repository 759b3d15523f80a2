//! Line-oriented staging cache between fetch and import.
//!
//! Each article is written as five `KEY<TAB>VALUE` lines in the fixed order
//! `URL`, `DATE`, `HEAD`, `TEXT`, `SUM`. The `TEXT` value may run across any
//! number of further physical lines; decoding appends them to the body until
//! the next reserved key. Blank lines are never data.
//!
//! Alongside the `.txt` article cache every feed also keeps its raw `.xml`
//! download, so a parse failure still leaves the fetched document on disk.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::storage::Article;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache file I/O failed for '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "Cache file written to '{}' but '{}' was expected",
        .actual.display(),
        .expected.display()
    )]
    PathMismatch { expected: PathBuf, actual: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheKey {
    Url,
    Date,
    Head,
    Text,
    Sum,
}

impl CacheKey {
    fn parse(key: &str) -> Option<Self> {
        match key {
            "URL" => Some(Self::Url),
            "DATE" => Some(Self::Date),
            "HEAD" => Some(Self::Head),
            "TEXT" => Some(Self::Text),
            "SUM" => Some(Self::Sum),
            _ => None,
        }
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Serialize articles into the tab-delimited cache format.
///
/// Line breaks inside single-line fields are flattened to spaces; the body is
/// written as-is and may span several lines.
pub fn encode_articles(articles: &[Article]) -> String {
    let mut out = String::new();
    for article in articles {
        push_line(&mut out, "URL", &single_line(&article.url));
        push_line(&mut out, "DATE", &single_line(&article.published_at));
        push_line(&mut out, "HEAD", &single_line(&article.headline));
        push_line(&mut out, "TEXT", &article.body);
        push_line(&mut out, "SUM", &single_line(&article.summary));
    }
    out
}

fn push_line(out: &mut String, key: &str, value: &str) {
    out.push_str(key);
    out.push('\t');
    out.push_str(value);
    out.push('\n');
}

fn single_line(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// Parse a cache buffer back into storable articles for `feed_name`.
///
/// A `URL` line whose value repeats the preceding `URL` value continues the
/// current record instead of starting a new one. Records without a headline,
/// or without both body and summary, are dropped. Every article is stamped
/// with `inserted_at`.
pub fn decode_articles(feed_name: &str, text: &str, inserted_at: &str) -> Vec<Article> {
    let blank = || Article {
        feed_name: feed_name.to_string(),
        inserted_at: inserted_at.to_string(),
        ..Default::default()
    };

    let mut articles = Vec::new();
    let mut current: Option<Article> = None;
    let mut previous_url: Option<String> = None;
    let mut in_text = false;
    let mut rejected = 0usize;

    let mut flush = |article: Option<Article>, articles: &mut Vec<Article>| {
        if let Some(article) = article {
            if article.is_storable() {
                articles.push(article);
            } else {
                rejected += 1;
            }
        }
    };

    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }

        let reserved = line
            .split_once('\t')
            .and_then(|(key, value)| CacheKey::parse(key).map(|key| (key, value)));

        let Some((key, value)) = reserved else {
            if in_text {
                let article = current.get_or_insert_with(blank);
                article.body.push('\n');
                article.body.push_str(line);
            } else {
                tracing::debug!(feed = %feed_name, "Ignoring stray cache line");
            }
            continue;
        };

        in_text = false;
        if key == CacheKey::Url {
            if previous_url.as_deref() != Some(value) {
                flush(current.take(), &mut articles);
                current = Some(Article {
                    url: value.to_string(),
                    ..blank()
                });
                previous_url = Some(value.to_string());
            }
            continue;
        }

        let article = current.get_or_insert_with(blank);
        match key {
            CacheKey::Date => article.published_at = value.to_string(),
            CacheKey::Head => article.headline = value.to_string(),
            CacheKey::Text => {
                article.body = value.to_string();
                in_text = true;
            }
            CacheKey::Sum => article.summary = value.to_string(),
            CacheKey::Url => {}
        }
    }
    flush(current.take(), &mut articles);

    if rejected > 0 {
        tracing::debug!(feed = %feed_name, rejected = rejected, "Dropped incomplete cache records");
    }
    articles
}

// ============================================================================
// Files
// ============================================================================

/// On-disk locations of one feed's cache files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    pub xml: PathBuf,
    pub text: PathBuf,
}

/// `<cache_dir>/<stem>.xml` and `<cache_dir>/<stem>.txt` for a feed.
pub fn cache_paths(cache_dir: &Path, feed_name: &str) -> CachePaths {
    let stem = cache_file_stem(feed_name);
    CachePaths {
        xml: cache_dir.join(format!("{}.xml", stem)),
        text: cache_dir.join(format!("{}.txt", stem)),
    }
}

/// Feed name made safe to use as a file name.
///
/// SEC-004: Path separators and other non-portable characters become `_`, and a
/// name made only of dots cannot address a parent directory.
pub fn cache_file_stem(feed_name: &str) -> String {
    let stem: String = feed_name
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if stem.trim_matches(|c| c == '.' || c == ' ').is_empty() {
        "_".repeat(stem.len().max(1))
    } else {
        stem
    }
}

/// Store a feed's raw download. Returns the path written.
pub async fn write_xml_cache(
    cache_dir: &Path,
    feed_name: &str,
    xml: &str,
) -> Result<PathBuf, CacheError> {
    let path = cache_paths(cache_dir, feed_name).xml;
    write_atomically(&path, xml).await?;
    Ok(path)
}

/// Encode and store a feed's articles. Returns the path written.
pub async fn write_article_cache(
    cache_dir: &Path,
    feed_name: &str,
    articles: &[Article],
) -> Result<PathBuf, CacheError> {
    let path = cache_paths(cache_dir, feed_name).text;
    write_atomically(&path, &encode_articles(articles)).await?;
    tracing::debug!(
        feed = %feed_name,
        path = %path.display(),
        articles = articles.len(),
        "Article cache written"
    );
    Ok(path)
}

pub async fn read_article_cache(
    path: &Path,
    feed_name: &str,
    inserted_at: &str,
) -> Result<Vec<Article>, CacheError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CacheError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(decode_articles(feed_name, &text, inserted_at))
}

/// Write to a temporary sibling, then rename over the destination.
async fn write_atomically(path: &Path, contents: &str) -> Result<(), CacheError> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| CacheError::Io { path, source }
    };

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(io_err(dir))?;
    }

    // SEC-009: Randomized temp filename to prevent TOCTOU race conditions
    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_extension(format!("tmp.{:016x}", random_suffix));

    if let Err(e) = tokio::fs::write(&temp_path, contents).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(io_err(&temp_path)(e));
    }
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(io_err(path)(e));
    }
    Ok(())
}
