use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use thiserror::Error;
use tokio::sync::Mutex;

use super::policy::is_eligible_for_refresh;
use crate::feed::cache::{
    cache_paths, read_article_cache, write_article_cache, write_xml_cache, CacheError,
};
use crate::feed::{parse_document, Transport};
use crate::storage::{format_timestamp, Database, DatabaseError, Feed, ImportSummary};

/// Failures that abort one feed's refresh. Nothing is written to the store.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The feed's retrieve limit has not elapsed (or its settings do not parse).
    NotDue,
    /// Fetch failed or returned no content; retried on a later cycle.
    TransportFailed,
    /// The document is not well-formed XML. The raw `.xml` cache is kept.
    ParseFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Skipped(SkipReason),
    Imported(ImportSummary),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Rows removed by the expiry sweep, when it ran this cycle.
    pub pruned: Option<u64>,
    pub imported: usize,
    pub not_due: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another cycle held the guard; nothing was done.
    AlreadyRunning,
    Completed(CycleReport),
}

/// State owned by whichever cycle holds the guard.
#[derive(Debug, Default)]
struct CycleState {
    last_expiry_sweep: Option<NaiveDateTime>,
}

/// Eligibility check, fetch, parse, cache and import for every stored feed.
///
/// Feeds are refreshed one at a time. Each feed's import is its own
/// transaction, so a failure on one feed leaves the others untouched.
pub struct RefreshPipeline {
    db: Database,
    transport: Arc<dyn Transport>,
    cache_dir: PathBuf,
    expiry_interval: Duration,
    cycle: Mutex<CycleState>,
}

impl RefreshPipeline {
    pub fn new(db: Database, transport: Arc<dyn Transport>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            transport,
            cache_dir: cache_dir.into(),
            expiry_interval: Duration::minutes(60),
            cycle: Mutex::new(CycleState::default()),
        }
    }

    /// Minimum time between two expiry sweeps run by [`RefreshPipeline::run_cycle`].
    pub fn with_expiry_interval(mut self, interval: Duration) -> Self {
        self.expiry_interval = interval;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Refresh one feed if it is due at `now`.
    ///
    /// The raw document is staged as `<stem>.xml`, its articles as `<stem>.txt`;
    /// the `.txt` file is then read back and imported together with the feed row,
    /// whose `last_retrieved` becomes `now`.
    ///
    /// # Errors
    ///
    /// Cache file I/O and store failures. Transport and parse failures are
    /// reported as [`RefreshOutcome::Skipped`] instead.
    pub async fn refresh_feed(
        &self,
        feed: &Feed,
        now: NaiveDateTime,
    ) -> Result<RefreshOutcome, RefreshError> {
        if !is_eligible_for_refresh(feed, now) {
            return Ok(RefreshOutcome::Skipped(SkipReason::NotDue));
        }

        let body = match self.transport.fetch(&feed.url).await {
            Ok(body) if !body.trim().is_empty() => body,
            Ok(_) => {
                tracing::warn!(feed = %feed.name, "Feed returned no content");
                return Ok(RefreshOutcome::Skipped(SkipReason::TransportFailed));
            }
            Err(e) => {
                tracing::warn!(feed = %feed.name, url = %feed.url, error = %e, "Feed fetch failed");
                return Ok(RefreshOutcome::Skipped(SkipReason::TransportFailed));
            }
        };

        let expected = cache_paths(&self.cache_dir, &feed.name);
        let xml_path = write_xml_cache(&self.cache_dir, &feed.name, &body).await?;

        let parsed = match parse_document(&body) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(
                    feed = %feed.name,
                    path = %xml_path.display(),
                    error = %e,
                    "Feed document could not be parsed"
                );
                return Ok(RefreshOutcome::Skipped(SkipReason::ParseFailed));
            }
        };

        let fetched_at = format_timestamp(now);
        let articles = parsed.into_articles(&feed.name, &fetched_at);
        let text_path = write_article_cache(&self.cache_dir, &feed.name, &articles).await?;

        if xml_path != expected.xml {
            return Err(CacheError::PathMismatch {
                expected: expected.xml,
                actual: xml_path,
            }
            .into());
        }
        if text_path != expected.text {
            return Err(CacheError::PathMismatch {
                expected: expected.text,
                actual: text_path,
            }
            .into());
        }

        let staged = read_article_cache(&text_path, &feed.name, &fetched_at).await?;
        let refreshed = Feed {
            last_retrieved: fetched_at,
            ..feed.clone()
        };
        let summary = self.db.complete_feed_import(&refreshed, &staged).await?;

        tracing::info!(
            feed = %feed.name,
            inserted = summary.inserted,
            updated = summary.updated,
            "Feed refreshed"
        );
        Ok(RefreshOutcome::Imported(summary))
    }

    /// [`RefreshPipeline::run_cycle_at`] against the local clock.
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.run_cycle_at(chrono::Local::now().naive_local()).await
    }

    /// One pass over every stored feed, preceded by the expiry sweep when it is due.
    ///
    /// Returns [`CycleOutcome::AlreadyRunning`] without waiting if another cycle
    /// is in flight.
    pub async fn run_cycle_at(&self, now: NaiveDateTime) -> CycleOutcome {
        let Ok(mut state) = self.cycle.try_lock() else {
            tracing::debug!("Refresh cycle already running, skipping");
            return CycleOutcome::AlreadyRunning;
        };

        let mut report = CycleReport::default();

        let sweep_due = state
            .last_expiry_sweep
            .map_or(true, |last| now - last >= self.expiry_interval);
        if sweep_due {
            match self.db.delete_all_expired_articles_at(now).await {
                Ok(deleted) => {
                    report.pruned = Some(deleted);
                    state.last_expiry_sweep = Some(now);
                }
                Err(e) => tracing::warn!(error = %e, "Expiry sweep failed"),
            }
        }

        let feeds = match self.db.get_all_feeds().await {
            Ok(feeds) => feeds,
            Err(e) => {
                tracing::warn!(error = %e, "Could not load feeds for refresh");
                return CycleOutcome::Completed(report);
            }
        };

        for feed in &feeds {
            match self.refresh_feed(feed, now).await {
                Ok(RefreshOutcome::Imported(_)) => report.imported += 1,
                Ok(RefreshOutcome::Skipped(SkipReason::NotDue)) => report.not_due += 1,
                Ok(RefreshOutcome::Skipped(_)) => report.skipped += 1,
                Err(e) => {
                    tracing::warn!(feed = %feed.name, error = %e, "Feed refresh failed");
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            feeds = feeds.len(),
            imported = report.imported,
            not_due = report.not_due,
            skipped = report.skipped,
            failed = report.failed,
            "Refresh cycle complete"
        );
        CycleOutcome::Completed(report)
    }
}
