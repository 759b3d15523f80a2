//! Reconciliation of two feed-subscription lists.
//!
//! [`merge_feed_lists`] is pure: it takes the store-resident list and an
//! externally supplied one and returns two reconciled lists plus the set of
//! URL keys claimed across both passes. [`reconcile_feeds`] runs the merge
//! against the store and persists the union.

use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::storage::{Database, DatabaseError, Feed, FeedDefaults};
use crate::util::{validate_feed_url, UrlValidationError};

/// Result of a bidirectional merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The first list, with URLs adopted from the second where names match.
    pub forward: Vec<Feed>,
    /// The second list, reconciled against `forward`.
    pub backward: Vec<Feed>,
    /// Lowercased URLs claimed by the end of both passes.
    pub claimed: BTreeSet<String>,
}

impl MergeOutcome {
    /// `forward`, followed by every `backward` entry whose name and URL key are
    /// both absent from `forward`.
    pub fn union(&self) -> Vec<Feed> {
        let mut merged = self.forward.clone();
        for feed in &self.backward {
            let key = url_key(&feed.url);
            let known = self
                .forward
                .iter()
                .any(|f| f.name == feed.name || url_key(&f.url) == key);
            if !known {
                merged.push(feed.clone());
            }
        }
        merged
    }
}

/// Dedup key for a feed URL.
pub fn url_key(url: &str) -> String {
    url.to_lowercase()
}

/// Merge `a` against `b`, then `b` against the merged `a`.
///
/// Within a pass, the first entry to reach a URL key claims it; later entries
/// with the same key are kept unchanged. An entry whose name also appears in
/// the other list takes that list's URL when it differs and is still
/// unclaimed, giving up its own key. The other list is treated as the more
/// current source; no timestamps are compared.
pub fn merge_feed_lists(a: &[Feed], b: &[Feed]) -> MergeOutcome {
    let (forward, claimed) = merge_pass(a, b, BTreeSet::new());
    let (backward, claimed) = merge_pass(b, &forward, claimed);
    MergeOutcome {
        forward,
        backward,
        claimed,
    }
}

fn merge_pass(
    primary: &[Feed],
    secondary: &[Feed],
    mut claimed: BTreeSet<String>,
) -> (Vec<Feed>, BTreeSet<String>) {
    let mut merged = Vec::with_capacity(primary.len());

    for feed in primary {
        let mut feed = feed.clone();
        let key = url_key(&feed.url);
        if claimed.contains(&key) {
            merged.push(feed);
            continue;
        }
        claimed.insert(key.clone());

        if let Some(other) = secondary.iter().find(|other| other.name == feed.name) {
            let other_key = url_key(&other.url);
            if other_key != key && !claimed.contains(&other_key) {
                claimed.remove(&key);
                feed.url = other.url.clone();
                claimed.insert(other_key);
            }
        }
        merged.push(feed);
    }

    (merged, claimed)
}

// ============================================================================
// Persistence
// ============================================================================

/// Counts produced by [`reconcile_feeds`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Merge the store's feeds with `external` and upsert the union.
///
/// Store-resident feeds keep their id and settings and may take a new URL from
/// `external`. Feeds known only to `external` are inserted as new
/// subscriptions seeded from `defaults`, so they are due on the next cycle.
pub async fn reconcile_feeds(
    db: &Database,
    external: &[Feed],
    defaults: &FeedDefaults,
    now: NaiveDateTime,
) -> Result<ReconcileSummary, DatabaseError> {
    let stored = db.get_all_feeds().await?;
    let outcome = merge_feed_lists(&stored, external);
    let mut summary = ReconcileSummary::default();

    for feed in outcome.union() {
        match stored.iter().find(|s| s.name == feed.name) {
            Some(current) if *current == feed => summary.unchanged += 1,
            Some(_) => {
                tracing::info!(feed = %feed.name, url = %feed.url, "Feed URL reconciled");
                db.upsert_feed(&feed).await?;
                summary.updated += 1;
            }
            None => {
                let fresh = Feed::new_subscription(feed.name, feed.url, defaults, now);
                tracing::info!(feed = %fresh.name, url = %fresh.url, "Subscribing to feed");
                db.upsert_feed(&fresh).await?;
                summary.inserted += 1;
            }
        }
    }

    tracing::debug!(
        inserted = summary.inserted,
        updated = summary.updated,
        unchanged = summary.unchanged,
        claimed = outcome.claimed.len(),
        "Feed lists reconciled"
    );
    Ok(summary)
}

// ============================================================================
// Subscription edits
// ============================================================================

#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("Feed name must not be empty")]
    EmptyName,
    #[error("Feed name '{0}' is already in use")]
    DuplicateName(String),
    #[error("Feed URL '{0}' is already subscribed")]
    DuplicateUrl(String),
    #[error(transparent)]
    InvalidUrl(#[from] UrlValidationError),
}

/// Check a created or edited subscription against the current list.
///
/// Names and URLs must be unique among the other feeds; the feed being edited
/// (same id) is not compared with itself. URLs are compared by [`url_key`].
pub fn validate_subscription(
    existing: &[Feed],
    candidate: &Feed,
    allow_private_hosts: bool,
) -> Result<(), SubscriptionError> {
    if candidate.name.trim().is_empty() {
        return Err(SubscriptionError::EmptyName);
    }
    validate_feed_url(&candidate.url, allow_private_hosts)?;

    let others = existing
        .iter()
        .filter(|f| !(candidate.is_persisted() && f.id == candidate.id));

    let key = url_key(&candidate.url);
    for other in others {
        if other.name == candidate.name {
            return Err(SubscriptionError::DuplicateName(candidate.name.clone()));
        }
        if url_key(&other.url) == key {
            return Err(SubscriptionError::DuplicateUrl(candidate.url.clone()));
        }
    }
    Ok(())
}
