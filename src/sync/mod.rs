//! Keeping the store in step with the feeds it subscribes to.
//!
//! - [`policy`] decides when a feed may be fetched again
//! - [`merge`] reconciles the stored subscription list with an external one
//! - [`pipeline`] runs fetch → parse → cache → import for each due feed

pub mod merge;
pub mod pipeline;
pub mod policy;

pub use merge::{
    merge_feed_lists, reconcile_feeds, validate_subscription, MergeOutcome, ReconcileSummary,
    SubscriptionError,
};
pub use pipeline::{
    CycleOutcome, CycleReport, RefreshError, RefreshOutcome, RefreshPipeline, SkipReason,
};
pub use policy::is_eligible_for_refresh;
