mod articles;
mod feeds;
mod schema;
mod types;

pub use feeds::ImportSummary;
pub use schema::Database;
pub use types::{
    format_timestamp, parse_timestamp, Article, DatabaseError, Feed, FeedDefaults,
    ARTICLE_DATE_FORMAT, TIMESTAMP_FORMAT, UNKNOWN_ARTICLE_DATE,
};
