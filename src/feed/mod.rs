//! Feed documents: download, parse and stage.
//!
//! - [`parser`] turns RSS 0.9x/1.0/2.0, Atom 0.3/1.0 and RDF documents into a
//!   canonical [`ParsedFeed`], detecting the dialect on the way
//! - [`cache`] stages articles in a tab-delimited file between fetch and import
//! - [`fetcher`] defines the [`Transport`] seam and its HTTP implementation

pub mod cache;
mod fetcher;
pub mod parser;

pub use cache::{CacheError, CachePaths};
pub use fetcher::{FetchError, HttpTransport, Transport};
pub use parser::{parse_document, Dialect, ParseError, ParsedArticle, ParsedFeed};
