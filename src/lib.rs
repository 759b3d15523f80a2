//! Feed subscription daemon: fetches RSS/Atom/RDF feeds on a schedule, stages
//! their articles on disk and keeps them in a SQLite store until they expire.

pub mod config;
pub mod feed;
pub mod storage;
pub mod sync;
pub mod util;
