//! Configuration file parser for ~/.config/feedkeeper/config.toml, plus the
//! static subscription list (`feeds.txt`).
//!
//! Both files are optional. A missing config yields `Config::default()`; a
//! missing feed list yields no static subscriptions.
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::storage::{Feed, FeedDefaults};
use crate::util::validate_feed_url;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Input file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level daemon configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Relative or missing paths are resolved against the config directory by the
/// `*_in` accessors.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for the per-feed `.xml` and `.txt` staging files.
    pub cache_dir: Option<PathBuf>,

    /// SQLite database file.
    pub database_path: Option<PathBuf>,

    /// Statically configured subscription list, one `NAME<TAB>URL` per line.
    pub feeds_file: Option<PathBuf>,

    /// Seconds between refresh cycles.
    pub cycle_interval_secs: u64,

    /// Minimum minutes between two expiry sweeps.
    pub expiry_check_interval_minutes: u64,

    pub default_retrieve_limit_hrs: i64,
    pub default_retention_days: i64,

    /// How far back `last_retrieved` is seeded for a new subscription.
    pub new_feed_backdate_days: i64,

    pub request_timeout_secs: u64,

    /// Accept feeds on loopback and private-network hosts.
    pub allow_private_hosts: bool,
}

impl Default for Config {
    fn default() -> Self {
        let defaults = FeedDefaults::default();
        Self {
            cache_dir: None,
            database_path: None,
            feeds_file: None,
            cycle_interval_secs: 7,
            expiry_check_interval_minutes: 60,
            default_retrieve_limit_hrs: defaults.retrieve_limit_hrs,
            default_retention_days: defaults.retention_days,
            new_feed_backdate_days: defaults.backdate_days,
            request_timeout_secs: 30,
            allow_private_hosts: false,
        }
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 10] = [
        "cache_dir",
        "database_path",
        "feeds_file",
        "cycle_interval_secs",
        "expiry_check_interval_minutes",
        "default_retrieve_limit_hrs",
        "default_retention_days",
        "new_feed_backdate_days",
        "request_timeout_secs",
        "allow_private_hosts",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing or empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let Some(content) = read_limited(path)? else {
            tracing::debug!(path = %path.display(), "No config file found, using defaults");
            return Ok(Self::default());
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(
            path = %path.display(),
            cycle_interval_secs = config.cycle_interval_secs,
            "Loaded configuration"
        );
        Ok(config)
    }

    pub fn feed_defaults(&self) -> FeedDefaults {
        FeedDefaults {
            retrieve_limit_hrs: self.default_retrieve_limit_hrs,
            retention_days: self.default_retention_days,
            backdate_days: self.new_feed_backdate_days,
        }
    }

    pub fn cache_dir_in(&self, config_dir: &Path) -> PathBuf {
        resolve(config_dir, self.cache_dir.as_deref(), "cache")
    }

    pub fn database_path_in(&self, config_dir: &Path) -> PathBuf {
        resolve(config_dir, self.database_path.as_deref(), "rss.db")
    }

    pub fn feeds_file_in(&self, config_dir: &Path) -> PathBuf {
        resolve(config_dir, self.feeds_file.as_deref(), "feeds.txt")
    }
}

fn resolve(config_dir: &Path, configured: Option<&Path>, default_name: &str) -> PathBuf {
    match configured {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => config_dir.join(path),
        None => config_dir.join(default_name),
    }
}

/// Read a file of at most `Config::MAX_FILE_SIZE` bytes. `Ok(None)` when it does not exist.
fn read_limited(path: &Path) -> Result<Option<String>, ConfigError> {
    // SEC-014: Check file size before reading to prevent memory exhaustion.
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() > Config::MAX_FILE_SIZE => {
            return Err(ConfigError::TooLarge(format!(
                "{} is {} bytes (max {} bytes)",
                path.display(),
                meta.len(),
                Config::MAX_FILE_SIZE
            )));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ConfigError::Io(e)),
        Ok(_) => {}
    }

    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        // Race condition: file deleted between metadata and read
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConfigError::Io(e)),
    }
}

// ============================================================================
// Static feed list
// ============================================================================

/// Parse `NAME<TAB>URL` lines into new subscriptions, sorted by name.
///
/// Blank lines are skipped. Lines without a tab, with an empty name, or with a
/// URL that fails validation are skipped with a warning. A repeated name keeps
/// its last entry.
pub fn parse_static_feeds(
    content: &str,
    defaults: &FeedDefaults,
    now: NaiveDateTime,
    allow_private_hosts: bool,
) -> Vec<Feed> {
    let mut by_name: BTreeMap<String, String> = BTreeMap::new();

    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }

        let Some((name, url)) = line.split_once('\t') else {
            tracing::warn!(line = line_no, "Feed list line has no tab separator, skipping");
            continue;
        };
        let (name, url) = (name.trim(), url.trim());
        if name.is_empty() {
            tracing::warn!(line = line_no, "Feed list line has an empty name, skipping");
            continue;
        }

        match validate_feed_url(url, allow_private_hosts) {
            Ok(_) => {
                if by_name.insert(name.to_string(), url.to_string()).is_some() {
                    tracing::debug!(feed = %name, line = line_no, "Repeated feed name, last entry wins");
                }
            }
            Err(e) => {
                tracing::warn!(feed = %name, line = line_no, error = %e, "Invalid feed URL, skipping");
            }
        }
    }

    by_name
        .into_iter()
        .map(|(name, url)| Feed::new_subscription(name, url, defaults, now))
        .collect()
}

/// Load the static feed list at `path`. A missing file is an empty list.
pub fn load_static_feeds(
    path: &Path,
    defaults: &FeedDefaults,
    now: NaiveDateTime,
    allow_private_hosts: bool,
) -> Result<Vec<Feed>, ConfigError> {
    let Some(content) = read_limited(path)? else {
        tracing::debug!(path = %path.display(), "No static feed list found");
        return Ok(Vec::new());
    };
    let feeds = parse_static_feeds(&content, defaults, now, allow_private_hosts);
    tracing::info!(path = %path.display(), feeds = feeds.len(), "Loaded static feed list");
    Ok(feeds)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, 10)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cycle_interval_secs, 7);
        assert_eq!(config.expiry_check_interval_minutes, 60);
        assert_eq!(config.feed_defaults(), FeedDefaults::default());
        assert!(!config.allow_private_hosts);
    }

    #[test]
    fn test_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_whitespace_only_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.toml", "   \n  \n  ");
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "config.toml",
            "cycle_interval_secs = 30\ndefault_retention_days = 7\n",
        );

        let config = Config::load(&path).unwrap();
        assert_eq!(config.cycle_interval_secs, 30);
        assert_eq!(config.default_retention_days, 7);
        assert_eq!(config.default_retrieve_limit_hrs, 1);
        assert_eq!(config.feed_defaults().retention_days, 7);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.toml", "this is not [valid toml");

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.toml", "theme = \"dark\"\ncycle_interval_secs = 9\n");
        assert_eq!(Config::load(&path).unwrap().cycle_interval_secs, 9);
    }

    #[test]
    fn test_wrong_type_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.toml", "cycle_interval_secs = \"often\"\n");
        assert!(Config::load(&path).is_err());
    }

    // SEC-014: File size limit
    #[test]
    fn test_too_large_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.toml", &"a".repeat(1_048_577));

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_paths_resolve_against_config_dir() {
        let base = Path::new("/home/u/.config/feedkeeper");
        let config = Config {
            cache_dir: Some(PathBuf::from("staging")),
            database_path: Some(PathBuf::from("/var/lib/feeds.db")),
            ..Config::default()
        };
        assert_eq!(config.cache_dir_in(base), base.join("staging"));
        assert_eq!(config.database_path_in(base), PathBuf::from("/var/lib/feeds.db"));
        assert_eq!(config.feeds_file_in(base), base.join("feeds.txt"));
    }

    #[test]
    fn test_static_feeds_sorted_last_wins() {
        let content = "zeta\thttps://z.example.com/rss\n\
                       \n\
                       alpha\thttps://a.example.com/old\n\
                       no tab here\n\
                       alpha\thttps://a.example.com/new\n\
                       \thttps://nameless.example.com\n\
                       bad\tftp://example.com/feed\n";

        let feeds = parse_static_feeds(content, &FeedDefaults::default(), now(), false);
        let pairs: Vec<(&str, &str)> = feeds
            .iter()
            .map(|f| (f.name.as_str(), f.url.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("alpha", "https://a.example.com/new"),
                ("zeta", "https://z.example.com/rss"),
            ]
        );
        assert!(feeds.iter().all(|f| !f.is_persisted()));
        assert_eq!(feeds[0].last_retrieved, "2024-06-06 12:00:00");
    }

    #[test]
    fn test_static_feeds_private_hosts_gated() {
        let content = "local\thttp://127.0.0.1:8080/rss\n";
        let defaults = FeedDefaults::default();
        assert!(parse_static_feeds(content, &defaults, now(), false).is_empty());
        assert_eq!(parse_static_feeds(content, &defaults, now(), true).len(), 1);
    }

    #[test]
    fn test_huge_backdate_in_config_keeps_feeds_due() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "config.toml", "new_feed_backdate_days = 9223372036854775\n");
        let config = Config::load(&path).unwrap();

        let feeds = parse_static_feeds(
            "tech\thttps://tech.example.com/rss\n",
            &config.feed_defaults(),
            now(),
            false,
        );
        assert_eq!(feeds.len(), 1);
        assert!(crate::sync::is_eligible_for_refresh(&feeds[0], now()));
    }

    #[test]
    fn test_missing_static_feed_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let feeds = load_static_feeds(
            &dir.path().join("feeds.txt"),
            &FeedDefaults::default(),
            now(),
            false,
        )
        .unwrap();
        assert!(feeds.is_empty());
    }
}
