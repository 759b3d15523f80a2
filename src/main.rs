use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use feedkeeper::config::{load_static_feeds, Config};
use feedkeeper::feed::HttpTransport;
use feedkeeper::storage::{Database, DatabaseError};
use feedkeeper::sync::{reconcile_feeds, CycleOutcome, RefreshPipeline};

/// Get the config directory path (~/.config/feedkeeper/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedkeeper"))
}

#[derive(Parser, Debug)]
#[command(name = "feedkeeper", about = "Feed subscription daemon with a local article store")]
struct Args {
    /// Config file (default: ~/.config/feedkeeper/config.toml)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Static feed list, one NAME<TAB>URL per line (overrides `feeds_file`)
    #[arg(long, value_name = "FILE")]
    feeds: Option<PathBuf>,

    /// Run a single refresh cycle and exit
    #[arg(long)]
    once: bool,

    /// Delete expired articles and exit
    #[arg(long)]
    prune: bool,

    /// Reset database (delete and recreate)
    #[arg(long)]
    reset_db: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        tracing::info!(path = %config_dir.display(), "Created config directory");
    }

    // SEC-007: Set directory permissions on Unix (user-only access)
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) =
            std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700))
        {
            tracing::warn!(
                path = %config_dir.display(),
                error = %e,
                "Failed to set config directory permissions to 0700"
            );
        }
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = config.database_path_in(&config_dir);
    let cache_dir = config.cache_dir_in(&config_dir);
    let feeds_path = args
        .feeds
        .clone()
        .unwrap_or_else(|| config.feeds_file_in(&config_dir));

    if args.reset_db && db_path.exists() {
        std::fs::remove_file(&db_path).context("Failed to delete database")?;
        tracing::info!(path = %db_path.display(), "Database reset");
    }

    let db_path_str = db_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    let db = match Database::open(db_path_str).await {
        Ok(db) => db,
        Err(DatabaseError::InstanceLocked) => {
            anyhow::bail!("Another instance of feedkeeper appears to be running");
        }
        Err(e) => return Err(anyhow::anyhow!("Failed to open database: {}", e)),
    };

    if args.prune {
        let deleted = db
            .delete_all_expired_articles()
            .await
            .context("Failed to delete expired articles")?;
        tracing::info!(deleted, "Expiry sweep complete");
        return Ok(());
    }

    let now = chrono::Local::now().naive_local();
    let defaults = config.feed_defaults();
    let static_feeds = load_static_feeds(&feeds_path, &defaults, now, config.allow_private_hosts)
        .with_context(|| format!("Failed to load feed list from {}", feeds_path.display()))?;
    let summary = reconcile_feeds(&db, &static_feeds, &defaults, now)
        .await
        .context("Failed to reconcile feed list")?;
    tracing::info!(
        inserted = summary.inserted,
        updated = summary.updated,
        unchanged = summary.unchanged,
        "Subscriptions ready"
    );

    let transport = HttpTransport::new(Duration::from_secs(config.request_timeout_secs))
        .context("Failed to build HTTP client")?;
    let expiry_interval = i64::try_from(config.expiry_check_interval_minutes)
        .ok()
        .and_then(chrono::Duration::try_minutes)
        .unwrap_or(chrono::Duration::MAX);
    let pipeline = RefreshPipeline::new(db, Arc::new(transport), cache_dir)
        .with_expiry_interval(expiry_interval);

    if args.once {
        log_cycle(pipeline.run_cycle().await);
        return Ok(());
    }

    let mut ticker =
        tokio::time::interval(Duration::from_secs(config.cycle_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => log_cycle(pipeline.run_cycle().await),
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for shutdown signal")?;
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

fn log_cycle(outcome: CycleOutcome) {
    match outcome {
        CycleOutcome::AlreadyRunning => tracing::debug!("Previous cycle still running"),
        CycleOutcome::Completed(report) => tracing::info!(
            pruned = report.pruned.unwrap_or(0),
            imported = report.imported,
            not_due = report.not_due,
            skipped = report.skipped,
            failed = report.failed,
            "Refresh cycle finished"
        ),
    }
}
