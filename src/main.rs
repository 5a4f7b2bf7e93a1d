//! Reachwatch - prefix outage and recovery detector
//!
//! Subscribes to a live BGP update feed for the monitored prefixes, tracks
//! per-prefix reachability across vantage points and groups prefix outages
//! into per-origin outage windows.
//!
//! Usage:
//!   reachwatch run
//!   reachwatch prefixes add 203.0.113.0/24 --description "edge block"
//!   reachwatch prefixes list
//!   reachwatch stats

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use reachwatch_backend::{
    config::Config,
    enrichment::{CachedOriginDirectory, HttpOriginDirectory, OriginDirectory, StaticOriginDirectory},
    feed::{FeedConnection, SessionState},
    models::SubscriptionSpec,
    outage::{CorrelatorConfig, IngestPipeline, OriginCorrelator, PrefixReachabilityTracker},
    storage::{EventSink, SqliteEventStore, SqliteKvBackend, StateStore},
};

/// How often the running detector re-reads the monitored prefix registry
const REGISTRY_POLL_SECS: u64 = 30;

#[derive(Parser, Debug)]
#[command(name = "reachwatch")]
#[command(about = "Detect BGP prefix outages and recoveries from a live route feed")]
struct Cli {
    /// Optional TOML config file; environment variables override it
    #[arg(short, long, env = "REACHWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to the feed and track outages until interrupted
    Run,

    /// Manage the monitored prefix registry
    Prefixes {
        #[command(subcommand)]
        action: PrefixAction,
    },

    /// Print outage statistics as JSON
    Stats {
        /// Number of recent origin outages to include
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Subcommand, Debug)]
enum PrefixAction {
    Add {
        prefix: String,
        #[arg(short, long)]
        description: Option<String>,
    },
    Remove {
        prefix: String,
    },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let config = Config::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Prefixes { action } => manage_prefixes(&config, action),
        Commands::Stats { limit } => print_stats(&config, limit),
    }
}

fn init_tracing(level: &str) {
    let default_filter = format!("reachwatch_backend={level},reachwatch={level}");
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also try the crate root .env when running from elsewhere
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}

fn build_directory(config: &Config) -> Result<Arc<dyn OriginDirectory>> {
    if !config.enrichment.enabled {
        return Ok(Arc::new(StaticOriginDirectory));
    }
    let http = HttpOriginDirectory::new(&config.enrichment.url, config.enrichment.timeout())?;
    Ok(Arc::new(CachedOriginDirectory::new(
        Arc::new(http),
        Duration::from_secs(config.enrichment.cache_ttl_secs),
    )))
}

/// Configured prefixes merged with the stored registry, sorted and deduplicated
fn subscription_spec(config: &Config, events: &SqliteEventStore) -> Result<SubscriptionSpec> {
    let mut prefixes = config.feed.prefixes.clone();
    prefixes.extend(
        events
            .list_monitored_prefixes()?
            .into_iter()
            .map(|p| p.prefix),
    );
    prefixes.sort();
    prefixes.dedup();
    Ok(SubscriptionSpec::new(prefixes, config.feed.more_specific))
}

async fn run(config: Config) -> Result<()> {
    info!(db_path = %config.db_path, feed = %config.feed.url, "reachwatch_starting");

    let events = Arc::new(SqliteEventStore::new(&config.db_path)?);
    let kv = Arc::new(SqliteKvBackend::new(&config.db_path)?);
    let store = Arc::new(StateStore::new(kv, config.tracking.state_cache_max_entries));
    let sink: Arc<dyn EventSink> = events.clone();

    let correlator = Arc::new(OriginCorrelator::new(
        sink.clone(),
        build_directory(&config)?,
        CorrelatorConfig {
            idle_timeout: config.tracking.origin_idle_timeout(),
            enrichment_timeout: config.enrichment.timeout(),
            persist_retry_attempts: config.tracking.persist_retry_attempts,
        },
    ));
    let tracker = Arc::new(PrefixReachabilityTracker::new(
        store,
        sink,
        correlator,
        config.tracking.prefix_state_ttl(),
        config.tracking.persist_retry_attempts,
    ));
    let pipeline = IngestPipeline::start(
        tracker,
        config.tracking.ingest_workers,
        config.tracking.ingest_queue_depth,
        config.tracking.sweep_interval(),
    );

    match pipeline
        .restore_from_store(config.tracking.origin_idle_timeout())
        .await
    {
        Ok(_) => {}
        Err(e) => warn!(error = %e, "outage_window_restore_failed"),
    }

    let feed = Arc::new(FeedConnection::new(
        &config.feed.url,
        config.feed.session_config(),
        pipeline.clone(),
    ));

    let spec = subscription_spec(&config, &events)?;
    if spec.prefixes.is_empty() {
        warn!("no_monitored_prefixes");
    }
    info!(prefixes = spec.prefixes.len(), more_specific = spec.more_specific, "subscribing");
    feed.start(spec).await;

    let supervisor = tokio::spawn(supervise_feed(feed.clone()));
    let registry_poll = tokio::spawn(poll_registry(config.clone(), events.clone(), feed.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("shutdown_requested");

    registry_poll.abort();
    supervisor.abort();
    feed.stop().await;
    pipeline.shutdown().await;

    info!(
        feed = %feed.stats().summary(),
        session = %feed.session().metrics().summary(),
        pipeline = %pipeline.stats().summary(),
        open_windows = pipeline.tracker().correlator().open_window_count(),
        "reachwatch_stopped"
    );
    Ok(())
}

/// Surface a feed that gave up reconnecting; the subscription can be
/// restarted by a registry change
async fn supervise_feed(feed: Arc<FeedConnection>) {
    let mut state_rx = feed.state_watch();
    loop {
        if state_rx.changed().await.is_err() {
            return;
        }
        let state = *state_rx.borrow_and_update();
        if state == SessionState::Failed {
            error!(
                session = %feed.session().metrics().summary(),
                "feed_failed_retries_exhausted"
            );
        }
    }
}

async fn poll_registry(config: Config, events: Arc<SqliteEventStore>, feed: Arc<FeedConnection>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(REGISTRY_POLL_SECS));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let spec = match subscription_spec(&config, &events) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(error = %e, "registry_poll_failed");
                continue;
            }
        };
        if feed.current_spec().await.as_ref() != Some(&spec) {
            info!(prefixes = spec.prefixes.len(), "monitored_prefixes_changed");
            feed.start(spec).await;
        }
    }
}

fn manage_prefixes(config: &Config, action: PrefixAction) -> Result<()> {
    let events = SqliteEventStore::new(&config.db_path)?;
    match action {
        PrefixAction::Add {
            prefix,
            description,
        } => {
            reachwatch_backend::outage::tracker::validate_prefix(&prefix)
                .with_context(|| format!("Refusing to add {}", prefix))?;
            if events.add_monitored_prefix(&prefix, description.as_deref())? {
                println!("added {}", prefix);
            } else {
                println!("{} already monitored", prefix);
            }
        }
        PrefixAction::Remove { prefix } => {
            if events.remove_monitored_prefix(&prefix)? {
                println!("removed {}", prefix);
            } else {
                println!("{} was not monitored", prefix);
            }
        }
        PrefixAction::List => {
            for p in events.list_monitored_prefixes()? {
                println!(
                    "{}\t{}\t{}",
                    p.prefix,
                    p.added_at.to_rfc3339(),
                    p.description.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

fn print_stats(config: &Config, limit: usize) -> Result<()> {
    let events = SqliteEventStore::new(&config.db_path)?;
    let since = Utc::now() - chrono::Duration::days(7);
    let report = serde_json::json!({
        "stats": events.stats()?,
        "active_outages": events.active_outages()?,
        "recent_origin_outages": events.recent_origin_outages(since, limit)?,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
