use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rsarb_adapters::{PlatformGateway, RedditGateway};
use rsarb_core::CatalogEntry;
use rsarb_storage::{Store, StoreError};
use rsarb_sync::{run_scheduled, BotConfig, ReplyBot};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "rsarb")]
#[command(about = "Scans subreddits for catalog titles and replies to opted-in users")]
struct Cli {
    /// YAML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Create or validate the store, then exit.
    #[arg(short, long)]
    initialize: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scan cycle and print its summary.
    ScanOnce,
    /// Replace the roster with the opt-in thread's commenters.
    SyncRoster,
    /// Add ledger entries for replies the bot already has on Reddit.
    SyncLedger,
    /// Add catalog entries from a YAML list.
    ImportCatalog { file: PathBuf },
    /// Add one user to the opt-in roster.
    OptIn { username: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = BotConfig::from_file(&cli.config).await?;

    if cli.initialize {
        Store::initialize_schema(&config.store.path)
            .await
            .with_context(|| format!("initializing store {}", config.store.path.display()))?;
        println!("store ready: {}", config.store.path.display());
        return Ok(());
    }

    let store = Store::open(&config.store.path)
        .await
        .with_context(|| format!("opening store {}", config.store.path.display()))?;

    match cli.command {
        Some(Commands::ImportCatalog { file }) => {
            let (added, skipped) = import_catalog(&store, &file).await?;
            println!("catalog import: added={added} skipped={skipped}");
        }
        Some(Commands::OptIn { username }) => {
            store.add_opted_in(&username).await?;
            println!("opted in: {}", username.to_lowercase());
        }
        Some(Commands::ScanOnce) => {
            let bot = connect_bot(store, &config).await?;
            let summary = bot.run_cycle().await?;
            println!(
                "scan complete: run_id={} posts={} comments={} matched={} replied={} forbidden={} silent_drops={} confirmed={}",
                summary.run_id,
                summary.posts_scanned,
                summary.comments_scanned,
                summary.matched,
                summary.replied,
                summary.forbidden,
                summary.silent_drops,
                summary.silent_drop_confirmed
            );
        }
        Some(Commands::SyncRoster) => {
            let bot = connect_bot(store, &config).await?;
            let summary = bot.repopulate_opted_in().await?;
            println!(
                "roster synced from {}: authors={} added={} removed={}",
                summary.thread,
                summary.authors,
                summary.added.len(),
                summary.removed.len()
            );
        }
        Some(Commands::SyncLedger) => {
            let bot = connect_bot(store, &config).await?;
            let summary = bot.repopulate_replied().await?;
            println!(
                "ledger reconciled: own_replies={} recorded={}",
                summary.own_replies, summary.recorded
            );
        }
        None => {
            let bot = connect_bot(store, &config).await?;
            run_scheduled(bot, &config.schedule).await?;
        }
    }

    Ok(())
}

async fn connect_bot(store: Store, config: &BotConfig) -> Result<ReplyBot> {
    let gateway = RedditGateway::connect(config.credentials(), config.http_client_config())
        .await
        .context("authenticating with reddit")?;
    let gateway: Arc<dyn PlatformGateway> = Arc::new(gateway);
    ReplyBot::connect(store, gateway, config).await
}

async fn import_catalog(store: &Store, file: &Path) -> Result<(usize, usize)> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let entries: Vec<CatalogEntry> =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", file.display()))?;

    let (mut added, mut skipped) = (0, 0);
    for entry in &entries {
        match store.add_catalog_entry(entry).await {
            Ok(()) => added += 1,
            Err(StoreError::DuplicateEntry { key, .. }) => {
                warn!(title = %key, "catalog already has this title; skipping");
                skipped += 1;
            }
            Err(err) => return Err(err).with_context(|| format!("adding catalog entry {:?}", entry.title)),
        }
    }
    info!(added, skipped, file = %file.display(), "catalog imported");
    Ok((added, skipped))
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json().with_ansi(false)).init(),
        LogFormat::Text => registry.with(fmt::layer().compact()).init(),
    }
}
