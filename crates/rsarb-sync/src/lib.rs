//! Scan cycle, roster and ledger reconcilers, and the job scheduler.

pub mod config;
pub mod format;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rsarb_adapters::{PlatformError, PlatformGateway};
use rsarb_core::{Entity, Fullname, ScanSnapshot};
use rsarb_storage::{Store, StoreError};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use config::{BotConfig, PlatformConfig, ScheduleConfig, StoreConfig};
pub use format::{format_reply, CatalogMiss};

pub const CRATE_NAME: &str = "rsarb-sync";

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub posts_scanned: usize,
    pub comments_scanned: usize,
    pub matched: usize,
    pub replied: usize,
    pub forbidden: usize,
    pub silent_drops: usize,
    /// Silent drops whose reply was found among the bot's recent replies.
    pub silent_drop_confirmed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterSyncSummary {
    pub thread: String,
    pub authors: usize,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerSyncSummary {
    pub own_replies: usize,
    pub recorded: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Replied,
    Forbidden,
    SilentDrop { confirmed: bool },
}

/// The bot: one store, one gateway, the identity it posts as.
pub struct ReplyBot {
    store: Store,
    gateway: Arc<dyn PlatformGateway>,
    platform: PlatformConfig,
    schedule: ScheduleConfig,
    bot_identity: String,
}

impl ReplyBot {
    /// Ask the platform who we are, then build the bot.
    pub async fn connect(store: Store, gateway: Arc<dyn PlatformGateway>, config: &BotConfig) -> Result<Self> {
        let bot_identity = gateway
            .current_user()
            .await
            .context("resolving the bot identity")?;
        info!(bot = %bot_identity, subreddits = %config.platform.subreddits, "connected");
        Ok(Self::new(store, gateway, config, bot_identity))
    }

    pub fn new(store: Store, gateway: Arc<dyn PlatformGateway>, config: &BotConfig, bot_identity: String) -> Self {
        Self {
            store,
            gateway,
            platform: config.platform.clone(),
            schedule: config.schedule.clone(),
            bot_identity,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn bot_identity(&self) -> &str {
        &self.bot_identity
    }

    /// One full poll: scan every new post and its comments against a single
    /// store snapshot, then reply to each match and record it in the ledger.
    pub async fn run_cycle(&self) -> Result<CycleSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("scan_cycle", %run_id);
        self.run_cycle_inner(run_id).instrument(span).await
    }

    async fn run_cycle_inner(&self, run_id: Uuid) -> Result<CycleSummary> {
        let started_at = Utc::now();
        let snapshot = ScanSnapshot::new(
            &self.bot_identity,
            self.store.list_catalog_titles().await?,
            self.store.list_replied().await?,
            self.store.list_opted_in().await?,
        );
        debug!(
            catalog = snapshot.catalog_len(),
            roster = snapshot.roster_len(),
            ledger = snapshot.ledger_len(),
            "snapshot taken"
        );

        let posts = self
            .gateway
            .list_new_posts(&self.platform.subreddits, Some(self.schedule.post_limit))
            .await
            .with_context(|| format!("listing new posts in {}", self.platform.subreddits))?;

        let mut seen = HashSet::new();
        let mut matches: Vec<(Entity, BTreeSet<String>)> = Vec::new();
        let mut posts_scanned = 0usize;
        let mut comments_scanned = 0usize;

        for post in posts {
            if !seen.insert(post.fullname.clone()) {
                debug!(fullname = %post.fullname, "post already scanned this cycle");
                continue;
            }
            posts_scanned += 1;
            scan_into(&snapshot, &Entity::Post(post.clone()), &mut matches);

            let comments = self
                .gateway
                .list_comments(&post)
                .await
                .with_context(|| format!("listing comments of {}", post.fullname))?;
            for comment in comments {
                if !seen.insert(comment.fullname.clone()) {
                    continue;
                }
                comments_scanned += 1;
                scan_into(&snapshot, &Entity::Comment(comment), &mut matches);
            }
        }

        let mut summary = CycleSummary {
            run_id,
            started_at,
            finished_at: started_at,
            posts_scanned,
            comments_scanned,
            matched: matches.len(),
            replied: 0,
            forbidden: 0,
            silent_drops: 0,
            silent_drop_confirmed: 0,
        };

        for (entity, titles) in &matches {
            let span = info_span!("reply", fullname = %entity.fullname());
            match self.deliver(entity, titles).instrument(span).await? {
                Delivery::Replied => summary.replied += 1,
                Delivery::Forbidden => summary.forbidden += 1,
                Delivery::SilentDrop { confirmed } => {
                    summary.silent_drops += 1;
                    if confirmed {
                        summary.silent_drop_confirmed += 1;
                    }
                }
            }
        }

        summary.finished_at = Utc::now();
        info!(
            posts = summary.posts_scanned,
            comments = summary.comments_scanned,
            matched = summary.matched,
            replied = summary.replied,
            forbidden = summary.forbidden,
            silent_drops = summary.silent_drops,
            "scan cycle finished"
        );
        Ok(summary)
    }

    async fn deliver(&self, entity: &Entity, titles: &BTreeSet<String>) -> Result<Delivery> {
        let local_id = Fullname::parse(entity.fullname())?.local_id().to_string();
        let body = format_reply(&self.store, titles, &self.bot_identity, &self.platform.feedback_subreddit).await?;

        let delivery = match self.gateway.post_reply(entity, &body).await {
            Ok(Some(reply)) => {
                self.record(&local_id, true).await?;
                info!(reply = %reply.fullname, titles = titles.len(), "replied");
                Delivery::Replied
            }
            Ok(None) => {
                // The reply may exist; never leave the entity open to a second post.
                let confirmed = match self.reply_exists(entity.fullname()).await {
                    Ok(confirmed) => confirmed,
                    Err(err) => {
                        self.record(&local_id, false).await?;
                        warn!(error = %format!("{err:#}"), "could not check for a dropped reply; recorded as failed");
                        return Err(err);
                    }
                };
                self.record(&local_id, confirmed).await?;
                warn!(confirmed, "reply call returned no comment");
                Delivery::SilentDrop { confirmed }
            }
            Err(PlatformError::Forbidden(detail)) => {
                warn!(%detail, "reply forbidden; no ledger entry");
                Delivery::Forbidden
            }
            Err(err) => return Err(err).context("posting reply"),
        };
        Ok(delivery)
    }

    /// Whether one of the bot's newest replies answers `target`.
    async fn reply_exists(&self, target: &str) -> Result<bool> {
        let recent = self
            .gateway
            .recent_own_replies(&self.bot_identity, self.schedule.silent_drop_window)
            .await
            .context("listing recent own replies")?;
        Ok(recent.iter().any(|reply| reply.parent_fullname == target))
    }

    async fn record(&self, local_id: &str, succeeded: bool) -> Result<()> {
        self.store
            .record_reply(local_id, succeeded)
            .await
            .with_context(|| format!("recording ledger entry for {local_id}"))
    }

    /// Replace the roster with the commenters of the opt-in thread.
    pub async fn repopulate_opted_in(&self) -> Result<RosterSyncSummary> {
        let uri = &self.platform.opt_in_thread;
        let thread = self
            .gateway
            .find_thread(None, Some(uri))
            .await
            .with_context(|| format!("resolving opt-in thread {uri}"))?
            .with_context(|| format!("opt-in thread {uri} not found; check platform.opt_in_thread"))?;

        let authors = self
            .gateway
            .list_thread_authors(&thread)
            .await
            .with_context(|| format!("listing commenters of {}", thread.fullname))?;
        let diff = self.store.sync_opted_in(&authors).await?;
        info!(
            thread = %thread.fullname,
            authors = authors.len(),
            added = diff.added.len(),
            removed = diff.removed.len(),
            "roster synced"
        );
        Ok(RosterSyncSummary {
            thread: thread.fullname,
            authors: authors.len(),
            added: diff.added,
            removed: diff.removed,
        })
    }

    /// Ledger entries for the parents of every reply the bot has on the
    /// platform. Existing entries are never touched.
    pub async fn repopulate_replied(&self) -> Result<LedgerSyncSummary> {
        let replies = self
            .gateway
            .list_own_replies(&self.bot_identity)
            .await
            .context("listing own replies")?;

        let mut recorded = 0usize;
        for reply in &replies {
            let parent = match Fullname::parse(&reply.parent_fullname) {
                Ok(parent) => parent,
                Err(err) => {
                    warn!(reply = %reply.fullname, error = %err, "skipping reply with unparseable parent");
                    continue;
                }
            };
            if self.store.record_reply_if_absent(parent.local_id(), true).await? {
                recorded += 1;
            }
        }
        info!(own_replies = replies.len(), recorded, "ledger reconciled");
        Ok(LedgerSyncSummary {
            own_replies: replies.len(),
            recorded,
        })
    }
}

fn scan_into(snapshot: &ScanSnapshot, entity: &Entity, matches: &mut Vec<(Entity, BTreeSet<String>)>) {
    match snapshot.scan(entity) {
        Ok(titles) if titles.is_empty() => {}
        Ok(titles) => {
            debug!(fullname = %entity.fullname(), titles = ?titles, "matched");
            matches.push((entity.clone(), titles));
        }
        Err(err) => warn!(fullname = %entity.fullname(), error = %err, "skipping unscannable entity"),
    }
}

/// The three periodic jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotJob {
    Scan,
    Roster,
    Ledger,
}

impl BotJob {
    pub fn name(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Roster => "roster",
            Self::Ledger => "ledger",
        }
    }

    fn cron(self, schedule: &ScheduleConfig) -> &str {
        match self {
            Self::Scan => &schedule.scan_cron,
            Self::Roster => &schedule.roster_cron,
            Self::Ledger => &schedule.ledger_cron,
        }
    }

    /// Run once, logging failures instead of returning them.
    pub async fn run(self, bot: &ReplyBot) {
        let result = match self {
            Self::Scan => bot.run_cycle().await.map(drop),
            Self::Roster => bot.repopulate_opted_in().await.map(drop),
            Self::Ledger => bot.repopulate_replied().await.map(drop),
        };
        let Err(err) = result else { return };

        let duplicate = err
            .downcast_ref::<StoreError>()
            .is_some_and(StoreError::is_duplicate_reply);
        if duplicate {
            error!(job = self.name(), error = %format!("{err:#}"), "reply ledger already had this entry; an entity was processed twice");
        } else if err.downcast_ref::<CatalogMiss>().is_some() {
            error!(job = self.name(), error = %format!("{err:#}"), "catalog lookup failed while formatting a reply");
        } else {
            error!(job = self.name(), error = %format!("{err:#}"), "job failed; next tick retries");
        }
    }
}

/// Scheduler with the scan, roster and ledger jobs, serialized on `bot`.
pub async fn build_scheduler(bot: Arc<Mutex<ReplyBot>>, schedule: &ScheduleConfig) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for kind in [BotJob::Scan, BotJob::Roster, BotJob::Ledger] {
        let cron = kind.cron(schedule);
        let bot = Arc::clone(&bot);
        let job = Job::new_async(cron, move |_uuid, _l| {
            let bot = Arc::clone(&bot);
            Box::pin(async move {
                let bot = bot.lock().await;
                kind.run(&bot).await;
            })
        })
        .with_context(|| format!("creating {} job for cron {cron}", kind.name()))?;
        sched.add(job).await.context("adding scheduler job")?;
        info!(job = kind.name(), %cron, "scheduled");
    }
    Ok(sched)
}

/// Run the jobs until Ctrl-C.
pub async fn run_scheduled(bot: ReplyBot, schedule: &ScheduleConfig) -> Result<()> {
    let bot = Arc::new(Mutex::new(bot));
    let mut sched = build_scheduler(Arc::clone(&bot), schedule).await?;
    sched.start().await.context("starting scheduler")?;
    info!("scheduler running; press ctrl-c to stop");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    sched.shutdown().await.context("stopping scheduler")?;
    bot.lock().await.store().close().await;
    Ok(())
}
