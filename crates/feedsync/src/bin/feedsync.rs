use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;

use feedsync::app::{build_index, load_index, open_database, Services};
use feedsync::db::{feed_repo, webhook_repo};
use feedsync::feed::Feed;
use feedsync::jobs::{JobLedger, JobStatus};
use feedsync::logging::{self, LogFormat};
use feedsync::notify::{Webhook, EVENT_CATEGORIZATION_COMPLETED, EVENT_SYNC_COMPLETED};
use feedsync::{load_config, Config, Result};

#[derive(Debug, Parser)]
#[command(name = "feedsync")]
#[command(about = "Product feed sync and taxonomy classification", version)]
struct Cli {
    /// JSON config file; built-in defaults when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// `text` or `json`.
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the periodic scheduler until Ctrl-C.
    Serve,
    /// Run every scheduler operation once and wait for started jobs.
    Tick,
    /// Queue a manual sync of one feed and wait for it.
    Sync { feed_id: String },
    /// Queue categorization of one feed, or of every product.
    Categorize {
        #[arg(long)]
        feed: Option<String>,
    },
    /// Cancel a pending or running job.
    Cancel { job_id: String },
    /// Print queue counts and recent jobs as JSON.
    Status {
        #[arg(long, default_value_t = 20)]
        limit: u64,
    },
    /// Build the category index from a taxonomy file and save it.
    BuildIndex {
        #[arg(long)]
        taxonomy: PathBuf,
        #[arg(long)]
        out: PathBuf,
    },
    /// Create the database and apply migrations.
    Migrate,
    /// Register a feed.
    AddFeed {
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Subscribe a webhook to completion events.
    AddWebhook {
        #[arg(long)]
        user: String,
        #[arg(long)]
        url: String,
        /// Defaults to every event.
        #[arg(long = "event")]
        events: Vec<String>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    running: u64,
    pending: u64,
    completed: u64,
    failed: u64,
    recent: Vec<feedsync::Job>,
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => log::error!("Failed to encode output: {}", e),
    }
}

fn services(config: &Config) -> Result<Services> {
    let db = open_database(config)?;
    let index = load_index(config)?;
    Services::build(config, db, index)
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::Serve => {
            let services = services(&config)?;
            let trigger = services.trigger(&config);
            tokio::select! {
                _ = trigger.run() => {}
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Shutdown requested");
                    trigger.stop();
                }
            }
        }
        Commands::Tick => {
            let services = services(&config)?;
            let report = services.scheduler.tick().await?;
            services.queue.wait_idle().await;
            print_json(&report);
        }
        Commands::Sync { feed_id } => {
            let services = services(&config)?;
            let job_id = services.scheduler.trigger_manual_sync(&feed_id)?;
            services.queue.wait_idle().await;
            print_json(&services.queue.ledger().require(&job_id)?);
        }
        Commands::Categorize { feed } => {
            let services = services(&config)?;
            match services
                .scheduler
                .schedule_categorization(feed.as_deref())
                .await?
            {
                Some(job_id) => {
                    services.scheduler.process_queue()?;
                    services.queue.wait_idle().await;
                    print_json(&services.queue.ledger().require(&job_id)?);
                }
                None => println!("Nothing to categorize"),
            }
        }
        Commands::Cancel { job_id } => {
            let ledger = JobLedger::new(open_database(&config)?);
            if ledger.cancel(&job_id)? {
                println!("Cancelled job {}", job_id);
            } else {
                println!("Job {} is not pending or running", job_id);
            }
        }
        Commands::Status { limit } => {
            let ledger = JobLedger::new(open_database(&config)?);
            print_json(&StatusReport {
                running: ledger.count(JobStatus::Running)?,
                pending: ledger.count(JobStatus::Pending)?,
                completed: ledger.count(JobStatus::Completed)?,
                failed: ledger.count(JobStatus::Failed)?,
                recent: ledger.recent(limit)?,
            });
        }
        Commands::BuildIndex { taxonomy, out } => {
            let index = build_index(&taxonomy)?;
            index.save(&out)?;
            println!("Wrote {} entries to {}", index.len(), out.display());
        }
        Commands::Migrate => {
            open_database(&config)?;
            println!("Schema at v{}", feedsync::db::migrations::latest_version());
        }
        Commands::AddFeed {
            user,
            name,
            url,
            interval_secs,
        } => {
            let db = open_database(&config)?;
            let mut feed = Feed::new(user, name, url);
            if let Some(secs) = interval_secs {
                feed.sync_interval_secs = secs;
            }
            feed_repo::insert(&db, &feed)?;
            println!("{}", feed.id);
        }
        Commands::AddWebhook { user, url, events } => {
            let db = open_database(&config)?;
            let events = if events.is_empty() {
                vec![
                    EVENT_SYNC_COMPLETED.to_string(),
                    EVENT_CATEGORIZATION_COMPLETED.to_string(),
                ]
            } else {
                events
            };
            let webhook = Webhook::new(user, url, events);
            webhook_repo::insert(&db, &webhook)?;
            println!("{}", webhook.id);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
