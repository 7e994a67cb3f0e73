use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crawlq_core::normalize_site_id;
use crawlq_worker::{connect_from_env, ResumeMode, RunMode};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "crawlq")]
#[command(about = "Crawl job queue and page extraction workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Discover the site's sitemaps and seed its URLs as pending jobs.
    Ingest { site_url: String },
    /// Claim and process batches of jobs, then exit.
    Work {
        #[arg(long)]
        site: Option<String>,
        #[arg(long)]
        concurrency: Option<usize>,
        /// Keep claiming batches until the queue is empty.
        #[arg(long)]
        drain: bool,
        /// Upper bound on jobs claimed while draining.
        #[arg(long, requires = "drain")]
        max: Option<usize>,
    },
    /// Process jobs until Ctrl-C.
    Run {
        #[arg(long)]
        site: Option<String>,
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Reset one URL to pending and process it immediately.
    ProcessUrl { site: String, url: String },
    Status { site: String },
    /// Requeue stale leases and retryable errors.
    Resume {
        site: String,
        #[arg(long)]
        stale_only: bool,
    },
    /// Queue every job of the site again with a fresh attempt budget.
    Refetch { site: String },
    Reprocess { site: String, url: String },
    Retry {
        site: String,
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },
    /// Delete the listed jobs that are in error.
    Purge {
        site: String,
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },
    /// Delete every job and page of the site.
    Reset { site: String },
    Page { site: String, url: String },
}

/// Accepts either a bare site id or any URL of the site.
fn site_id(arg: &str) -> Result<String> {
    if arg.contains("://") {
        Ok(normalize_site_id(arg)?)
    } else {
        Ok(arg.trim().to_ascii_lowercase())
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let (app, store) = connect_from_env().await?;

    match cli.command {
        Commands::Migrate => {
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Ingest { site_url } => {
            let report = app.sitemaps().ingest(app.jobs().as_ref(), &site_url).await?;
            println!(
                "ingest complete: site={} discovered={} upserted={} pending={}",
                report.site_id, report.discovered, report.upserted, report.pending_total
            );
        }
        Commands::Work {
            site,
            concurrency,
            drain,
            max,
        } => {
            let site = site.as_deref().map(site_id).transpose()?;
            let concurrency = concurrency.unwrap_or(app.config().concurrency);
            let mode = if drain {
                RunMode::Drain {
                    max_total: max.or(app.config().drain_max),
                }
            } else {
                RunMode::Once
            };
            let report = app.pool().run(mode, concurrency, site.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Run { site, concurrency } => {
            let site = site.as_deref().map(site_id).transpose()?;
            let concurrency = concurrency.unwrap_or(app.config().concurrency);
            let (tx, rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested; finishing in-flight batch");
                    let _ = tx.send(true);
                }
            });
            let report = app.pool().run_continuous(concurrency, site.as_deref(), rx).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::ProcessUrl { site, url } => {
            let site = site_id(&site)?;
            match app.pool().process_url(&site, &url).await? {
                Some(outcome) => println!("{}", serde_json::to_string(&outcome)?),
                None => println!("{url} was claimed by another worker"),
            }
        }
        Commands::Status { site } => {
            let site = site_id(&site)?;
            let counts = app.maintenance().status(&site).await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Commands::Resume { site, stale_only } => {
            let site = site_id(&site)?;
            let mode = if stale_only {
                ResumeMode::StaleOnly
            } else {
                ResumeMode::All
            };
            let report = app.maintenance().resume(&site, mode).await?;
            println!(
                "resume complete: reclaimed={} requeued_errors={}",
                report.reclaimed, report.requeued_errors
            );
        }
        Commands::Refetch { site } => {
            let site = site_id(&site)?;
            let report = app.maintenance().refetch_site(&site).await?;
            println!("refetch queued: ingest_id={} modified={}", report.ingest_id, report.modified);
        }
        Commands::Reprocess { site, url } => {
            let site = site_id(&site)?;
            let outcome = app.maintenance().reprocess(&site, &url).await?;
            println!("reprocess queued: job_id={} inserted={}", outcome.job_id, outcome.inserted);
        }
        Commands::Retry { site, ids } => {
            let site = site_id(&site)?;
            let modified = app.maintenance().retry_jobs(&site, &ids).await?;
            println!("retry queued: requested={} modified={modified}", ids.len());
        }
        Commands::Purge { site, ids } => {
            let site = site_id(&site)?;
            let deleted = app.maintenance().purge_errors(&site, &ids).await?;
            println!("purge complete: requested={} deleted={deleted}", ids.len());
        }
        Commands::Reset { site } => {
            let site = site_id(&site)?;
            let report = app.maintenance().reset_site(&site).await?;
            println!(
                "reset complete: jobs_deleted={} pages_deleted={}",
                report.jobs_deleted, report.pages_deleted
            );
        }
        Commands::Page { site, url } => {
            let site = site_id(&site)?;
            match app.maintenance().page(&site, &url).await? {
                Some(page) => println!("{}", serde_json::to_string_pretty(&page)?),
                None => anyhow::bail!("no page stored for {url}"),
            }
        }
    }

    Ok(())
}
