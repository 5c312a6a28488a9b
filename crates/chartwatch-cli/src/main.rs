use std::path::PathBuf;

use anyhow::{Context, Result};
use chartwatch_sync::{
    ensure_schema, load_genre_targets, maybe_build_scheduler, run_scrape_once, ScrapeConfig,
    SinkKind, SinkStatus,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "chartwatch-cli")]
#[command(about = "Scrape Beatport Top 100 genre charts into CSV or PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SinkArg {
    Csv,
    Postgres,
}

impl From<SinkArg> for SinkKind {
    fn from(value: SinkArg) -> Self {
        match value {
            SinkArg::Csv => SinkKind::Csv,
            SinkArg::Postgres => SinkKind::Postgres,
        }
    }
}

#[derive(Debug, Clone, Default, clap::Args)]
struct ScrapeArgs {
    /// Where to persist records (defaults to CHARTWATCH_SINK, then csv)
    #[arg(long, value_enum)]
    sink: Option<SinkArg>,

    /// Directory for the dated CSV file
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// YAML file with `genres: [url, ...]` replacing the built-in list
    #[arg(long)]
    genres_file: Option<PathBuf>,

    /// Keep a copy of every fetched chart page here
    #[arg(long)]
    archive_dir: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every genre chart once and persist the result
    Scrape(ScrapeArgs),
    /// Create the chart table if it does not exist
    Migrate,
    /// Serve the read-only chart API
    Serve,
    /// Run scrapes on CHARTWATCH_SCRAPE_CRON until interrupted
    Schedule(ScrapeArgs),
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "chartwatch_cli=info,chartwatch_sync=info,chartwatch_storage=info,chartwatch_web=info,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn scrape_config(args: ScrapeArgs) -> Result<ScrapeConfig> {
    let mut config = ScrapeConfig::from_env();
    if let Some(sink) = args.sink {
        config.sink = sink.into();
    }
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    if let Some(dir) = args.archive_dir {
        config.archive_dir = Some(dir);
    }
    if let Some(path) = args.genres_file {
        config.targets = load_genre_targets(&path)?;
        info!(genres = config.targets.len(), path = %path.display(), "loaded genre list");
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli
        .command
        .unwrap_or_else(|| Commands::Scrape(ScrapeArgs::default()))
    {
        Commands::Scrape(args) => {
            let summary = run_scrape_once(scrape_config(args)?).await?;
            println!(
                "scrape complete: run_id={} genres={} fetched={} failed={} empty={} records={}",
                summary.run_id,
                summary.genres_attempted,
                summary.genres_fetched,
                summary.genres_failed.len(),
                summary.genres_empty.len(),
                summary.records
            );
            match &summary.sink {
                SinkStatus::Written { sink, rows, target } => {
                    println!("wrote {rows} rows via {sink} to {target}")
                }
                SinkStatus::Failed { sink, error } => println!("{sink} sink failed: {error}"),
                SinkStatus::NotRun => {}
            }
        }
        Commands::Migrate => {
            let config = ScrapeConfig::from_env();
            ensure_schema(&config.db).await?;
            println!("table beatport_top100 ready on {}", config.db.describe());
        }
        Commands::Serve => {
            chartwatch_web::serve_from_env().await?;
        }
        Commands::Schedule(args) => {
            let mut config = scrape_config(args)?;
            config.scheduler_enabled = true;
            let Some(sched) = maybe_build_scheduler(&config).await? else {
                warn!("scheduler disabled");
                return Ok(());
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.scrape_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            let mut sched = sched;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
