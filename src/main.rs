use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use id_crawler::{
    CheckpointSource, CheckpointStore, CrawlConfig, Crawler, Credentials, PartitionedSqlite,
    ProgressMode, TwitterClient,
};

#[derive(Parser, Debug)]
#[clap(about, version, author)]
struct Args {
    /// Env file holding the API credentials
    #[clap(short, long, default_value = ".env", global = true)]
    env_file: PathBuf,

    /// Directory with one database per creation year
    #[clap(long, default_value = "db", global = true)]
    db_dir: PathBuf,

    #[clap(subcommand)]
    command: Option<Command>,

    #[clap(flatten)]
    crawl: CrawlArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Look up the next identifier ranges (default)
    Crawl(CrawlArgs),
    /// Write every stored record to a CSV file
    Export {
        #[clap(short, long, default_value = "users.csv")]
        out: PathBuf,
    },
}

#[derive(ClapArgs, Debug, Clone)]
struct CrawlArgs {
    /// Show a progress bar instead of text output
    #[clap(short = 'b', long)]
    progress_bar: bool,

    /// File holding the sequential checkpoint
    #[clap(long, default_value = "offset.bin")]
    checkpoint: PathBuf,

    /// Seed a fresh checkpoint from the highest id in this database
    #[clap(long)]
    legacy_db: Option<PathBuf>,

    /// Re-check ids stored in this database instead of enumerating
    #[clap(short, long, conflicts_with = "legacy_db")]
    refetch: Option<PathBuf>,

    /// Maximum concurrent lookups (defaults to the open file limit)
    #[clap(short, long)]
    concurrency: Option<usize>,

    #[clap(flatten)]
    credentials: CredentialArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct CredentialArgs {
    #[clap(long, env = "TW_CONSUMER_KEY", hide_env_values = true)]
    consumer_key: Option<String>,

    #[clap(long, env = "TW_CONSUMER_SECRET", hide_env_values = true)]
    consumer_secret: Option<String>,

    /// User access token; requests are signed in user context when set
    #[clap(long, env = "TW_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    #[clap(long, env = "TW_ACCESS_SECRET", hide_env_values = true)]
    access_secret: Option<String>,

    /// App-only bearer token, used when no access token is set
    #[clap(long, env = "TW_BEARER_TOKEN", hide_env_values = true)]
    bearer_token: Option<String>,
}

impl CredentialArgs {
    fn credentials(&self) -> id_crawler::Result<Credentials> {
        Ok(
            Credentials::new(self.consumer_key.clone(), self.consumer_secret.clone())?
                .with_access_token(self.access_token.clone(), self.access_secret.clone())?
                .with_bearer_token(self.bearer_token.clone()),
        )
    }
}

impl CrawlArgs {
    fn config(&self, db_dir: PathBuf) -> CrawlConfig {
        let checkpoint = match &self.refetch {
            Some(path) => CheckpointSource::Relational { path: path.clone() },
            None => CheckpointSource::File {
                path: self.checkpoint.clone(),
                legacy_db: self.legacy_db.clone(),
            },
        };
        let mut config = CrawlConfig::new(checkpoint);
        config.partition_dir = db_dir;
        config.concurrency = self.concurrency;
        config.progress = if self.progress_bar {
            ProgressMode::Bar
        } else {
            ProgressMode::Text
        };
        config
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = dotenvy::from_path(&args.env_file) {
        eprintln!("Error: loading {} file: {}", args.env_file.display(), e);
    }
    // Parse again so `env` fallbacks see the variables the file just set.
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "id_crawler=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run(args).await {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    match args.command {
        Some(Command::Export { out }) => {
            let store = PartitionedSqlite::new(&args.db_dir);
            let written = id_crawler::storage::export_csv(&store, &out)?;
            println!("Exported {} user IDs to {}", written, out.display());
            Ok(())
        }
        Some(Command::Crawl(crawl)) => crawl_once(&crawl, args.db_dir).await,
        None => crawl_once(&args.crawl, args.db_dir).await,
    }
}

async fn crawl_once(args: &CrawlArgs, db_dir: PathBuf) -> Result<()> {
    let config = args.config(db_dir);
    config.validate()?;
    let credentials = args.credentials.credentials()?;
    let client = TwitterClient::connect(&credentials)
        .await
        .context("connecting to the lookup API")?;

    let store = CheckpointStore::open(&config.checkpoint)?;
    let sink = PartitionedSqlite::new(&config.partition_dir);
    let mut crawler = Crawler::new(Arc::new(client), store, sink, &config)?;

    let shutdown = crawler.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, abandoning outstanding batches");
            shutdown.cancel();
        }
    });

    let report = crawler.run().await?;
    crawler.close()?;

    if report.found == 0 {
        println!("Not Found user IDs");
    } else {
        println!("Found {} user IDs", report.found);
    }
    Ok(())
}
