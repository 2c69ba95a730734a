use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tempo_client::{ChromiumBackend, ChromiumSettings};
use tempo_core::intercept::RequestFilter;
use tempo_core::models::{ScrapeKind, SubjectId};
use tempo_core::scrape::{DEFAULT_TARGET_BASE_URL, ScrapeConfig, Scraper, StrategyMode};
use tempo_core::traits::{BrowserBackend, BrowserSession};

#[derive(Parser)]
#[command(name = "tempo", version, about = "Monthly listeners and play counts, scraped on demand")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch a browser, scrape one figure, and print it
    Scrape {
        #[command(subcommand)]
        target: Target,

        #[command(flatten)]
        options: ScrapeOptions,
    },

    /// Check whether an identifier is well-formed, without scraping
    CheckId {
        /// Artist or track identifier
        id: String,
    },
}

#[derive(Subcommand)]
enum Target {
    /// An artist's monthly listeners
    Listeners {
        /// 22-character artist identifier
        artist_id: String,
    },
    /// A track's play count
    Playcount {
        /// 22-character track identifier
        track_id: String,
    },
}

#[derive(Args)]
struct ScrapeOptions {
    /// Site the figures are read from
    #[arg(long, env = "TEMPO_TARGET_BASE_URL", default_value = DEFAULT_TARGET_BASE_URL, global = true)]
    base_url: String,

    /// Navigation timeout in seconds
    #[arg(long, env = "TEMPO_NAVIGATION_TIMEOUT_SECS", default_value_t = 30, global = true)]
    navigation_timeout: u64,

    /// Per-strategy element timeout in seconds
    #[arg(long, env = "TEMPO_SELECTOR_TIMEOUT_SECS", default_value_t = 10, global = true)]
    selector_timeout: u64,

    /// Run extraction strategies all at once ("race") or one by one ("sequential")
    #[arg(long, env = "TEMPO_STRATEGY_MODE", default_value = "race", global = true)]
    strategy_mode: StrategyMode,

    /// Tracker hosts to block, comma-separated (defaults to a built-in list)
    #[arg(long, env = "TEMPO_BLOCKED_HOSTS", value_delimiter = ',', global = true)]
    blocked_hosts: Vec<String>,

    /// Let every request through, including images and trackers
    #[arg(long, default_value_t = false, global = true)]
    no_block: bool,

    /// Chrome/Chromium binary
    #[arg(long, env = "CHROME_BIN", global = true)]
    chrome_bin: Option<PathBuf>,

    /// Print the full result as JSON
    #[arg(long, default_value_t = false, global = true)]
    json: bool,
}

impl ScrapeOptions {
    fn scrape_config(&self) -> ScrapeConfig {
        let filter = if self.no_block {
            RequestFilter::allow_all()
        } else if self.blocked_hosts.is_empty() {
            RequestFilter::default()
        } else {
            RequestFilter::default_kinds().with_blocked_hosts(&self.blocked_hosts)
        };

        ScrapeConfig {
            target_base_url: self.base_url.trim_end_matches('/').to_string(),
            navigation_timeout: Duration::from_secs(self.navigation_timeout),
            selector_timeout: Duration::from_secs(self.selector_timeout),
            strategy_mode: self.strategy_mode,
            filter,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Setup tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tempo=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scrape { target, options } => {
            let (kind, raw_id) = match target {
                Target::Listeners { artist_id } => (ScrapeKind::ArtistListeners, artist_id),
                Target::Playcount { track_id } => (ScrapeKind::TrackPlaycount, track_id),
            };
            cmd_scrape(kind, &raw_id, &options).await?;
        }
        Commands::CheckId { id } => cmd_check_id(&id)?,
    }

    Ok(())
}

async fn cmd_scrape(kind: ScrapeKind, raw_id: &str, options: &ScrapeOptions) -> Result<()> {
    let subject = SubjectId::parse(raw_id).map_err(|e| anyhow::anyhow!(e))?;
    let config = options.scrape_config();

    let backend = ChromiumBackend::new(ChromiumSettings {
        chrome_bin: options.chrome_bin.clone(),
        element_wait: config.selector_timeout,
        ..Default::default()
    });

    tracing::info!("Launching headless browser");
    let session = backend
        .launch()
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("Could not start the browser")?;

    tracing::info!(
        url = %kind.page_url(&config.target_base_url, &subject),
        "Scraping {}",
        kind.label()
    );
    let scraper = Scraper::new(config);
    let outcome = scraper.scrape(&session, kind, &subject).await;

    if let Err(e) = session.close().await {
        tracing::warn!(error = %e.sanitized(), "Failed to close browser");
    }

    let result = outcome.map_err(|e| anyhow::anyhow!(e.sanitized()))?;
    if options.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.value);
    }
    Ok(())
}

fn cmd_check_id(raw_id: &str) -> Result<()> {
    match SubjectId::parse(raw_id) {
        Ok(id) => {
            println!("{id} is a valid identifier");
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!(e)),
    }
}
