use anyhow::Result;
use clap::{Parser, ValueEnum};
use fleet_core::CrawlMode;
use fleet_crawl::{CrawlConfig, Crawler, HttpFetcher};
use fleet_store::SupabaseStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Historical backfill: walk pages forward until the cutoff, resumable.
    Initial,
    /// Incremental run: process rows until the previous head signature.
    Nightly,
}

impl From<Mode> for CrawlMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Initial => CrawlMode::Initial,
            Mode::Nightly => CrawlMode::Nightly,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "fleet-cli")]
#[command(about = "Member fleet crawler command-line interface")]
struct Cli {
    /// Crawl mode.
    #[arg(long, value_enum)]
    mode: Mode,
}

async fn crawl(mode: CrawlMode) -> Result<()> {
    let config = CrawlConfig::from_env()?;
    let store = SupabaseStore::new(
        &config.supabase_url,
        &config.supabase_service_role_key,
    )?;
    let fetcher = HttpFetcher::new(&config)?;

    let summary = Crawler::new(&config, &fetcher, &store).run(mode).await?;
    info!(stop = ?summary.stop, "crawl finished");
    println!(
        "crawl complete: mode={} pages={} rows={} created={} patched={} skipped={}",
        summary.mode,
        summary.pages_fetched,
        summary.rows_seen,
        summary.cars_created,
        summary.cars_patched,
        summary.rows_skipped
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    crawl(cli.mode.into()).await
}
