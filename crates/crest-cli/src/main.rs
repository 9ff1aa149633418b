use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crest_ingest::ingest_reports;
use crest_store::ReportStore;
use crest_web::AppState;

const DEFAULT_DATABASE_URL: &str = "sqlite:crest.db?mode=rwc";
const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Parser)]
#[command(name = "crest")]
#[command(about = "Consensus research report store")]
struct Cli {
    /// SQLite database URL (falls back to CREST_DATABASE_URL)
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the schema and seed the rating codes
    Migrate,
    /// Load a reports CSV, optionally joined with a reviews CSV
    Ingest {
        #[arg(long)]
        reports: PathBuf,
        #[arg(long)]
        reviews: Option<PathBuf>,
    },
    /// Serve the JSON API (falls back to CREST_WEB_PORT)
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crest_ingest=info,crest_store=info,crest_web=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let database_url = cli
        .db
        .or_else(|| std::env::var("CREST_DATABASE_URL").ok())
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string());

    let store = ReportStore::connect(&database_url)
        .await
        .with_context(|| format!("opening {database_url}"))?;

    match cli.command {
        Commands::Migrate => {
            store.migrate().await?;
            println!("schema ready: {database_url}");
        }
        Commands::Ingest { reports, reviews } => {
            store.migrate().await?;
            let summary = ingest_reports(&store, &reports, reviews.as_deref()).await?;
            store.refresh_stock_summary().await?;
            println!(
                "ingest complete: run_id={} rows={} inserted={} skipped_duplicates={}",
                summary.run_id, summary.rows_read, summary.inserted, summary.skipped_duplicates
            );
        }
        Commands::Serve { port } => {
            let port = port
                .or_else(|| {
                    std::env::var("CREST_WEB_PORT")
                        .ok()
                        .and_then(|v| v.parse().ok())
                })
                .unwrap_or(DEFAULT_PORT);
            crest_web::serve(AppState::new(store), port).await?;
        }
    }

    Ok(())
}
