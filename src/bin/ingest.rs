use clap::Parser;
use shaker::Config;
use shaker::index::SqliteIndexService;
use shaker::ingest::{IngestOutcome, Ingestor, ManifestStore};
use shaker::llm::OllamaClient;
use std::sync::Arc;
use std::time::Instant;
use anyhow::Result;

#[derive(Parser, Debug)]
#[command(name = "ingest")]
#[command(about = "Ingest the watched directory into the Shaker index (incremental by default)")]
struct Args {
    /// Rebuild the index from every file, ignoring the manifest
    #[arg(short, long)]
    force: bool,

    /// List manifest entries whose file is gone from the watched directory
    #[arg(short = 'm', long)]
    show_missing: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load()?;

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", config.shaker.log_level.as_str())
    ).init();
    Config::log_source();

    log::info!("Starting Shaker ingestion");
    log::info!("Data directory: {}", config.data_dir().display());
    log::info!("Storage directory: {}", config.storage_dir().display());
    log::info!("Embedding model: {} at {}", config.ollama.embedding_model, config.ollama.base_url);

    let client = Arc::new(OllamaClient::new(&config.ollama)?);
    let service = SqliteIndexService::new(config.storage_dir(), client, config.ingest.clone());
    let ingestor = Ingestor::new(&config, ManifestStore::new(config.manifest_path()), service)
        .with_force(args.force);

    let start = Instant::now();
    let outcome = match ingestor.run().await {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("{}", e);
            if e.is_recoverable() {
                log::error!("The manifest was not modified; rerun once the problem is fixed (is `ollama serve` running?)");
            }
            return Err(e.into());
        }
    };

    log::info!("=== Ingestion Complete ===");
    match &outcome {
        IngestOutcome::Indexed { files } => log::info!("Built a new index from {} file(s)", files.len()),
        IngestOutcome::Updated { files } => {
            log::info!("Added {} new or modified file(s) to the index", files.len());
            for name in files {
                log::info!("  {}", name);
            }
        }
        IngestOutcome::NoChanges => log::info!("No new or modified files; index is up to date"),
    }
    log::info!("Time: {:?}", start.elapsed());

    if args.show_missing {
        let missing = ingestor.missing_files()?;
        if missing.is_empty() {
            log::info!("Every manifest entry is still on disk");
        } else {
            log::info!("{} manifest entries no longer on disk (still indexed):", missing.len());
            for name in &missing {
                log::info!("  {}", name);
            }
        }
    }

    Ok(())
}
