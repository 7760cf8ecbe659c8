use shaker::Config;
use shaker::index::load_index;
use shaker::llm::{Embedder, OllamaClient};
use shaker::query::QueryEngine;
use shaker::server::ChatHttpServer;
use shaker::verify::verify_index;
use std::sync::Arc;
use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", config.shaker.log_level.as_str())
    ).init();
    Config::log_source();

    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("verify");

    match command {
        "serve-http" => run_http_server(config).await?,
        "health" => run_health_check(&config).await?,
        "verify" => run_verification(&config).await?,
        other => {
            anyhow::bail!("Unknown command '{}'. Expected one of: verify, serve-http, health", other);
        }
    }

    Ok(())
}

/// Serve the chat endpoint. Starts without an index if none can be loaded.
async fn run_http_server(config: Config) -> Result<()> {
    log::info!("Starting Shaker HTTP server v{}", env!("CARGO_PKG_VERSION"));

    let client = Arc::new(OllamaClient::new(&config.ollama)?);
    if !client.health_check().await {
        log::warn!("Ollama is not reachable at {}; chat requests will fail until it is", client.base_url());
    }

    let (engine, load_error) = match load_index(&config.index_path(), Some(config.ollama.embedding_model.as_str())).await {
        Ok(index) => {
            log::info!(
                "Loaded index: {} documents, {} chunks",
                index.document_count(),
                index.chunk_count()
            );
            let engine = QueryEngine::new(index, client.clone(), client.clone(), &config.query);
            (Some(engine), None)
        }
        Err(e) => {
            log::warn!("{}; /chat will answer 503 until ingestion has run and the server is restarted", e);
            (None, Some(e.to_string()))
        }
    };

    let server = ChatHttpServer::new(engine, load_error, &config.http_server);
    server.run(config.http_server.port).await?;
    Ok(())
}

/// Report whether the model daemon is up and has the configured models.
async fn run_health_check(config: &Config) -> Result<()> {
    let client = OllamaClient::new(&config.ollama)?;
    if !client.health_check().await {
        anyhow::bail!("Ollama is not reachable at {}. Start it with `ollama serve`", client.base_url());
    }
    log::info!("Ollama is reachable at {}", client.base_url());

    let missing = client.missing_models().await?;
    if missing.is_empty() {
        log::info!("Models available: {}, {}", client.model(), client.llm_model());
    } else {
        for model in &missing {
            log::warn!("Model {} is not pulled. Run `ollama pull {}`", model, model);
        }
    }
    Ok(())
}

/// Inspect storage, index and manifest.
async fn run_verification(config: &Config) -> Result<()> {
    log::info!("Starting Shaker v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Data directory: {}", config.data_dir().display());
    log::info!("Index path: {}", config.index_path().display());
    log::info!("Manifest: {}", config.manifest_path().display());

    let report = verify_index(config).await?;
    report.log();

    if !report.is_consistent() {
        log::warn!("Run `ingest --force` to rebuild the index and manifest together");
    }
    Ok(())
}
