use clap::Parser;
use shaker::index::{load_index, storage_initialized};
use shaker::llm::OllamaClient;
use shaker::query::{ChatSession, QueryEngine, TurnOutcome};
use shaker::{Config, ShakerError};
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use anyhow::Result;

#[derive(Parser, Debug)]
#[command(name = "chat")]
#[command(about = "Ask questions about the ingested documents")]
struct Args {
    /// Number of chunks retrieved per question (defaults to query.top_k)
    #[arg(short = 'k', long)]
    top_k: Option<usize>,
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

    if !storage_initialized(config.storage_dir())? {
        let err = ShakerError::IndexNotFound(config.storage_dir().to_path_buf());
        eprintln!("{}", err);
        return Err(err.into());
    }

    let index = load_index(&config.index_path(), Some(config.ollama.embedding_model.as_str())).await?;
    log::info!("Loaded {} documents ({} chunks)", index.document_count(), index.chunk_count());

    let client = Arc::new(OllamaClient::new(&config.ollama)?);
    if !client.health_check().await {
        log::warn!("Ollama is not reachable at {}. Start it with `ollama serve`", client.base_url());
    }

    let engine = QueryEngine::new(index, client.clone(), client, &config.query)
        .with_top_k(args.top_k.unwrap_or(config.query.top_k));
    let mut session = ChatSession::new();

    println!("Ask a question (Ctrl-C stops an answer, `exit` or Ctrl-D quits).");
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());

    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next() => line,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line.transpose()? else {
            println!();
            break;
        };

        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if matches!(query, "exit" | "quit") {
            break;
        }

        let cancel = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        let outcome = session
            .ask(&engine, query, cancel, |fragment| {
                print!("{}", fragment);
                let _ = std::io::stdout().flush();
            })
            .await;

        match outcome {
            Ok(TurnOutcome::Completed(_)) => println!(),
            Ok(TurnOutcome::Cancelled) => println!("\n[stopped]"),
            Err(e) => {
                println!();
                log::error!("{}", e);
                if e.is_recoverable() {
                    log::error!("Is `ollama serve` running at {}?", config.ollama.base_url);
                }
            }
        }
    }

    Ok(())
}
