use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

use cardocs_rag::chunker::{Chunker, ChunkerConfig};
use cardocs_rag::config::Config;
use cardocs_rag::embeddings::EmbeddingService;
use cardocs_rag::llm::LlmClient;
use cardocs_rag::orchestrator::Orchestrator;
use cardocs_rag::store::{self, IndexStore};
use cardocs_rag::{captioner, converter};

fn get_log_level() -> String {
    std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
}

/// Pipeline stage selection: `convert`, `chunk`, `index`, or `chat` runs a
/// single stage; anything else runs the full pipeline and drops into chat.
fn get_pipeline_stage() -> Option<String> {
    std::env::var("PIPELINE_STAGE").ok().map(|s| s.to_lowercase())
}

fn setup_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(get_log_level()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv::dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }
    setup_logging();

    let config = Config::from_env();
    tokio::fs::create_dir_all(&config.data_dir).await?;
    tokio::fs::create_dir_all(&config.documents_dir).await?;
    tokio::fs::create_dir_all(&config.markdown_dir).await?;

    tracing::info!("Data directory: {:?}", config.data_dir);
    tracing::info!("Documents directory: {:?}", config.documents_dir);

    match get_pipeline_stage().as_deref() {
        Some("convert") => {
            run_convert(&config).await?;
        }
        Some("chunk") => {
            run_chunk(&config).await?;
        }
        Some("index") => {
            run_index(&config).await?;
        }
        Some("chat") => {
            let store = run_index(&config).await?;
            run_chat(&config, &store).await?;
        }
        _ => {
            run_convert(&config).await?;
            run_chunk(&config).await?;
            let store = run_index(&config).await?;
            run_chat(&config, &store).await?;
        }
    }

    Ok(())
}

async fn run_convert(config: &Config) -> Result<()> {
    converter::convert_documents(config).await?;

    // Image captioning needs the chat model; skip it quietly when the model
    // server is not reachable so conversion alone stays usable offline.
    let llm = LlmClient::new(config)?;
    if let Err(e) = captioner::caption_images(config, &llm).await {
        tracing::warn!("Image captioning skipped: {}", e);
    }
    Ok(())
}

/// Chunks every converted markdown file and saves the corpus. A file that
/// cannot be read is logged and skipped; it never aborts the batch.
async fn run_chunk(config: &Config) -> Result<()> {
    let chunker = Chunker::new(ChunkerConfig {
        min_chars: config.chunk_min_chars,
        max_chars: config.chunk_max_chars,
        overlap: config.chunk_overlap,
    });

    let mut chunks = Vec::new();
    let mut entries = tokio::fs::read_dir(&config.markdown_dir)
        .await
        .context("Failed to read markdown directory")?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().map(|e| e == "md").unwrap_or(false) {
            let filename = entry.file_name().to_string_lossy().to_string();
            match tokio::fs::read_to_string(&path).await {
                Ok(markdown) => {
                    chunks.extend(chunker.chunk_document(&filename, &markdown));
                }
                Err(e) => {
                    tracing::warn!("Skipping unreadable document {:?}: {}", path, e);
                }
            }
        }
    }

    if chunks.is_empty() {
        tracing::warn!("No chunks produced; is the markdown directory empty?");
        return Ok(());
    }

    store::save_chunks(&config.chunks_path(), &chunks).await
}

/// Builds or loads the index. The chunk corpus on disk is the canonical
/// input, so re-indexing does not require re-chunking.
async fn run_index(config: &Config) -> Result<IndexStore> {
    let embedder = EmbeddingService::new(config)?;
    embedder.test_connection().await?;

    let chunks = match store::load_chunks(&config.chunks_path()).await {
        Ok(chunks) => chunks,
        Err(e) => {
            tracing::warn!("No chunk corpus available ({}); chunking first", e);
            run_chunk(config).await?;
            store::load_chunks(&config.chunks_path()).await?
        }
    };

    IndexStore::build_or_load(config, chunks, config.force_rebuild, &embedder).await
}

/// Interactive chat loop on stdin/stdout. An empty line or EOF exits.
async fn run_chat(config: &Config, store: &IndexStore) -> Result<()> {
    let embedder = EmbeddingService::new(config)?;
    let llm = LlmClient::new(config)?;
    let mut orchestrator = Orchestrator::new(&llm, store, &embedder, config.top_k)
        .with_interaction_log(config.interactions_path());

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    stdout
        .write_all(b"Ask about your car documentation (empty line to quit).\n> ")
        .await?;
    stdout.flush().await?;

    while let Some(line) = lines.next_line().await? {
        let question = line.trim();
        if question.is_empty() {
            break;
        }

        let outcome = orchestrator.ask(question).await;
        let mut output = format!("\n{}\n", outcome.answer);
        if let Some(context) = &outcome.context {
            output.push_str("\n--- Retrieved context ---\n");
            output.push_str(context);
            output.push('\n');
        }
        output.push_str("\n> ");

        stdout.write_all(output.as_bytes()).await?;
        stdout.flush().await?;
    }

    tracing::info!("Chat session ended after {} turns", orchestrator.history().len());
    Ok(())
}
