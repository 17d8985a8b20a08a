//! End-to-end pipeline tests: markdown chunking, index build, persistence
//! round-trips, and the answering layer's fixed fallbacks. Everything runs
//! offline against a deterministic stub embedder.

use anyhow::Result;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use cardocs_rag::chunker::{Chunker, ChunkerConfig};
use cardocs_rag::config::Config;
use cardocs_rag::embeddings::Embedder;
use cardocs_rag::llm::LlmClient;
use cardocs_rag::orchestrator::{Orchestrator, LLM_ERROR_MESSAGE, NO_CONTEXT_MESSAGE};
use cardocs_rag::store::IndexStore;

/// Maps each distinct text to a stable 16-dimensional vector and counts
/// batch-embedding calls, so tests can assert when embeddings were (not)
/// recomputed.
struct StubEmbedder {
    batch_calls: AtomicUsize,
}

impl StubEmbedder {
    fn new() -> Self {
        Self {
            batch_calls: AtomicUsize::new(0),
        }
    }

    fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    fn vector_for(text: &str) -> Vec<f32> {
        let mut state: u64 = 0xcbf29ce484222325;
        for byte in text.bytes() {
            state ^= byte as u64;
            state = state.wrapping_mul(0x100000001b3);
        }
        (0..16u32)
            .map(|i| ((state.rotate_left(i * 4) & 0xffff) as f32) / 65535.0)
            .collect()
    }
}

impl Embedder for StubEmbedder {
    fn model_name(&self) -> &str {
        "stub-embedder"
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector_for(t)).collect())
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        Ok(Self::vector_for(text))
    }
}

fn test_config(dir: &Path) -> Config {
    Config {
        data_dir: dir.to_path_buf(),
        embedding_dim: 16,
        ..Config::default()
    }
}

fn sample_manual() -> String {
    let mut md = String::from("# Honda Civic Owner's Manual\n\n");
    for i in 0..30 {
        md.push_str(&format!(
            "## Section {i}\n\nThe Honda Civic requires service item number {i} at the \
             scheduled interval. Check the fluid levels, inspect the belts, and rotate \
             the tires according to the maintenance schedule in this section.\n\n"
        ));
    }
    md
}

#[tokio::test]
async fn test_chunk_build_persist_load_query() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let embedder = StubEmbedder::new();

    let chunker = Chunker::new(ChunkerConfig::default());
    let chunks = chunker.chunk_document("honda_civic.md", &sample_manual());
    assert!(!chunks.is_empty());
    for chunk in &chunks {
        assert_eq!(chunk.metadata.car_model, "Honda");
        assert!(chunk.text.chars().count() <= 1500);
    }

    let built = IndexStore::build(&config, chunks, &embedder).await.unwrap();

    // A freshly loaded index answers a fixed query identically to the
    // in-memory one it was persisted from.
    let loaded = IndexStore::load(&config).await.unwrap();
    let query = "tire rotation maintenance schedule";
    let from_built = built.search(query, 5, &embedder).await.unwrap();
    let from_loaded = loaded.search(query, 5, &embedder).await.unwrap();

    assert!(!from_built.is_empty());
    let built_ids: Vec<_> = from_built.iter().map(|r| r.chunk.id).collect();
    let loaded_ids: Vec<_> = from_loaded.iter().map(|r| r.chunk.id).collect();
    assert_eq!(built_ids, loaded_ids);
}

#[tokio::test]
async fn test_build_or_load_is_idempotent_without_force() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let embedder = StubEmbedder::new();

    let chunker = Chunker::new(ChunkerConfig::default());
    let chunks = chunker.chunk_document("honda_civic.md", &sample_manual());

    IndexStore::build_or_load(&config, chunks.clone(), false, &embedder)
        .await
        .unwrap();
    assert_eq!(embedder.batch_calls(), 1);

    IndexStore::build_or_load(&config, chunks.clone(), false, &embedder)
        .await
        .unwrap();
    assert_eq!(embedder.batch_calls(), 1, "load must not recompute embeddings");

    IndexStore::build_or_load(&config, chunks, true, &embedder)
        .await
        .unwrap();
    assert_eq!(embedder.batch_calls(), 2, "force rebuild must retrain");
}

#[tokio::test]
async fn test_query_edge_cases() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let embedder = StubEmbedder::new();

    let chunker = Chunker::new(ChunkerConfig::default());
    let chunks = chunker.chunk_document("subaru_outback.md", &sample_manual());
    let corpus_size = chunks.len();
    let store = IndexStore::build(&config, chunks, &embedder).await.unwrap();

    // k larger than the corpus is not an error.
    let oversized = store.search("anything", corpus_size + 100, &embedder).await.unwrap();
    assert!(oversized.len() <= corpus_size);
    assert!(!oversized.is_empty());

    // An empty query returns an empty result, not an error.
    assert!(store.search("", 5, &embedder).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_empty_retrieval_short_circuits_to_fixed_message() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let embedder = StubEmbedder::new();

    let chunker = Chunker::new(ChunkerConfig::default());
    let chunks = chunker.chunk_document("manual.md", &sample_manual());
    let store = IndexStore::build(&config, chunks, &embedder).await.unwrap();

    // The model is never contacted for an empty retrieval, so a client
    // pointing at an unreachable server is fine here.
    let llm = LlmClient::new(&config).unwrap();
    let orchestrator = Orchestrator::new(&llm, &store, &embedder, config.top_k);

    let outcome = orchestrator.answer("What oil does it take?", &[]).await;
    assert_eq!(outcome.answer, NO_CONTEXT_MESSAGE);
    assert!(outcome.context.is_none());
}

#[tokio::test]
async fn test_interaction_log_appends_one_record_per_turn() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        // Unreachable chat endpoint: the turn degrades to the fixed error
        // message but must still be logged.
        ollama_url: "http://127.0.0.1:59999".to_string(),
        ..test_config(dir.path())
    };
    let embedder = StubEmbedder::new();

    let chunker = Chunker::new(ChunkerConfig::default());
    let chunks = chunker.chunk_document("manual.md", &sample_manual());
    let store = IndexStore::build(&config, chunks, &embedder).await.unwrap();

    let llm = LlmClient::new(&config).unwrap();
    let log_path = dir.path().join("interactions.jsonl");
    let mut orchestrator = Orchestrator::new(&llm, &store, &embedder, config.top_k)
        .with_interaction_log(log_path.clone());

    let outcome = orchestrator.ask("What oil does the engine take?").await;
    assert_eq!(outcome.answer, LLM_ERROR_MESSAGE);

    let contents = tokio::fs::read_to_string(&log_path).await.unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 1);

    let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(record["question"], "What oil does the engine take?");
    assert_eq!(record["answer"], LLM_ERROR_MESSAGE);
    assert!(record["timestamp"].is_string());
    assert!(record["standalone_question"].is_string());
    // A degraded turn carries no grounded context, so the field is null.
    assert!(record["contexts"].is_null());

    // A second turn appends instead of truncating.
    orchestrator.ask("And the coolant capacity?").await;
    let contents = tokio::fs::read_to_string(&log_path).await.unwrap();
    assert_eq!(contents.lines().count(), 2);
}

#[tokio::test]
async fn test_rewrite_with_empty_history_returns_query_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let embedder = StubEmbedder::new();

    let chunker = Chunker::new(ChunkerConfig::default());
    let chunks = chunker.chunk_document("manual.md", &sample_manual());
    let store = IndexStore::build(&config, chunks, &embedder).await.unwrap();

    let llm = LlmClient::new(&config).unwrap();
    let orchestrator = Orchestrator::new(&llm, &store, &embedder, config.top_k);

    // No history means no rewrite call at all.
    let standalone = orchestrator.rewrite_standalone("What oil does it take?").await;
    assert_eq!(standalone, "What oil does it take?");
}
