use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::chunker::Chunk;
use crate::config::Config;
use crate::embeddings::Embedder;
use crate::index::IvfIndex;

const STORE_VERSION: u32 = 1;

/// Load failures are distinguished so callers can tell "nothing persisted
/// yet" from "persisted state is damaged". Both fall back to a rebuild, but
/// they are logged differently.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no persisted index at {0}")]
    IndexMissing(PathBuf),
    #[error("index metadata missing at {0}")]
    MetadataMissing(PathBuf),
    #[error("persisted index state at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("index and metadata are inconsistent: {0}")]
    Inconsistent(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreMeta {
    version: u32,
    model: String,
    dimension: usize,
    chunk_count: usize,
}

/// One retrieval hit: a chunk and its squared-L2 distance to the query.
/// Lower distance means higher similarity; scores are on the raw metric's
/// scale, not normalized.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub distance: f32,
}

/// Owns the trained ANN structure, the position-to-chunk mapping, and the
/// name of the embedding model the vectors were produced with.
#[derive(Debug)]
pub struct IndexStore {
    index: IvfIndex,
    chunks: Vec<Chunk>,
    model: String,
}

impl IndexStore {
    /// Builds a fresh index from a chunk corpus: batch-embeds every chunk
    /// text, trains the coarse quantizer, inserts all vectors, and persists
    /// the result as a unit. Training or insertion failure aborts the whole
    /// build; no partial index is ever persisted.
    pub async fn build(
        config: &Config,
        mut chunks: Vec<Chunk>,
        embedder: &impl Embedder,
    ) -> Result<Self> {
        if chunks.is_empty() {
            anyhow::bail!("Cannot build an index from an empty chunk corpus");
        }

        tracing::info!("Building index over {} chunks...", chunks.len());
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = embedder
            .embed_batch(&texts)
            .await
            .context("Failed to embed chunk corpus")?;
        if embeddings.len() != chunks.len() {
            anyhow::bail!(
                "Embedding count mismatch: {} embeddings for {} chunks",
                embeddings.len(),
                chunks.len()
            );
        }

        let mut dimension = config.embedding_dim;
        if let Some(first) = embeddings.first() {
            if first.len() != dimension {
                tracing::warn!(
                    "Configured embedding dimension {} does not match model output {}; using {}",
                    dimension,
                    first.len(),
                    first.len()
                );
                dimension = first.len();
            }
        }

        let mut index = IvfIndex::new(dimension, config.nlist, config.nprobe);
        index
            .train(&embeddings)
            .context("Failed to train IVF index")?;

        for (chunk, embedding) in chunks.iter_mut().zip(embeddings) {
            chunk.embedding = embedding.clone();
            index
                .add(embedding)
                .context("Failed to insert vector into IVF index")?;
        }

        let store = Self {
            index,
            chunks,
            model: embedder.model_name().to_string(),
        };
        store.persist(config).await?;
        tracing::info!(
            "Index built and persisted: {} vectors, dimension {}",
            store.index.len(),
            store.index.dimension()
        );
        Ok(store)
    }

    /// Loads a previously persisted index. The ANN structure, its metadata,
    /// and the chunk corpus must all be present and mutually consistent.
    pub async fn load(config: &Config) -> Result<Self, StoreError> {
        let index_path = config.index_path();
        let meta_path = config.meta_path();
        let chunks_path = config.chunks_path();

        if !tokio::fs::try_exists(&index_path).await? {
            return Err(StoreError::IndexMissing(index_path));
        }
        if !tokio::fs::try_exists(&meta_path).await? {
            return Err(StoreError::MetadataMissing(meta_path));
        }
        if !tokio::fs::try_exists(&chunks_path).await? {
            return Err(StoreError::MetadataMissing(chunks_path));
        }

        let meta: StoreMeta = read_json(&meta_path).await?;
        let index: IvfIndex = read_json(&index_path).await?;
        let chunks: Vec<Chunk> = read_json(&chunks_path).await?;

        if meta.version != STORE_VERSION {
            return Err(StoreError::Inconsistent(format!(
                "unsupported store version {}",
                meta.version
            )));
        }
        if index.len() != chunks.len() || meta.chunk_count != chunks.len() {
            return Err(StoreError::Inconsistent(format!(
                "{} vectors, {} chunks, metadata says {}",
                index.len(),
                chunks.len(),
                meta.chunk_count
            )));
        }
        if index.dimension() != meta.dimension {
            return Err(StoreError::Inconsistent(format!(
                "index dimension {} but metadata says {}",
                index.dimension(),
                meta.dimension
            )));
        }
        if !index.is_trained() {
            return Err(StoreError::Inconsistent(
                "persisted index is untrained".to_string(),
            ));
        }

        tracing::info!(
            "Loaded persisted index: {} chunks, model '{}'",
            chunks.len(),
            meta.model
        );
        Ok(Self {
            index,
            chunks,
            model: meta.model,
        })
    }

    /// The single entry point external callers use. Loads the persisted
    /// index unless a rebuild is forced; any load failure logs and falls
    /// through to a fresh build. Never returns a stale index when a rebuild
    /// was requested.
    pub async fn build_or_load(
        config: &Config,
        chunks: Vec<Chunk>,
        force_rebuild: bool,
        embedder: &impl Embedder,
    ) -> Result<Self> {
        if force_rebuild {
            tracing::info!("Force rebuild requested; ignoring any persisted index");
        } else {
            match Self::load(config).await {
                Ok(store) => {
                    if store.model != embedder.model_name() {
                        tracing::warn!(
                            "Persisted index was built with model '{}' but '{}' is configured; rebuilding",
                            store.model,
                            embedder.model_name()
                        );
                    } else {
                        return Ok(store);
                    }
                }
                Err(StoreError::IndexMissing(path)) => {
                    tracing::info!("No persisted index at {:?}; building fresh", path);
                }
                Err(e) => {
                    tracing::warn!("Could not load persisted index ({}); rebuilding", e);
                }
            }
        }

        Self::build(config, chunks, embedder).await
    }

    /// Top-k similarity search. An empty or whitespace-only query returns an
    /// empty result with a warning; it is not an error. At most corpus-size
    /// results are returned regardless of `k`.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        embedder: &impl Embedder,
    ) -> Result<Vec<ScoredChunk>> {
        if query.trim().is_empty() {
            tracing::warn!("Empty query; returning no results");
            return Ok(Vec::new());
        }

        let embedding = embedder
            .embed_query(query)
            .await
            .context("Failed to embed query")?;

        let hits = self.index.search(&embedding, k);
        Ok(hits
            .into_iter()
            .map(|(position, distance)| ScoredChunk {
                chunk: self.chunks[position].clone(),
                distance,
            })
            .collect())
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Persists the ANN structure, its metadata, and the chunk corpus as a
    /// unit. Each file is written atomically (temp file + rename); the
    /// chunk corpus is stored without embeddings, which live in the index
    /// file.
    async fn persist(&self, config: &Config) -> Result<()> {
        tokio::fs::create_dir_all(config.vector_store_dir())
            .await
            .context("Failed to create vector store directory")?;
        if let Some(parent) = config.chunks_path().parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create chunks directory")?;
        }

        let meta = StoreMeta {
            version: STORE_VERSION,
            model: self.model.clone(),
            dimension: self.index.dimension(),
            chunk_count: self.chunks.len(),
        };

        let corpus: Vec<Chunk> = self
            .chunks
            .iter()
            .map(|c| Chunk {
                embedding: Vec::new(),
                ..c.clone()
            })
            .collect();

        write_json_atomic(&config.index_path(), &self.index).await?;
        write_json_atomic(&config.meta_path(), &meta).await?;
        write_json_atomic(&config.chunks_path(), &corpus).await?;

        tracing::debug!(
            "Persisted index ({} vectors) and metadata to {:?}",
            self.index.len(),
            config.vector_store_dir()
        );
        Ok(())
    }
}

/// Saves a chunk corpus as a JSON array, the canonical interchange form
/// consumed when rebuilding an index without re-chunking.
pub async fn save_chunks(path: &Path, chunks: &[Chunk]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create chunks directory")?;
    }
    write_json_atomic(path, &chunks).await?;
    tracing::info!("Saved {} chunks to {:?}", chunks.len(), path);
    Ok(())
}

pub async fn load_chunks(path: &Path) -> Result<Vec<Chunk>> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read chunk corpus at {:?}", path))?;
    let chunks: Vec<Chunk> =
        serde_json::from_str(&data).context("Failed to parse chunk corpus")?;
    tracing::info!("Loaded {} chunks from {:?}", chunks.len(), path);
    Ok(chunks)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let data = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&data).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// Atomic write: serialize to a temp file in the same directory, then
/// rename over the final path.
async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let temp_path = path.with_extension("tmp");
    let data = serde_json::to_string_pretty(value)?;
    tokio::fs::write(&temp_path, data)
        .await
        .with_context(|| format!("Failed to write temporary file for {:?}", path))?;
    tokio::fs::rename(&temp_path, path)
        .await
        .with_context(|| format!("Failed to commit {:?} (atomic rename)", path))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkMetadata;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    /// Deterministic offline embedder: every distinct text maps to a stable
    /// 16-dimensional vector. Counts batch calls so tests can assert that a
    /// load never recomputes embeddings.
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
                .map(|i| {
                    let v = state.rotate_left(i * 4) & 0xffff;
                    v as f32 / 65535.0
                })
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

    fn make_chunk(text: &str) -> Chunk {
        Chunk {
            id: Uuid::new_v4(),
            text: text.to_string(),
            metadata: ChunkMetadata {
                source: "manual.md".to_string(),
                car_model: "Honda".to_string(),
                section: None,
                extra: BTreeMap::new(),
            },
            embedding: Vec::new(),
        }
    }

    fn corpus(n: usize) -> Vec<Chunk> {
        (0..n)
            .map(|i| make_chunk(&format!("Chunk number {} about engine maintenance.", i)))
            .collect()
    }

    fn test_config(dir: &Path) -> Config {
        Config {
            data_dir: dir.to_path_buf(),
            embedding_dim: 16,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_build_requires_nonempty_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let embedder = StubEmbedder::new();

        let result = IndexStore::build(&config, vec![], &embedder).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_exact_text_query_returns_chunk_top1() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let embedder = StubEmbedder::new();
        let chunks = corpus(10);
        let target = chunks[4].clone();

        let store = IndexStore::build(&config, chunks, &embedder).await.unwrap();
        let results = store.search(&target.text, 1, &embedder).await.unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.id, target.id);
        assert!(results[0].distance < 1e-6);
    }

    #[tokio::test]
    async fn test_round_trip_query_equivalence() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let embedder = StubEmbedder::new();

        let built = IndexStore::build(&config, corpus(12), &embedder)
            .await
            .unwrap();
        let loaded = IndexStore::load(&config).await.unwrap();

        let query = "engine maintenance schedule";
        let from_built = built.search(query, 5, &embedder).await.unwrap();
        let from_loaded = loaded.search(query, 5, &embedder).await.unwrap();

        let built_ids: Vec<Uuid> = from_built.iter().map(|r| r.chunk.id).collect();
        let loaded_ids: Vec<Uuid> = from_loaded.iter().map(|r| r.chunk.id).collect();
        assert_eq!(built_ids, loaded_ids);
    }

    #[tokio::test]
    async fn test_k_greater_than_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let embedder = StubEmbedder::new();

        let store = IndexStore::build(&config, corpus(3), &embedder)
            .await
            .unwrap();
        let results = store.search("anything", 50, &embedder).await.unwrap();
        assert!(results.len() <= 3);
        assert!(!results.is_empty());
    }

    #[tokio::test]
    async fn test_empty_query_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let embedder = StubEmbedder::new();

        let store = IndexStore::build(&config, corpus(3), &embedder)
            .await
            .unwrap();
        assert!(store.search("", 5, &embedder).await.unwrap().is_empty());
        assert!(store.search("   ", 5, &embedder).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_without_index_file_is_distinct_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        let err = IndexStore::load(&config).await.unwrap_err();
        assert!(matches!(err, StoreError::IndexMissing(_)));
    }

    #[tokio::test]
    async fn test_load_with_missing_metadata_is_distinct_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let embedder = StubEmbedder::new();

        IndexStore::build(&config, corpus(3), &embedder)
            .await
            .unwrap();
        tokio::fs::remove_file(config.meta_path()).await.unwrap();

        let err = IndexStore::load(&config).await.unwrap_err();
        assert!(matches!(err, StoreError::MetadataMissing(_)));
    }

    #[tokio::test]
    async fn test_load_with_corrupt_metadata_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let embedder = StubEmbedder::new();

        IndexStore::build(&config, corpus(3), &embedder)
            .await
            .unwrap();
        tokio::fs::write(config.meta_path(), "{ not json")
            .await
            .unwrap();

        let err = IndexStore::load(&config).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_build_or_load_reuses_persisted_index() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let embedder = StubEmbedder::new();
        let chunks = corpus(5);

        IndexStore::build_or_load(&config, chunks.clone(), false, &embedder)
            .await
            .unwrap();
        assert_eq!(embedder.batch_calls(), 1);

        // Second call loads from disk; embeddings are not recomputed.
        IndexStore::build_or_load(&config, chunks, false, &embedder)
            .await
            .unwrap();
        assert_eq!(embedder.batch_calls(), 1);
    }

    #[tokio::test]
    async fn test_build_or_load_force_rebuild_retrains() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let embedder = StubEmbedder::new();
        let chunks = corpus(5);

        IndexStore::build_or_load(&config, chunks.clone(), false, &embedder)
            .await
            .unwrap();
        IndexStore::build_or_load(&config, chunks, true, &embedder)
            .await
            .unwrap();
        assert_eq!(embedder.batch_calls(), 2);
    }

    #[tokio::test]
    async fn test_build_or_load_falls_back_after_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let embedder = StubEmbedder::new();
        let chunks = corpus(5);

        IndexStore::build(&config, chunks.clone(), &embedder)
            .await
            .unwrap();
        tokio::fs::write(config.index_path(), "garbage")
            .await
            .unwrap();

        let store = IndexStore::build_or_load(&config, chunks, false, &embedder)
            .await
            .unwrap();
        assert_eq!(store.len(), 5);
        assert_eq!(embedder.batch_calls(), 2);
    }

    #[tokio::test]
    async fn test_dimension_auto_correct() {
        let dir = tempfile::tempdir().unwrap();
        // Configured dimension disagrees with the stub's actual output (16).
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            embedding_dim: 768,
            ..Config::default()
        };
        let embedder = StubEmbedder::new();

        let store = IndexStore::build(&config, corpus(4), &embedder)
            .await
            .unwrap();
        let results = store.search("engine", 2, &embedder).await.unwrap();
        assert!(!results.is_empty());
    }

    #[tokio::test]
    async fn test_chunk_corpus_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chunks").join("chunks.json");
        let chunks = corpus(4);

        save_chunks(&path, &chunks).await.unwrap();
        let loaded = load_chunks(&path).await.unwrap();

        assert_eq!(loaded.len(), 4);
        assert_eq!(loaded[0].id, chunks[0].id);
        assert_eq!(loaded[0].text, chunks[0].text);
        assert_eq!(loaded[0].metadata, chunks[0].metadata);
    }
}
