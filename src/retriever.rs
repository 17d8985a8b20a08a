use anyhow::Result;

use crate::embeddings::Embedder;
use crate::store::{IndexStore, ScoredChunk};

/// Caller-facing retrieval interface: top-k most similar chunks to a query.
/// Thin wrapper over the index store that applies the configured default `k`
/// and degrades failures to an empty result.
pub struct Retriever<'a, E: Embedder> {
    store: &'a IndexStore,
    embedder: &'a E,
    top_k: usize,
}

impl<'a, E: Embedder> Retriever<'a, E> {
    pub fn new(store: &'a IndexStore, embedder: &'a E, top_k: usize) -> Self {
        Self {
            store,
            embedder,
            top_k,
        }
    }

    /// Retrieves the `k` nearest chunks. Errors from the embedding service
    /// surface to the caller; an empty query yields an empty result.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>> {
        let results = self.store.search(query, k, self.embedder).await?;
        tracing::debug!(
            "Retrieved {} chunks for query ({} requested)",
            results.len(),
            k
        );
        Ok(results)
    }

    /// [`Retriever::search`] with the configured default result count.
    pub async fn search_default(&self, query: &str) -> Result<Vec<ScoredChunk>> {
        self.search(query, self.top_k).await
    }
}
