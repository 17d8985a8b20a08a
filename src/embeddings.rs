use anyhow::Result;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use tokio::sync::RwLock;

use crate::config::Config;

#[derive(Serialize)]
#[serde(untagged)]
enum EmbeddingRequest<'a> {
    Single { model: &'a str, input: &'a str },
    Batch { model: &'a str, input: &'a [String] },
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    embeddings: Option<Vec<Vec<f32>>>,
}

/// Anything that can turn text into fixed-dimension vectors. The index store
/// and retriever are generic over this so they can be exercised without a
/// running model server.
#[allow(async_fn_in_trait)]
pub trait Embedder {
    fn model_name(&self) -> &str;

    /// Embeds a batch of texts, one vector per input, in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embeds a single query string. Implementations may cache.
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>>;
}

/// Embedding service backed by an Ollama-compatible API, with an LRU cache
/// for query embeddings.
pub struct EmbeddingService {
    client: reqwest::Client,
    ollama_url: String,
    model: String,
    query_cache: RwLock<LruCache<String, Vec<f32>>>,
}

impl EmbeddingService {
    pub fn new(config: &Config) -> Result<Self> {
        tracing::info!("Ollama URL: {}", config.ollama_url);
        tracing::info!("Embedding model: {}", config.embedding_model);

        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(1200))
                .build()?,
            ollama_url: config.ollama_url.clone(),
            model: config.embedding_model.clone(),
            query_cache: RwLock::new(LruCache::new(
                NonZeroUsize::new(1000).unwrap_or(NonZeroUsize::MIN),
            )),
        })
    }

    async fn get_embedding(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest::Single {
            model: &self.model,
            input: text,
        };
        let response = self
            .client
            .post(format!("{}/api/embed", self.ollama_url))
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Ollama API error: {} - {}",
                response.status(),
                response.text().await.unwrap_or_default()
            ));
        }
        let body: EmbeddingResponse = response.json().await?;
        if let Some(embedding) = body.embedding {
            Ok(embedding)
        } else if let Some(embeddings) = body.embeddings {
            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("Empty embeddings array from Ollama"))
        } else {
            Err(anyhow::anyhow!("No embedding returned from Ollama"))
        }
    }

    /// Verifies the server is reachable. Called once at startup so a missing
    /// model server fails fast instead of surfacing mid-pipeline.
    pub async fn test_connection(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.ollama_url))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Cannot connect to Ollama at {}. Make sure Ollama is running.",
                self.ollama_url
            ));
        }

        tracing::info!("Successfully connected to Ollama at {}", self.ollama_url);
        Ok(())
    }
}

impl Embedder for EmbeddingService {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        if texts.len() > 1 {
            let request = EmbeddingRequest::Batch {
                model: &self.model,
                input: texts,
            };

            // Hard timeout so a wedged model server cannot hang the build.
            const BATCH_TIMEOUT_SECS: u64 = 1200;
            let request_future = self
                .client
                .post(format!("{}/api/embed", self.ollama_url))
                .json(&request)
                .send();

            let response = match tokio::time::timeout(
                tokio::time::Duration::from_secs(BATCH_TIMEOUT_SECS),
                request_future,
            )
            .await
            {
                Ok(Ok(resp)) => resp,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(anyhow::anyhow!(
                        "Batch embedding request timed out after {} seconds for {} texts",
                        BATCH_TIMEOUT_SECS,
                        texts.len()
                    ))
                }
            };

            if !response.status().is_success() {
                return Err(anyhow::anyhow!(
                    "Ollama API error: {} - {}",
                    response.status(),
                    response.text().await.unwrap_or_default()
                ));
            }

            let body: EmbeddingResponse = response.json().await?;

            if let Some(embeddings) = body.embeddings {
                if embeddings.len() == texts.len() {
                    return Ok(embeddings);
                }
                tracing::warn!(
                    "Batch embedding returned {} embeddings for {} texts, falling back to sequential",
                    embeddings.len(),
                    texts.len()
                );
            } else if body.embedding.is_some() {
                tracing::warn!(
                    "Model '{}' doesn't support batch embeddings, falling back to sequential",
                    self.model
                );
            }

            tracing::info!("Processing {} embeddings sequentially", texts.len());
            let mut result = Vec::with_capacity(texts.len());
            for text in texts {
                result.push(self.get_embedding(text).await?);
            }
            return Ok(result);
        }

        Ok(vec![self.get_embedding(&texts[0]).await?])
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.query_cache.write().await.get(text) {
            return Ok(cached.clone());
        }

        let embedding = self.get_embedding(text).await?;
        self.query_cache
            .write()
            .await
            .put(text.to_string(), embedding.clone());
        Ok(embedding)
    }
}
