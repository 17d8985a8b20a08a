//! Retrieval-augmented question answering over automotive PDF documentation.
//!
//! The pipeline converts PDFs to markdown, splits them into size-bounded
//! chunks tagged with the car model they describe, embeds the chunks via an
//! Ollama-compatible API, and indexes the vectors in an in-process IVF-Flat
//! structure for approximate nearest-neighbor search. A chat layer rewrites
//! follow-up questions into standalone queries and answers strictly from the
//! retrieved context.
//!
//! Modules:
//! - [`config`]: explicit runtime configuration from environment variables
//! - [`converter`]: PDF to markdown conversion
//! - [`captioner`]: image descriptions via the multimodal model
//! - [`chunker`]: structural chunking with tag detection
//! - [`index`]: the IVF-Flat ANN structure
//! - [`store`]: index build/persist/load/query over a chunk corpus
//! - [`embeddings`]: embedding service client
//! - [`llm`]: chat-completion client
//! - [`retriever`]: caller-facing top-k search
//! - [`orchestrator`]: query rewriting and grounded answering

pub mod captioner;
pub mod chunker;
pub mod config;
pub mod converter;
pub mod embeddings;
pub mod index;
pub mod llm;
pub mod orchestrator;
pub mod retriever;
pub mod store;

pub use chunker::{Chunk, ChunkMetadata, Chunker, ChunkerConfig};
pub use config::Config;
pub use embeddings::{Embedder, EmbeddingService};
pub use index::IvfIndex;
pub use llm::LlmClient;
pub use orchestrator::{AnswerOutcome, Orchestrator};
pub use retriever::Retriever;
pub use store::{IndexStore, ScoredChunk};
