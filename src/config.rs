use std::path::PathBuf;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Runtime configuration, collected once from the environment and passed
/// explicitly to every component. There is no global configuration state.
#[derive(Debug, Clone)]
pub struct Config {
    pub ollama_url: String,
    pub embedding_model: String,
    pub chat_model: String,
    pub data_dir: PathBuf,
    pub documents_dir: PathBuf,
    pub markdown_dir: PathBuf,
    /// Expected embedding dimension. Corrected at build time if the model
    /// reports a different one.
    pub embedding_dim: usize,
    pub top_k: usize,
    pub force_rebuild: bool,
    /// Number of coarse clusters in the IVF index.
    pub nlist: usize,
    /// Clusters probed per query.
    pub nprobe: usize,
    /// Minimum buffer length before a merged buffer is closed.
    pub chunk_min_chars: usize,
    /// Maximum length of an emitted chunk.
    pub chunk_max_chars: usize,
    /// Character overlap carried between consecutive chunks of one buffer.
    pub chunk_overlap: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            ollama_url: env_or("OLLAMA_URL", "http://localhost:11434"),
            embedding_model: env_or("OLLAMA_EMBEDDING_MODEL", "nomic-embed-text"),
            chat_model: env_or("OLLAMA_CHAT_MODEL", "llama3.1"),
            data_dir: PathBuf::from(env_or("DATA_DIR", "./data")),
            documents_dir: PathBuf::from(env_or("DOCUMENTS_DIR", "./documents")),
            markdown_dir: PathBuf::from(env_or("MARKDOWN_DIR", "./markdown")),
            embedding_dim: env_parse("EMBEDDING_DIM", 768),
            top_k: env_parse("TOP_K", 5),
            force_rebuild: std::env::var("FORCE_REBUILD")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            nlist: env_parse("IVF_NLIST", 256),
            nprobe: env_parse("IVF_NPROBE", 16),
            chunk_min_chars: env_parse("CHUNK_MIN_CHARS", 250),
            chunk_max_chars: env_parse("CHUNK_MAX_CHARS", 1500),
            chunk_overlap: env_parse("CHUNK_OVERLAP", 150),
        }
    }

    pub fn vector_store_dir(&self) -> PathBuf {
        self.data_dir.join("vector_store")
    }

    /// Serialized ANN structure. Loading requires [`Config::meta_path`] too.
    pub fn index_path(&self) -> PathBuf {
        self.vector_store_dir().join("ivf.index")
    }

    pub fn meta_path(&self) -> PathBuf {
        self.vector_store_dir().join("meta.json")
    }

    /// Canonical chunk corpus, a JSON array of chunk records.
    pub fn chunks_path(&self) -> PathBuf {
        self.data_dir.join("chunks").join("chunks.json")
    }

    pub fn interactions_path(&self) -> PathBuf {
        self.data_dir.join("interactions.jsonl")
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            chat_model: "llama3.1".to_string(),
            data_dir: PathBuf::from("./data"),
            documents_dir: PathBuf::from("./documents"),
            markdown_dir: PathBuf::from("./markdown"),
            embedding_dim: 768,
            top_k: 5,
            force_rebuild: false,
            nlist: 256,
            nprobe: 16,
            chunk_min_chars: 250,
            chunk_max_chars: 1500,
            chunk_overlap: 150,
        }
    }
}
