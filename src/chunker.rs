use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Known car models, checked in order. The first substring match wins, so
/// more specific names must precede their prefixes ("Ford Mustang" before
/// "Ford").
pub const KNOWN_CAR_MODELS: &[&str] = &[
    "Ford Mustang",
    "Daewoo Matiz",
    "Honda",
    "Subaru",
    "Ford",
    "Volkswagen",
];

pub const DEFAULT_CAR_MODEL: &str = "Volkswagen";

/// Separators tried in priority order when a buffer exceeds the maximum
/// chunk length. If none matches inside the window, the cut falls back to a
/// raw character boundary.
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", "? ", "! ", "... ", " "];

/// Typed chunk metadata with a closed set of recognized keys plus an open
/// extension bucket for provenance fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Source document filename.
    pub source: String,
    /// Detected car model tag.
    pub car_model: String,
    /// Heading the chunk falls under, when the document had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// A bounded unit of document text prepared for embedding and retrieval.
/// Immutable once created; the embedding is filled in at index-build time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: Uuid,
    pub text: String,
    pub metadata: ChunkMetadata,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    /// A merged buffer is closed once it reaches this many characters.
    pub min_chars: usize,
    /// No emitted chunk exceeds this many characters.
    pub max_chars: usize,
    /// Characters repeated at the boundary between consecutive chunks of the
    /// same buffer.
    pub overlap: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            min_chars: 250,
            max_chars: 1500,
            overlap: 150,
        }
    }
}

/// A structurally coherent markdown node with its inherited section heading.
#[derive(Debug, Clone)]
struct Node {
    text: String,
    section: Option<String>,
}

/// A merged buffer awaiting tag detection and splitting.
#[derive(Debug, Clone)]
struct Buffer {
    text: String,
    section: Option<String>,
}

/// Splits a markdown document into size-bounded chunks.
///
/// Structural nodes (paragraphs, list items, tables, code blocks) are merged
/// forward until a buffer reaches `min_chars`, tagged with a detected car
/// model, then split so no chunk exceeds `max_chars`, carrying `overlap`
/// characters across boundaries.
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Chunks one document. A document with no structural nodes yields an
    /// empty vector, which is not an error.
    pub fn chunk_document(&self, filename: &str, markdown: &str) -> Vec<Chunk> {
        let nodes = Self::parse_nodes(markdown);
        if nodes.is_empty() {
            tracing::debug!("Document {} produced no structural nodes", filename);
            return Vec::new();
        }

        let buffers = self.merge_nodes(nodes);
        let mut chunks = Vec::new();

        for buffer in buffers {
            let car_model = detect_car_model(&buffer.text, filename);
            let tagged = format!("Car model: {}\n\n{}", car_model, buffer.text);

            for piece in self.split_text(&tagged) {
                chunks.push(Chunk {
                    id: Uuid::new_v4(),
                    text: piece,
                    metadata: ChunkMetadata {
                        source: filename.to_string(),
                        car_model: car_model.to_string(),
                        section: buffer.section.clone(),
                        extra: BTreeMap::new(),
                    },
                    embedding: Vec::new(),
                });
            }
        }

        tracing::info!("Chunked {} into {} chunks", filename, chunks.len());
        chunks
    }

    /// Flattens markdown into an ordered sequence of text nodes. Headings
    /// set the current section but are not emitted as nodes themselves.
    fn parse_nodes(markdown: &str) -> Vec<Node> {
        let mut nodes = Vec::new();
        let mut section: Option<String> = None;
        let mut block: Vec<&str> = Vec::new();
        let mut in_code_fence = false;

        let flush = |block: &mut Vec<&str>, section: &Option<String>, nodes: &mut Vec<Node>| {
            if block.is_empty() {
                return;
            }
            let text = block.join("\n").trim().to_string();
            block.clear();
            if !text.is_empty() {
                nodes.push(Node {
                    text,
                    section: section.clone(),
                });
            }
        };

        for line in markdown.lines() {
            let trimmed = line.trim_end();

            if trimmed.trim_start().starts_with("```") {
                in_code_fence = !in_code_fence;
                block.push(trimmed);
                if !in_code_fence {
                    flush(&mut block, &section, &mut nodes);
                }
                continue;
            }

            if in_code_fence {
                block.push(trimmed);
                continue;
            }

            if trimmed.is_empty() {
                flush(&mut block, &section, &mut nodes);
                continue;
            }

            if trimmed.starts_with('#') {
                flush(&mut block, &section, &mut nodes);
                let heading = trimmed.trim_start_matches('#').trim();
                if !heading.is_empty() {
                    section = Some(heading.to_string());
                }
                continue;
            }

            block.push(trimmed);
        }

        flush(&mut block, &section, &mut nodes);
        nodes
    }

    /// Merge-forward: accumulate nodes (joined with a blank line) until the
    /// buffer reaches the minimum length, then close it. A non-empty trailing
    /// buffer is flushed even when it is still under the minimum.
    fn merge_nodes(&self, nodes: Vec<Node>) -> Vec<Buffer> {
        let mut buffers = Vec::new();
        let mut current: Option<Buffer> = None;

        for node in nodes {
            match current.as_mut() {
                None => {
                    current = Some(Buffer {
                        text: node.text,
                        section: node.section,
                    });
                }
                Some(buffer) => {
                    buffer.text.push_str("\n\n");
                    buffer.text.push_str(&node.text);
                }
            }

            let reached_min = current
                .as_ref()
                .is_some_and(|b| b.text.chars().count() >= self.config.min_chars);
            if reached_min {
                if let Some(buffer) = current.take() {
                    buffers.push(buffer);
                }
            }
        }

        if let Some(buffer) = current {
            buffers.push(buffer);
        }

        buffers
    }

    /// Iterative separator-based splitter. Each chunk is at most `max_chars`
    /// long; the cut point is the last occurrence of the highest-priority
    /// separator inside the window, falling back to a raw character cut. The
    /// next chunk restarts `overlap` characters before the cut.
    fn split_text(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let max = self.config.max_chars;

        if chars.len() <= max {
            return vec![text.to_string()];
        }

        let mut pieces = Vec::new();
        let mut start = 0;

        loop {
            let window_end = (start + max).min(chars.len());
            if window_end == chars.len() {
                pieces.push(chars[start..].iter().collect());
                break;
            }

            // A cut inside the overlap region would be re-found on the next
            // iteration (the window restarts `overlap` characters back) and
            // stall the scan, so only separators past it qualify.
            let min_cut = start + self.config.overlap.min(max - 1);
            let cut = Self::find_cut(&chars, min_cut, window_end);
            pieces.push(chars[start..cut].iter().collect());

            // Restart with overlap, always making forward progress.
            start = cut.saturating_sub(self.config.overlap).max(start + 1);
        }

        pieces
    }

    /// Finds the cut position for the window ending at `window_end`: the end
    /// of the last occurrence of the first separator that ends strictly
    /// after `min_cut`. Returns `window_end` (raw cut) when no separator
    /// qualifies.
    fn find_cut(chars: &[char], min_cut: usize, window_end: usize) -> usize {
        for sep in SEPARATORS {
            let sep_chars: Vec<char> = sep.chars().collect();
            if window_end < sep_chars.len() {
                continue;
            }
            let last_begin = window_end - sep_chars.len();
            for i in (0..=last_begin).rev() {
                let cut = i + sep_chars.len();
                if cut <= min_cut {
                    break;
                }
                if chars[i..i + sep_chars.len()] == sep_chars[..] {
                    return cut;
                }
            }
        }
        window_end
    }
}

/// Detects the car model for a buffer by case-insensitive substring match.
/// Each model in [`KNOWN_CAR_MODELS`] is checked against the buffer text and
/// the normalized filename (dashes and underscores replaced with spaces)
/// before moving to the next, so list order decides ties between a model in
/// the text and an earlier one in the filename. Falls back to
/// [`DEFAULT_CAR_MODEL`].
pub fn detect_car_model(text: &str, filename: &str) -> &'static str {
    let text_lower = text.to_lowercase();
    let filename_lower = filename.replace(['-', '_'], " ").to_lowercase();

    for model in KNOWN_CAR_MODELS {
        let model_lower = model.to_lowercase();
        if text_lower.contains(&model_lower) || filename_lower.contains(&model_lower) {
            return model;
        }
    }
    DEFAULT_CAR_MODEL
}
