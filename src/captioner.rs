use anyhow::{Context, Result};
use base64::Engine;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use walkdir::WalkDir;

use crate::config::Config;
use crate::llm::{ChatMessage, LlmClient};

/// Surrounding text passed to the model is capped at this many characters.
const MAX_CONTEXT_CHARS: usize = 2000;
/// Words of context taken on each side of an image tag.
const CONTEXT_WORDS: usize = 150;

fn image_tag_regex() -> &'static Regex {
    static IMAGE_TAG: OnceLock<Regex> = OnceLock::new();
    IMAGE_TAG.get_or_init(|| Regex::new(r"!\[(.*?)\]\((.*?)\)").expect("valid regex"))
}

/// Replaces markdown image tags in every converted file with short
/// model-generated descriptions. Failures are isolated per image: a missing
/// image file or a model error affects only that tag, never the whole file
/// or the batch.
pub async fn caption_images(config: &Config, llm: &LlmClient) -> Result<usize> {
    let mut files_processed = 0;

    for entry in WalkDir::new(&config.markdown_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        if path.extension().map(|e| e == "md").unwrap_or(false) {
            if let Err(e) = caption_markdown_file(path, llm).await {
                tracing::warn!("Failed to process {:?}: {}", path, e);
            } else {
                files_processed += 1;
            }
        }
    }

    tracing::info!("Captioning finished: {} markdown files processed", files_processed);
    Ok(files_processed)
}

async fn caption_markdown_file(path: &Path, llm: &LlmClient) -> Result<()> {
    let original = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;

    struct Tag {
        start: usize,
        end: usize,
        alt: String,
        image: String,
    }

    let tags: Vec<Tag> = image_tag_regex()
        .captures_iter(&original)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(Tag {
                start: whole.start(),
                end: whole.end(),
                alt: caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
                image: caps.get(2).map(|m| m.as_str().to_string()).unwrap_or_default(),
            })
        })
        .collect();

    if tags.is_empty() {
        return Ok(());
    }
    tracing::info!("Found {} image tags in {:?}", tags.len(), path);

    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut content = original.clone();

    // Replace from the back so earlier spans stay valid.
    for tag in tags.iter().rev() {
        let mut context = extract_context(&original, tag.start, tag.end);
        if context.is_empty() {
            context = if tag.alt.is_empty() {
                "No text context available".to_string()
            } else {
                tag.alt.clone()
            };
        }

        let image_path = base_dir.join(&tag.image);
        match describe_image(llm, &image_path, &context).await {
            Ok(description) => {
                content.replace_range(tag.start..tag.end, &description);
            }
            Err(e) => {
                // The tag stays in place; only this image is affected.
                tracing::error!("Could not describe {:?}: {}", image_path, e);
            }
        }
    }

    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}

/// Describes one image with the multimodal model. A missing image file is a
/// hard failure for this image; a model failure degrades to a placeholder
/// description instead.
pub async fn describe_image(llm: &LlmClient, image_path: &Path, context: &str) -> Result<String> {
    let bytes = tokio::fs::read(image_path)
        .await
        .with_context(|| format!("Image file not found: {:?}", image_path))?;

    let mime = mime_type(image_path);
    tracing::debug!("Submitting {:?} as {}", image_path.file_name(), mime);

    let capped: String = context.chars().take(MAX_CONTEXT_CHARS).collect();
    let prompt = format!(
        "Describe the following image concisely. Use the accompanying text \
         context from the page where the image appeared to inform the \
         description. Focus on what the image visually shows and how it \
         relates to the text, if possible. Avoid stating \"The image \
         shows...\".\n\nText Context:\n---\n{}\n---\n\nImage:",
        capped
    );

    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    match llm.chat(&[ChatMessage::user_with_image(prompt, encoded)]).await {
        Ok(description) => Ok(description.replace('\n', " ").trim().to_string()),
        Err(e) => {
            tracing::warn!("Model failed to describe {:?}: {}", image_path, e);
            let name = image_path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            Ok(format!("Error describing image {}", name))
        }
    }
}

/// Determines the mime type from the file extension. `jpg` normalizes to
/// `jpeg`; anything outside the supported set is coerced to `image/png`
/// rather than rejected.
///
/// The value is advisory only: the Ollama `images` field carries raw base64
/// bytes with no content-type slot, and the server sniffs the format from
/// the bytes. Coercion decides that the file is submitted anyway; the label
/// itself goes to the log.
fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        other => {
            tracing::warn!(
                "Potentially unsupported image type '{}'; using image/png",
                other
            );
            "image/png"
        }
    }
}

/// Takes up to [`CONTEXT_WORDS`] words on each side of the tag, strips other
/// image tags, and collapses whitespace.
fn extract_context(full_text: &str, tag_start: usize, tag_end: usize) -> String {
    let before = &full_text[..tag_start];
    let after = &full_text[tag_end..];

    let words_before: Vec<&str> = before.split_whitespace().collect();
    let words_after: Vec<&str> = after.split_whitespace().collect();

    let start = words_before.len().saturating_sub(CONTEXT_WORDS);
    let mut context = words_before[start..].join(" ");
    context.push(' ');
    context.push_str(&words_after[..words_after.len().min(CONTEXT_WORDS)].join(" "));

    let without_tags = image_tag_regex().replace_all(&context, "");
    without_tags.split_whitespace().collect::<Vec<_>>().join(" ")
}
