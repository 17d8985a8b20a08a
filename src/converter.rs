use anyhow::{Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::OnceLock;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::config::Config;

#[derive(Debug, Default)]
pub struct ConversionReport {
    pub converted: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Converts every PDF under the documents directory into a markdown file in
/// the markdown directory. Idempotent: a source whose converted output
/// already exists (and whose content hash is unchanged) is skipped. A
/// document that cannot be read or parsed is logged and skipped; it never
/// aborts the batch.
pub async fn convert_documents(config: &Config) -> Result<ConversionReport> {
    tokio::fs::create_dir_all(&config.markdown_dir)
        .await
        .context("Failed to create markdown directory")?;

    let mut report = ConversionReport::default();

    for entry in WalkDir::new(&config.documents_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let is_pdf = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);
        if !is_pdf {
            continue;
        }

        match convert_one(config, path).await {
            Ok(true) => report.converted += 1,
            Ok(false) => report.skipped += 1,
            Err(e) => {
                tracing::warn!("Skipping {:?}: {}", path, e);
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        "Conversion finished: {} converted, {} skipped, {} failed",
        report.converted,
        report.skipped,
        report.failed
    );
    Ok(report)
}

/// Converts a single PDF. Returns `Ok(false)` when the output already exists
/// for an unchanged source.
async fn convert_one(config: &Config, path: &Path) -> Result<bool> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .context("Document has no usable filename")?;
    let output_path = config.markdown_dir.join(format!("{stem}.md"));
    let hash_path = config.markdown_dir.join(format!("{stem}.md.sha256"));

    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {:?}", path))?;
    let hash = content_hash(&data);

    if tokio::fs::try_exists(&output_path).await? {
        let recorded = tokio::fs::read_to_string(&hash_path).await.ok();
        match recorded {
            Some(recorded) if recorded.trim() != hash => {
                tracing::info!("{:?} changed since last conversion; reconverting", path);
            }
            _ => {
                tracing::debug!("Markdown for {:?} already exists; skipping", path);
                return Ok(false);
            }
        }
    }

    tracing::info!("Converting {:?}", path);
    let text = extract_pdf_text(data).await?;
    let markdown = to_markdown(stem, &text);

    // Atomic write: temp file in the target directory, then rename.
    let temp_path = config
        .markdown_dir
        .join(format!(".{}.{}.tmp", stem, Uuid::new_v4()));
    tokio::fs::write(&temp_path, markdown)
        .await
        .context("Failed to write temporary markdown file")?;
    tokio::fs::rename(&temp_path, &output_path)
        .await
        .context("Failed to commit markdown file (atomic rename)")?;
    tokio::fs::write(&hash_path, &hash)
        .await
        .context("Failed to record source hash")?;

    Ok(true)
}

fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// PDF text extraction off the async executor, with a two-stage fallback:
/// pure-Rust lopdf first, then the pdftotext binary.
async fn extract_pdf_text(data: Vec<u8>) -> Result<String> {
    let data_for_fallback = data.clone();

    let lopdf_result = tokio::task::spawn_blocking(move || lopdf_extract_sync(&data))
        .await
        .context("lopdf extraction task failed")?;

    match lopdf_result {
        Ok(text) => Ok(text),
        Err(lopdf_err) => {
            tracing::warn!(
                error = %lopdf_err,
                "Pure-Rust PDF extraction failed, falling back to pdftotext"
            );
            tokio::task::spawn_blocking(move || pdftotext_extract_sync(&data_for_fallback))
                .await
                .context("pdftotext extraction task failed")?
                .map_err(|pdftotext_err| {
                    anyhow::anyhow!(
                        "PDF extraction failed: lopdf error: {}, pdftotext error: {}",
                        lopdf_err,
                        pdftotext_err
                    )
                })
        }
    }
}

fn lopdf_extract_sync(data: &[u8]) -> Result<String> {
    use lopdf::Document;

    let doc = Document::load_mem(data)
        .map_err(|e| anyhow::anyhow!("lopdf failed to parse PDF: {}", e))?;

    let mut all_text = String::new();
    for (page_num, _page_id) in doc.get_pages() {
        match doc.extract_text(&[page_num]) {
            Ok(page_text) => {
                if !all_text.is_empty() && !page_text.is_empty() {
                    all_text.push('\n');
                }
                all_text.push_str(&page_text);
            }
            Err(e) => {
                tracing::debug!("lopdf: failed to extract text from page {}: {}", page_num, e);
            }
        }
    }

    if all_text.trim().is_empty() {
        return Err(anyhow::anyhow!("lopdf extracted no text from PDF"));
    }

    Ok(all_text)
}

/// Fallback extraction using the pdftotext binary. UUID-named temp file so
/// concurrent extractions cannot collide.
fn pdftotext_extract_sync(data: &[u8]) -> Result<String> {
    use std::process::Command;

    let temp_file = std::env::temp_dir().join(format!("convert_pdf_{}.pdf", Uuid::new_v4()));
    std::fs::write(&temp_file, data)
        .map_err(|e| anyhow::anyhow!("Failed to write temp PDF: {}", e))?;

    let output = Command::new("pdftotext")
        .arg("-layout")
        .arg("-enc")
        .arg("UTF-8")
        .arg(&temp_file)
        .arg("-")
        .output();
    let _ = std::fs::remove_file(&temp_file);

    match output {
        Ok(output) if output.status.success() => {
            let text = String::from_utf8_lossy(&output.stdout).to_string();
            if text.trim().is_empty() {
                Err(anyhow::anyhow!("pdftotext produced no text output"))
            } else {
                Ok(text)
            }
        }
        Ok(output) => Err(anyhow::anyhow!(
            "pdftotext failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )),
        Err(e) => Err(anyhow::anyhow!(
            "pdftotext command failed: {} (is poppler installed?)",
            e
        )),
    }
}

/// Shapes extracted text into markdown: a title heading, trimmed lines, and
/// runs of blank lines collapsed to paragraph breaks.
fn to_markdown(title: &str, text: &str) -> String {
    static BLANK_RUNS: OnceLock<Regex> = OnceLock::new();
    let blank_runs = BLANK_RUNS.get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"));

    let trimmed: String = text
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    let body = blank_runs.replace_all(trimmed.trim(), "\n\n");

    format!("# {}\n\n{}\n", title.replace(['-', '_'], " "), body)
}
