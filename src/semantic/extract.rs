//! Text extraction for uploaded documents.
//!
//! Extraction never fails loudly: a document that can't be read yields an
//! empty string and contributes no chunks.

use std::io::Write;
use std::path::Path;
use std::process::Command;

/// Page separator emitted by `pdftotext`
const PAGE_BREAK: char = '\u{c}';

/// A raw document as handed over by a caller.
#[derive(Debug, Clone)]
pub struct Document {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Document {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }

    /// File name without any directory components.
    pub fn source(&self) -> String {
        Path::new(&self.filename)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.filename)
            .to_string()
    }

    fn extension(&self) -> String {
        Path::new(&self.filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
            .unwrap_or_default()
    }
}

/// Extract plain text from a document based on its extension.
pub fn extract_text(doc: &Document) -> String {
    match doc.extension().as_str() {
        "txt" | "md" | "markdown" => utf8_ignoring_errors(&doc.bytes),
        "pdf" => match extract_pdf(&doc.bytes) {
            Ok(text) => text,
            Err(err) => {
                log::warn!("pdf extraction failed for {}: {err}", doc.filename);
                String::new()
            }
        },
        _ => match std::str::from_utf8(&doc.bytes) {
            Ok(text) => text.to_string(),
            Err(_) => {
                log::warn!("{} is not valid utf-8, skipping", doc.filename);
                String::new()
            }
        },
    }
}

/// Decode UTF-8, silently dropping invalid byte sequences.
fn utf8_ignoring_errors(bytes: &[u8]) -> String {
    bytes.utf8_chunks().map(|chunk| chunk.valid()).collect()
}

/// Extract text page by page with poppler's `pdftotext`.
fn extract_pdf(bytes: &[u8]) -> std::io::Result<String> {
    let mut file = tempfile::Builder::new().suffix(".pdf").tempfile()?;
    file.write_all(bytes)?;
    file.flush()?;

    let output = Command::new("pdftotext")
        .arg("-enc")
        .arg("UTF-8")
        .arg(file.path())
        .arg("-")
        .output()?;

    if !output.status.success() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!(
                "pdftotext exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }

    let text = utf8_ignoring_errors(&output.stdout);
    let pages: Vec<&str> = text
        .trim_end_matches(PAGE_BREAK)
        .split(PAGE_BREAK)
        .collect();

    log::debug!("pdftotext extracted {} pages", pages.len());

    Ok(pages.join("\n"))
}
