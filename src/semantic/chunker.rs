//! Fixed-size character windows over extracted document text.
//!
//! Chunking is deliberately naive:
//! 1. Trim whitespace
//! 2. Normalize line endings to `\n`
//! 3. Slide a `size`-character window forward by `max(1, size - overlap)`
//!
//! Windows are counted in Unicode scalar values, never bytes, so a window
//! boundary can't split a UTF-8 sequence.

/// Default window size in characters
pub const DEFAULT_CHUNK_SIZE: usize = 800;

/// Default overlap between consecutive windows in characters
pub const DEFAULT_CHUNK_OVERLAP: usize = 120;

/// A window of a source document, ready to be embedded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    /// Base name of the file the chunk came from
    pub source: String,
    /// 0-based position of the chunk within its source
    pub position: usize,
}

/// Distance between the starts of two consecutive windows.
pub fn step(size: usize, overlap: usize) -> usize {
    size.saturating_sub(overlap).max(1)
}

/// Split `text` into overlapping windows of `size` characters.
///
/// Returns an empty vector when the text is empty after trimming.
/// An `overlap >= size` clamps the step to a single character.
pub fn chunk(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let normalized = normalize_line_endings(text.trim());
    if normalized.is_empty() {
        return vec![];
    }

    let size = size.max(1);
    let step = step(size, overlap);

    let chars: Vec<char> = normalized.chars().collect();
    let mut windows = Vec::with_capacity(chars.len().div_ceil(step));

    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        windows.push(chars[start..end].iter().collect());
        start += step;
    }

    windows
}

/// Chunk a whole document, tagging every window with its source and position.
pub fn chunk_document(text: &str, source: &str, size: usize, overlap: usize) -> Vec<Chunk> {
    chunk(text, size, overlap)
        .into_iter()
        .enumerate()
        .map(|(position, text)| Chunk {
            text,
            source: source.to_string(),
            position,
        })
        .collect()
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}
