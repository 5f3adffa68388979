//! Fixed-window text chunker.
//!
//! Splits a note body into [`Chunk`]s of at most `size` characters with an
//! optional overlap between consecutive windows. Windows are measured in
//! Unicode scalar values so a multi-byte character is never cut in half.
//!
//! Each chunk carries a SHA-256 hash of its text, which the index builder
//! uses to decide whether a cached embedding can be reused.

use sha2::{Digest, Sha256};

use crate::config::{Granularity, IndexConfig};

/// A slice of a note body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub hash: String,
}

/// Split text into windows of `size` chars, each starting `size - overlap`
/// chars after the previous one. Empty text yields no chunks.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<Chunk> {
    if text.is_empty() || size == 0 {
        return Vec::new();
    }
    let step = size.saturating_sub(overlap).max(1);

    // Byte offset of every char boundary, plus the end of the string.
    let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    bounds.push(text.len());
    let char_count = bounds.len() - 1;

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < char_count {
        let end = (start + size).min(char_count);
        let piece = &text[bounds[start]..bounds[end]];
        chunks.push(make_chunk(chunks.len(), piece));
        if end == char_count {
            break;
        }
        start += step;
    }

    chunks
}

/// Chunk a note body according to the index granularity.
pub fn chunk_body(body: &str, config: &IndexConfig) -> Vec<Chunk> {
    match config.granularity {
        Granularity::File => {
            if body.is_empty() {
                Vec::new()
            } else {
                vec![make_chunk(0, body)]
            }
        }
        Granularity::Chunk => chunk_text(body, config.chunk_size, config.chunk_overlap),
    }
}

/// Lowercase hex SHA-256 of a string.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(index: usize, text: &str) -> Chunk {
    Chunk {
        index,
        text: text.to_string(),
        hash: hash_text(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 500, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_text("", 500, 0).is_empty());
    }

    #[test]
    fn test_exact_windows_without_overlap() {
        let chunks = chunk_text("abcdefghij", 4, 0);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "efgh", "ij"]);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }

    #[test]
    fn test_overlap_repeats_tail() {
        let chunks = chunk_text("abcdefghij", 4, 2);
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "cdef", "efgh", "ghij"]);
    }

    #[test]
    fn test_multibyte_chars_not_split() {
        let text = "ééééé";
        let chunks = chunk_text(text, 2, 0);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "éé");
        assert_eq!(chunks[2].text, "é");
    }

    #[test]
    fn test_deterministic_hashes() {
        let a = chunk_text("Alpha Beta Gamma Delta", 5, 0);
        let b = chunk_text("Alpha Beta Gamma Delta", 5, 0);
        assert_eq!(a, b);
        assert_eq!(a[0].hash, hash_text("Alpha"));
    }

    #[test]
    fn test_file_granularity_single_chunk() {
        let cfg = IndexConfig {
            granularity: Granularity::File,
            chunk_size: 3,
            ..IndexConfig::default()
        };
        let chunks = chunk_body("a long body of text", &cfg);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "a long body of text");
    }

    #[test]
    fn test_sha256_hex_digest() {
        assert_eq!(
            hash_text("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
