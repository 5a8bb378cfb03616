//! Fixed-size overlapping chunks.
//!
//! Sizes and offsets are counted in characters. Chunk `i` starts at
//! `i * (size - overlap)`; consecutive chunks share exactly `overlap`
//! characters, so dropping the first `overlap` characters of every chunk
//! after the first reconstructs the input.

use crate::core::document::Document;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub parent_doc_id: String,
    pub sequence: usize,
    pub text: String,
    /// Character offset of the first character
    pub start_offset: usize,
    /// Character offset one past the last character
    pub end_offset: usize,
}

impl Chunk {
    pub fn id(&self) -> String {
        format!("{}#{}", self.parent_doc_id, self.sequence)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub size: usize,
    pub overlap: usize,
}

impl ChunkParams {
    /// `None` unless `0 <= overlap < size`
    pub fn new(size: usize, overlap: usize) -> Option<Self> {
        (size > 0 && overlap < size).then_some(Self { size, overlap })
    }

    fn step(&self) -> usize {
        self.size - self.overlap
    }
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            size: 1000,
            overlap: 100,
        }
    }
}

pub fn split(document: &Document, params: ChunkParams) -> Vec<Chunk> {
    split_text(&document.id, &document.content, params)
}

pub fn split_text(doc_id: &str, content: &str, params: ChunkParams) -> Vec<Chunk> {
    // Byte offset of every char boundary, plus the end
    let boundaries: Vec<usize> = content
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(content.len()))
        .collect();
    let char_count = boundaries.len() - 1;

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < char_count {
        let end = (start + params.size).min(char_count);
        chunks.push(Chunk {
            parent_doc_id: doc_id.to_string(),
            sequence: chunks.len(),
            text: content[boundaries[start]..boundaries[end]].to_string(),
            start_offset: start,
            end_offset: end,
        });
        if end == char_count {
            break;
        }
        start += params.step();
    }
    chunks
}

/// Inverse of [`split_text`] for chunks of one document in sequence order
pub fn reconstruct(chunks: &[Chunk], overlap: usize) -> String {
    let mut out = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        if i == 0 {
            out.push_str(&chunk.text);
        } else {
            out.extend(chunk.text.chars().skip(overlap));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(size: usize, overlap: usize) -> ChunkParams {
        ChunkParams::new(size, overlap).unwrap()
    }

    #[test]
    fn test_rejects_overlap_not_below_size() {
        assert!(ChunkParams::new(10, 10).is_none());
        assert!(ChunkParams::new(0, 0).is_none());
        assert!(ChunkParams::new(10, 9).is_some());
    }

    #[test]
    fn test_offsets_and_overlap() {
        let chunks = split_text("doc", "abcdefghij", params(4, 1));
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "defg", "ghij"]);
        assert_eq!(chunks[1].start_offset, 3);
        assert_eq!(chunks[2].end_offset, 10);
        assert_eq!(chunks[2].id(), "doc#2");
    }

    #[test]
    fn test_short_and_empty_content() {
        assert!(split_text("doc", "", params(10, 2)).is_empty());
        let chunks = split_text("doc", "short", params(10, 2));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "short");
    }

    #[test]
    fn test_deterministic() {
        let text = "The quick brown fox jumps over the lazy dog. ".repeat(40);
        let a = split_text("doc", &text, params(100, 10));
        let b = split_text("doc", &text, params(100, 10));
        assert_eq!(a, b);
    }

    #[test]
    fn test_reconstruct_round_trip() {
        let samples = [
            "x".to_string(),
            "abcdefghij".to_string(),
            "한국어 텍스트와 English mixed, with ünïcödé ".repeat(17),
            "line\n".repeat(333),
        ];
        for text in &samples {
            for (size, overlap) in [(1, 0), (4, 1), (7, 6), (50, 10), (1000, 100)] {
                let chunks = split_text("doc", text, params(size, overlap));
                assert_eq!(&reconstruct(&chunks, overlap), text, "size={size} overlap={overlap}");
                assert!(chunks.iter().all(|c| c.text.chars().count() <= size));
            }
        }
    }

    #[test]
    fn test_sequence_is_contiguous() {
        let chunks = split_text("doc", &"a".repeat(2500), ChunkParams::default());
        let seqs: Vec<usize> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }
}
