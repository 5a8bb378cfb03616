use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use super::manager::{IndexManager, IndexTarget};
use super::vectordb::{IndexRecord, VectorIndex};
use crate::error::IndexError;

/// Characters of chunk text shown per block in a generation context
const CONTEXT_PREVIEW_CHARS: usize = 500;

#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub source_path: String,
    pub title: String,
    pub tags: Vec<String>,
    pub score: f32,
}

impl RetrievedChunk {
    fn new(record: &IndexRecord, score: f32) -> Self {
        Self {
            chunk_id: record.chunk_id.clone(),
            doc_id: record.metadata.doc_id.clone(),
            text: record.text.clone(),
            source_path: record.metadata.source_path.clone(),
            title: record.metadata.title.clone(),
            tags: record.metadata.tags.clone(),
            score,
        }
    }
}

/// Read-only queries against the active index of one target.
///
/// Queries run against whatever index is active when they start; a rebuild
/// in progress only becomes visible once it has been saved and swapped in.
pub struct RetrievalService {
    manager: Arc<IndexManager>,
    target: IndexTarget,
}

impl RetrievalService {
    pub fn new(manager: Arc<IndexManager>, target: IndexTarget) -> Self {
        Self { manager, target }
    }

    pub fn target(&self) -> &IndexTarget {
        &self.target
    }

    pub fn manager(&self) -> &Arc<IndexManager> {
        &self.manager
    }

    /// Top `k` chunks for `query`, skipping chunks of the documents in
    /// `exclude` before truncating.
    pub fn retrieve(
        &self,
        query: &str,
        k: usize,
        exclude: &[String],
    ) -> Result<Vec<RetrievedChunk>, IndexError> {
        self.ranked_hits(query, k, exclude, false)
    }

    /// Like [`retrieve`](Self::retrieve), but at most one chunk (the best)
    /// per document
    pub fn related_documents(
        &self,
        query: &str,
        k: usize,
        exclude: &[String],
    ) -> Result<Vec<RetrievedChunk>, IndexError> {
        self.ranked_hits(query, k, exclude, true)
    }

    fn ranked_hits(
        &self,
        query: &str,
        k: usize,
        exclude: &[String],
        per_document: bool,
    ) -> Result<Vec<RetrievedChunk>, IndexError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let index = self.manager.current(&self.target)?;
        let vector = self.manager.provider().embed(query)?;
        collect_hits(&index, &vector, k, exclude, per_document)
    }
}

fn collect_hits(
    index: &VectorIndex,
    vector: &[f32],
    k: usize,
    exclude: &[String],
    per_document: bool,
) -> Result<Vec<RetrievedChunk>, IndexError> {
    let excluded: HashSet<&str> = exclude.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let mut hits = Vec::with_capacity(k);

    for (pos, score) in index.ranked(vector)? {
        let Some(record) = index.record_at(pos) else {
            continue;
        };
        let doc_id = record.metadata.doc_id.as_str();
        if excluded.contains(doc_id) {
            continue;
        }
        if per_document && !seen.insert(doc_id) {
            continue;
        }
        hits.push(RetrievedChunk::new(record, score));
        if hits.len() == k {
            break;
        }
    }
    Ok(hits)
}

/// Numbered context blocks for a generation prompt
pub fn format_context(results: &[RetrievedChunk]) -> String {
    let mut out = String::new();
    for (i, hit) in results.iter().enumerate() {
        out.push_str(&format!("[{}] Source: {}\n", i + 1, hit.source_path));
        out.push_str(&format!("Title: {}\n", hit.title));
        if !hit.tags.is_empty() {
            out.push_str(&format!("Tags: {}\n", hit.tags.join(", ")));
        }
        out.push_str(&preview(&hit.text));
        out.push_str("\n\n");
    }
    out
}

fn preview(text: &str) -> String {
    if text.chars().count() <= CONTEXT_PREVIEW_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(CONTEXT_PREVIEW_CHARS).collect();
    format!("{}...", cut)
}
