pub mod crosslink;
pub mod index;
pub mod search;
#[cfg(feature = "watch")]
pub mod watch;

use anyhow::{anyhow, Result};
use std::path::PathBuf;
use std::sync::Arc;

use knowledge_index::core::config::Config;
use knowledge_index::core::document::ScanOptions;
use knowledge_index::search::chunker::ChunkParams;
use knowledge_index::search::provider::select_provider;
use knowledge_index::search::{IndexManager, IndexTarget, VectorStore};

/// Overrides for the knowledge index taken from command-line flags
#[derive(Debug, Default)]
pub struct TargetArgs {
    pub dir: Option<PathBuf>,
    pub index: Option<String>,
    pub tags: Vec<String>,
}

impl TargetArgs {
    pub fn apply(self, config: &mut Config) {
        if let Some(dir) = self.dir {
            config.knowledge_dir = dir;
        }
        if let Some(index) = self.index {
            config.index_name = index;
        }
        if !self.tags.is_empty() {
            config.tag_filter = self.tags;
        }
    }
}

/// Manager over the configured provider and index directory
pub fn build_manager(config: &Config) -> Result<Arc<IndexManager>> {
    let provider = select_provider(&config.embedding)?;
    let chunking = ChunkParams::new(config.chunk_size, config.chunk_overlap)
        .ok_or_else(|| anyhow!("chunk_overlap must be smaller than chunk_size"))?;
    Ok(Arc::new(IndexManager::new(
        provider,
        VectorStore::new(&config.index_dir),
        chunking,
    )))
}

pub fn knowledge_target(config: &Config) -> IndexTarget {
    let scan = ScanOptions {
        extensions: config.extensions.clone(),
        ..ScanOptions::default()
    }
    .with_tags(config.tag_filter.clone());
    IndexTarget::new(&config.index_name, &config.knowledge_dir, scan)
}
