//! knowledge-index library
//!
//! Keeps a semantic index of a directory of documents current and answers
//! similarity queries against it.
//!
//! # Modules
//!
//! - `core`: configuration, documents, front matter and link scanning
//! - `search`: chunking, embeddings, the vector index and its consumers
//! - `watcher`: debounced rebuilds on file changes (feature `watch`)

pub mod core;
pub mod error;
pub mod search;
#[cfg(feature = "watch")]
pub mod watcher;

// Re-exports for convenience
pub use crate::core::config::Config;
pub use crate::core::document::{scan, Document, ScanOptions};
pub use crate::core::frontmatter::Frontmatter;
pub use search::{IndexManager, IndexTarget, RetrievalService};
