//! Semantic index over a document tree
//!
//! Documents are split into overlapping chunks, embedded by an
//! [`EmbeddingProvider`], and kept in a [`VectorIndex`] persisted by a
//! [`VectorStore`]. [`IndexManager`] owns the build/load lifecycle,
//! [`RetrievalService`] answers queries and [`CrossLinker`] derives links
//! between published articles.

pub mod chunker;
pub mod crosslink;
pub mod embedding;
pub mod manager;
pub mod provider;
pub mod retrieval;
pub mod vectordb;

pub use chunker::{Chunk, ChunkParams};
pub use crosslink::{Article, CrossLinker, LinkPlan};
pub use embedding::HtpModel;
pub use manager::{IndexManager, IndexOrigin, IndexOutcome, IndexTarget, RebuildStats};
pub use provider::{select_provider, EmbeddingProvider, LocalProvider, RemoteProvider};
pub use retrieval::{format_context, RetrievalService, RetrievedChunk};
pub use vectordb::{IndexRecord, VectorIndex, VectorStore};
