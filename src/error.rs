//! Error kinds for scanning, embedding, building, persisting and watching.
//!
//! Per-file errors never escalate past the scan. Per-rebuild errors never
//! touch the previously persisted index. Config and watch setup errors are
//! fatal at startup.

use std::path::PathBuf;

/// A single file could not be read or its front matter could not be parsed.
#[derive(Debug, thiserror::Error)]
pub enum FileReadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid front matter in {path}: {message}")]
    FrontMatter { path: PathBuf, message: String },

    #[error("failed to walk {path}: {message}")]
    Walk { path: PathBuf, message: String },
}

impl FileReadError {
    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::Io { path, .. } | Self::FrontMatter { path, .. } | Self::Walk { path, .. } => path,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("missing credential: {0}")]
    MissingCredential(String),

    #[error("invalid config value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Embedding call failed. Aborts the current rebuild only.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("embedding request failed: {0}")]
    Network(String),

    #[error("embedding request timed out after {0}s")]
    Timeout(u64),

    #[error("embedding provider rejected credentials ({status}): {body}")]
    Auth { status: u16, body: String },

    #[error("embedding provider rate limited the request: {0}")]
    RateLimited(String),

    #[error("embedding provider returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed embedding response: {0}")]
    Malformed(String),
}

/// Records handed to the index builder were not a consistent set.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum BuildError {
    #[error("record {chunk_id} has no vector")]
    MissingVector { chunk_id: String },

    #[error("record {chunk_id} has dimension {got}, expected {expected}")]
    DimensionMismatch {
        chunk_id: String,
        expected: usize,
        got: usize,
    },

    #[error("record {chunk_id} contains a non-finite component")]
    NonFinite { chunk_id: String },

    #[error("duplicate chunk id {0}")]
    DuplicateChunkId(String),

    #[error("{records} records for {chunks} chunks")]
    CountMismatch { records: usize, chunks: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("index '{0}' not found")]
    NotFound(String),

    #[error("invalid index name '{0}'")]
    InvalidName(String),

    #[error("index '{name}' was built with {stored}, current provider is {current}")]
    ProviderMismatch {
        name: String,
        stored: String,
        current: String,
    },

    #[error("index '{name}' is corrupt: {message}")]
    Corrupt { name: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    /// Errors after which the only sensible action is a full rebuild.
    pub fn requires_rebuild(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::ProviderMismatch { .. } | Self::Corrupt { .. } | Self::Sqlite(_)
        )
    }
}

/// Failure of a rebuild or a query against an index.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("source directory {0} does not exist")]
    MissingSource(PathBuf),

    #[error("query vector has dimension {got}, index expects {expected}")]
    QueryDimension { expected: usize, got: usize },

    /// The rebuild this request was coalesced into failed.
    #[error("coalesced rebuild of '{name}' failed: {message}")]
    Coalesced { name: String, message: String },
}

#[cfg(feature = "watch")]
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("failed to watch {path}: {source}")]
    Setup {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
