//! Vector index and its SQLite persistence
//!
//! An index is built in memory from a complete set of records and queried
//! with cosine similarity. Each named index is persisted as one SQLite file
//! `<dir>/<name>.db`. A save writes a fresh `<name>.db.tmp`, syncs it and
//! renames it over the live file, so a reader opening the live path sees
//! either the previous complete index or the new one.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::chunker::Chunk;
use crate::core::document::Document;
use crate::error::{BuildError, IndexError, StoreError};

const FORMAT_VERSION: u32 = 1;

/// Document metadata copied onto each record, plus the chunk position
#[derive(Debug, Clone, PartialEq)]
pub struct RecordMetadata {
    pub doc_id: String,
    pub source_path: String,
    pub filename: String,
    pub title: String,
    pub tags: Vec<String>,
    pub keywords: Vec<String>,
    pub published: bool,
    /// Unix seconds of the source file's mtime
    pub timestamp: i64,
    pub sequence: usize,
    pub start_offset: usize,
    pub end_offset: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub chunk_id: String,
    pub text: String,
    /// Empty means the record was never embedded
    pub vector: Vec<f32>,
    pub metadata: RecordMetadata,
}

impl IndexRecord {
    pub fn from_chunk(document: &Document, chunk: &Chunk, vector: Vec<f32>) -> Self {
        let meta = &document.metadata;
        Self {
            chunk_id: chunk.id(),
            text: chunk.text.clone(),
            vector,
            metadata: RecordMetadata {
                doc_id: document.id.clone(),
                source_path: meta.source_path.to_string_lossy().to_string(),
                filename: meta.filename.clone(),
                title: meta.title.clone(),
                tags: meta.tags.iter().cloned().collect(),
                keywords: meta.keywords.clone(),
                published: meta.published,
                timestamp: meta.timestamp.timestamp(),
                sequence: chunk.sequence,
                start_offset: chunk.start_offset,
                end_offset: chunk.end_offset,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub score: f32,
}

/// Immutable, fully built similarity index
#[derive(Debug, Clone)]
pub struct VectorIndex {
    provider_id: String,
    dimension: usize,
    records: Vec<IndexRecord>,
    norms: Vec<f32>,
    built_at: i64,
}

impl VectorIndex {
    /// Build an index over `records`, all of which must carry a finite
    /// vector of `dimension` components.
    pub fn build(
        provider_id: impl Into<String>,
        dimension: usize,
        records: Vec<IndexRecord>,
    ) -> Result<Self, BuildError> {
        let mut seen = HashSet::with_capacity(records.len());
        let mut norms = Vec::with_capacity(records.len());

        for record in &records {
            if record.vector.is_empty() {
                return Err(BuildError::MissingVector {
                    chunk_id: record.chunk_id.clone(),
                });
            }
            if record.vector.len() != dimension {
                return Err(BuildError::DimensionMismatch {
                    chunk_id: record.chunk_id.clone(),
                    expected: dimension,
                    got: record.vector.len(),
                });
            }
            if record.vector.iter().any(|x| !x.is_finite()) {
                return Err(BuildError::NonFinite {
                    chunk_id: record.chunk_id.clone(),
                });
            }
            if !seen.insert(record.chunk_id.as_str()) {
                return Err(BuildError::DuplicateChunkId(record.chunk_id.clone()));
            }
            norms.push(norm(&record.vector));
        }

        Ok(Self {
            provider_id: provider_id.into(),
            dimension,
            records,
            norms,
            built_at: chrono::Utc::now().timestamp(),
        })
    }

    /// Top `k` chunks by descending cosine similarity.
    ///
    /// Equal scores keep insertion order.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredChunk>, IndexError> {
        Ok(self
            .ranked(vector)?
            .into_iter()
            .take(k)
            .map(|(pos, score)| ScoredChunk {
                chunk_id: self.records[pos].chunk_id.clone(),
                score,
            })
            .collect())
    }

    /// Every record position with its score, best first
    pub(crate) fn ranked(&self, vector: &[f32]) -> Result<Vec<(usize, f32)>, IndexError> {
        if vector.len() != self.dimension {
            return Err(IndexError::QueryDimension {
                expected: self.dimension,
                got: vector.len(),
            });
        }
        let query_norm = norm(vector);

        let mut scored: Vec<(usize, f32)> = self
            .records
            .iter()
            .zip(&self.norms)
            .enumerate()
            .map(|(pos, (record, &record_norm))| {
                let score = if query_norm > 0.0 && record_norm > 0.0 {
                    dot(vector, &record.vector) / (query_norm * record_norm)
                } else {
                    0.0
                };
                (pos, score)
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(scored)
    }

    pub fn record_at(&self, pos: usize) -> Option<&IndexRecord> {
        self.records.get(pos)
    }

    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn built_at(&self) -> i64 {
        self.built_at
    }

    pub fn document_count(&self) -> usize {
        self.records
            .iter()
            .map(|r| r.metadata.doc_id.as_str())
            .collect::<BTreeSet<_>>()
            .len()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}

/// Directory of persisted indexes
#[derive(Debug, Clone)]
pub struct VectorStore {
    dir: PathBuf,
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl VectorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            #[cfg(test)]
            fail_after: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains(['/', '\\', '\0']);
        if !valid {
            return Err(StoreError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(format!("{}.db", name)))
    }

    /// Persist `index` under `name`, replacing any previous version whole
    pub fn save(&self, index: &VectorIndex, name: &str) -> Result<(), StoreError> {
        let live = self.path_for(name)?;
        let temp = temp_path(&live);
        fs::create_dir_all(&self.dir)?;

        if temp.exists() {
            warn!(path = %temp.display(), "removing leftover temporary index");
            fs::remove_file(&temp)?;
        }

        if let Err(e) = self.write_file(&temp, index) {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }

        fs::rename(&temp, &live)?;
        sync_dir(&self.dir);
        debug!(name, records = index.len(), path = %live.display(), "index saved");
        Ok(())
    }

    fn write_file(&self, path: &Path, index: &VectorIndex) -> Result<(), StoreError> {
        let mut conn = Connection::open(path)?;
        // The file is discarded on failure and synced explicitly once complete
        conn.pragma_update_and_check(None, "journal_mode", "OFF", |_| Ok(()))?;
        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.execute_batch(
            r#"
            CREATE TABLE records (
                position INTEGER PRIMARY KEY,
                chunk_id TEXT NOT NULL UNIQUE,
                doc_id TEXT NOT NULL,
                text TEXT NOT NULL,
                source_path TEXT NOT NULL,
                filename TEXT NOT NULL,
                title TEXT NOT NULL,
                tags TEXT NOT NULL,      -- JSON array
                keywords TEXT NOT NULL,  -- JSON array
                published INTEGER NOT NULL,
                mtime INTEGER NOT NULL,
                sequence INTEGER NOT NULL,
                start_offset INTEGER NOT NULL,
                end_offset INTEGER NOT NULL,
                embedding BLOB NOT NULL
            );

            CREATE TABLE index_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;

        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO records (position, chunk_id, doc_id, text, source_path, filename, title,
                                     tags, keywords, published, mtime, sequence, start_offset, end_offset, embedding)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
                "#,
            )?;
            for (pos, record) in index.records().iter().enumerate() {
                #[cfg(test)]
                if self.fail_after == Some(pos) {
                    return Err(StoreError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "simulated failure during save",
                    )));
                }
                let meta = &record.metadata;
                stmt.execute(params![
                    pos as i64,
                    record.chunk_id,
                    meta.doc_id,
                    record.text,
                    meta.source_path,
                    meta.filename,
                    meta.title,
                    to_json(&meta.tags),
                    to_json(&meta.keywords),
                    meta.published,
                    meta.timestamp,
                    meta.sequence as i64,
                    meta.start_offset as i64,
                    meta.end_offset as i64,
                    embedding_to_blob(&record.vector),
                ])?;
            }

            let mut meta = tx.prepare("INSERT INTO index_meta (key, value) VALUES (?1, ?2)")?;
            meta.execute(params!["format_version", FORMAT_VERSION.to_string()])?;
            meta.execute(params!["provider_id", index.provider_id()])?;
            meta.execute(params!["dimension", index.dimension().to_string()])?;
            meta.execute(params!["record_count", index.len().to_string()])?;
            meta.execute(params!["built_at", index.built_at().to_string()])?;
        }
        tx.commit()?;
        conn.close().map_err(|(_, e)| e)?;

        fs::File::open(path)?.sync_all()?;
        Ok(())
    }

    /// Load the complete index persisted under `name`
    pub fn load(&self, name: &str) -> Result<VectorIndex, StoreError> {
        let path = self.path_for(name)?;
        if !path.is_file() {
            return Err(StoreError::NotFound(name.to_string()));
        }

        let corrupt = |message: String| StoreError::Corrupt {
            name: name.to_string(),
            message,
        };
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;

        let meta = |key: &str| -> Result<String, StoreError> {
            conn.query_row(
                "SELECT value FROM index_meta WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| corrupt(e.to_string()))?
            .ok_or_else(|| corrupt(format!("missing metadata '{}'", key)))
        };
        let parse = |key: &str| -> Result<u64, StoreError> {
            meta(key)?
                .parse::<u64>()
                .map_err(|e| corrupt(format!("metadata '{}': {}", key, e)))
        };

        let version = parse("format_version")?;
        if version != u64::from(FORMAT_VERSION) {
            return Err(corrupt(format!("unsupported format version {}", version)));
        }
        let provider_id = meta("provider_id")?;
        let dimension = parse("dimension")? as usize;
        let record_count = parse("record_count")? as usize;
        let built_at = parse("built_at")? as i64;

        let mut stmt = conn
            .prepare(
                r#"
                SELECT chunk_id, doc_id, text, source_path, filename, title, tags, keywords,
                       published, mtime, sequence, start_offset, end_offset, embedding
                FROM records ORDER BY position
                "#,
            )
            .map_err(|e| corrupt(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| {
                let tags: String = row.get(6)?;
                let keywords: String = row.get(7)?;
                let blob: Vec<u8> = row.get(13)?;
                Ok(IndexRecord {
                    chunk_id: row.get(0)?,
                    text: row.get(2)?,
                    vector: blob_to_embedding(&blob),
                    metadata: RecordMetadata {
                        doc_id: row.get(1)?,
                        source_path: row.get(3)?,
                        filename: row.get(4)?,
                        title: row.get(5)?,
                        tags: json_column(6, &tags)?,
                        keywords: json_column(7, &keywords)?,
                        published: row.get(8)?,
                        timestamp: row.get(9)?,
                        sequence: row.get::<_, i64>(10)? as usize,
                        start_offset: row.get::<_, i64>(11)? as usize,
                        end_offset: row.get::<_, i64>(12)? as usize,
                    },
                })
            })
            .map_err(|e| corrupt(e.to_string()))?;

        let mut records = Vec::with_capacity(record_count);
        for row in rows {
            records.push(row.map_err(|e| corrupt(e.to_string()))?);
        }
        if records.len() != record_count {
            return Err(corrupt(format!(
                "{} records, metadata says {}",
                records.len(),
                record_count
            )));
        }

        let mut index =
            VectorIndex::build(provider_id, dimension, records).map_err(|e| corrupt(e.to_string()))?;
        index.built_at = built_at;
        Ok(index)
    }

    pub fn file_size(&self, name: &str) -> Option<u64> {
        let path = self.path_for(name).ok()?;
        fs::metadata(path).ok().map(|m| m.len())
    }
}

/// A JSON string-list column; a malformed value fails the row
fn json_column(idx: usize, raw: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn temp_path(live: &Path) -> PathBuf {
    let mut name = live.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(d) = fs::File::open(dir) {
        let _ = d.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

fn to_json(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        blob.extend_from_slice(&val.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
