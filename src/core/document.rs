use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::config::DEFAULT_EXTENSIONS;
use super::frontmatter::{self, Frontmatter};
use crate::error::FileReadError;

lazy_static! {
    static ref H1_RE: Regex = Regex::new(r"(?m)^# (.+)$").unwrap();
}

const MARKDOWN_EXTENSIONS: &[&str] = &["md", "markdown"];

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentMetadata {
    pub source_path: PathBuf,
    pub filename: String,
    pub title: String,
    pub tags: BTreeSet<String>,
    pub keywords: Vec<String>,
    pub published: bool,
    pub timestamp: DateTime<Local>,
}

/// A source file as seen by one scan. Never persisted directly.
#[derive(Debug, Clone)]
pub struct Document {
    /// Path relative to the scan root, `/`-separated
    pub id: String,
    pub path: PathBuf,
    pub content: String,
    pub metadata: DocumentMetadata,
}

impl Document {
    /// Content without front matter
    pub fn body(&self) -> &str {
        if self.is_markdown() {
            frontmatter::strip(&self.content)
        } else {
            &self.content
        }
    }

    pub fn is_markdown(&self) -> bool {
        is_markdown(&self.path)
    }

    /// Text that gets chunked and embedded under `options`
    pub fn indexed_text(&self, options: &ScanOptions) -> &str {
        if options.body_only {
            self.body()
        } else {
            &self.content
        }
    }
}

/// What a scan includes.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Lowercase extensions without the leading dot
    pub extensions: Vec<String>,
    /// Markdown files must share one of these tags; other files are unaffected
    pub tag_filter: Vec<String>,
    /// Only markdown files with `Published: true`
    pub published_only: bool,
    /// Index markdown bodies without their front matter
    pub body_only: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            tag_filter: Vec::new(),
            published_only: false,
            body_only: false,
        }
    }
}

impl ScanOptions {
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tag_filter = tags;
        self
    }

    pub fn published_markdown() -> Self {
        Self {
            extensions: vec!["md".to_string()],
            tag_filter: Vec::new(),
            published_only: true,
            body_only: true,
        }
    }

    pub fn is_relevant(&self, path: &Path) -> bool {
        extension_of(path)
            .map(|ext| self.extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)))
            .unwrap_or(false)
    }

    fn filters_front_matter(&self) -> bool {
        !self.tag_filter.is_empty() || self.published_only
    }
}

/// Documents of one scan plus the files that had to be skipped
#[derive(Debug, Default)]
pub struct ScanReport {
    pub documents: Vec<Document>,
    pub errors: Vec<FileReadError>,
}

/// Recursively scan `root` for documents.
///
/// A file that cannot be read, or whose front matter cannot be parsed while a
/// front-matter filter is active, is recorded in `errors` and skipped. The
/// scan itself never fails on account of a single file. Documents are sorted
/// by id.
pub fn scan(root: &Path, options: &ScanOptions) -> ScanReport {
    let mut report = ScanReport::default();

    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                warn!(path = %path.display(), error = %e, "skipping unreadable entry");
                report.errors.push(FileReadError::Walk {
                    path,
                    message: e.to_string(),
                });
                continue;
            }
        };
        if !entry.file_type().is_file() || !options.is_relevant(entry.path()) {
            continue;
        }

        match load_document(root, entry.path(), options) {
            Ok(Some(doc)) => report.documents.push(doc),
            Ok(None) => debug!(path = %entry.path().display(), "filtered out"),
            Err(e) => {
                warn!(error = %e, "skipping file");
                report.errors.push(e);
            }
        }
    }

    report.documents.sort_by(|a, b| a.id.cmp(&b.id));
    report
}

/// Load one file, `Ok(None)` if the filters exclude it
fn load_document(
    root: &Path,
    path: &Path,
    options: &ScanOptions,
) -> Result<Option<Document>, FileReadError> {
    let io_err = |source| FileReadError::Io {
        path: path.to_path_buf(),
        source,
    };
    let bytes = fs::read(path).map_err(io_err)?;
    let metadata = fs::metadata(path).map_err(io_err)?;
    let content = String::from_utf8_lossy(&bytes).into_owned();

    let markdown = is_markdown(path);
    let frontmatter = if markdown {
        match Frontmatter::parse(&content) {
            Ok(fm) => fm,
            Err(e) if options.filters_front_matter() => {
                return Err(FileReadError::FrontMatter {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                });
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring invalid front matter");
                None
            }
        }
    } else {
        None
    };

    if markdown && options.filters_front_matter() {
        let Some(fm) = frontmatter.as_ref() else {
            return Ok(None);
        };
        if !options.tag_filter.is_empty() && !fm.has_any_tag(&options.tag_filter) {
            return Ok(None);
        }
        if options.published_only && !fm.published {
            return Ok(None);
        }
    } else if options.published_only {
        return Ok(None);
    }

    let fm = frontmatter.unwrap_or_default();
    let filename = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_string();
    let title = fm
        .title
        .clone()
        .or_else(|| markdown.then(|| first_heading(&content)).flatten())
        .unwrap_or_else(|| title_from_filename(path));
    let modified = metadata.modified().map_err(io_err)?;

    Ok(Some(Document {
        id: relative_id(root, path),
        path: path.to_path_buf(),
        content,
        metadata: DocumentMetadata {
            source_path: path.to_path_buf(),
            filename,
            title,
            tags: fm.tags.into_iter().collect(),
            keywords: fm.keywords,
            published: fm.published,
            timestamp: DateTime::from(modified),
        },
    }))
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

pub fn is_markdown(path: &Path) -> bool {
    extension_of(path)
        .map(|ext| MARKDOWN_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn relative_id(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn first_heading(content: &str) -> Option<String> {
    H1_RE
        .captures(frontmatter::strip(content))
        .map(|c| c[1].trim().to_string())
        .filter(|t| !t.is_empty())
}

/// `gpu_memory-tips.md` -> `Gpu Memory Tips`
fn title_from_filename(path: &Path) -> String {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    stem.split(['_', '-', ' '])
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}
