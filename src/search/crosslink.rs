//! Cross-links between published markdown articles.
//!
//! Every published article without outbound links gets up to `max_links`
//! links to its most similar published articles, written as a
//! `## Related Articles` section of wikilinks. Articles that already link
//! somewhere are left alone, which also keeps repeated runs from piling up
//! links.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::manager::{IndexManager, IndexOutcome, IndexTarget};
use super::retrieval::RetrievalService;
use crate::core::document::{self, Document, ScanOptions};
use crate::core::links;
use crate::error::{FileReadError, IndexError};

const RELATED_HEADING: &str = "## Related Articles";

lazy_static! {
    static ref RELATED_SECTION_RE: Regex = Regex::new(r"(?m)^## Related Articles[ \t]*\r?$").unwrap();
    static ref NEXT_HEADING_RE: Regex = Regex::new(r"\n##").unwrap();
}

#[derive(Debug, Clone)]
pub struct Article {
    pub id: String,
    pub path: PathBuf,
    pub filename: String,
    pub title: String,
    pub content: String,
    pub published: bool,
    /// File names this article links to
    pub outgoing_links: BTreeSet<String>,
}

impl Article {
    fn from_document(doc: Document) -> Self {
        let outgoing_links = links::detect_outbound_links(&doc.content);
        Self {
            id: doc.id,
            path: doc.path,
            filename: doc.metadata.filename,
            title: doc.metadata.title,
            published: doc.metadata.published,
            content: doc.content,
            outgoing_links,
        }
    }

    pub fn body(&self) -> &str {
        crate::core::frontmatter::strip(&self.content)
    }
}

/// Every markdown article under `dir`, published or not
pub fn load_articles(dir: &Path) -> (Vec<Article>, Vec<FileReadError>) {
    let options = ScanOptions {
        extensions: vec!["md".to_string()],
        ..ScanOptions::default()
    };
    let report = document::scan(dir, &options);
    let articles = report.documents.into_iter().map(Article::from_document).collect();
    (articles, report.errors)
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkTarget {
    pub doc_id: String,
    pub filename: String,
    pub title: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkPlan {
    pub doc_id: String,
    pub path: PathBuf,
    pub links: Vec<LinkTarget>,
}

#[derive(Debug, Default, Serialize)]
pub struct CrossLinkReport {
    pub published: usize,
    /// Published articles skipped because they already link somewhere
    pub already_linked: Vec<String>,
    pub plans: Vec<LinkPlan>,
}

pub struct CrossLinker {
    retrieval: RetrievalService,
    max_links: usize,
}

impl CrossLinker {
    pub fn new(
        manager: Arc<IndexManager>,
        content_dir: impl Into<PathBuf>,
        index_name: impl Into<String>,
        max_links: usize,
    ) -> Self {
        let target = IndexTarget::new(index_name, content_dir, ScanOptions::published_markdown());
        Self {
            retrieval: RetrievalService::new(manager, target),
            max_links,
        }
    }

    /// Load or build the index over published articles
    pub fn prepare_index(&self, force_rebuild: bool) -> Result<IndexOutcome, IndexError> {
        self.retrieval
            .manager()
            .create_or_load(self.retrieval.target(), force_rebuild)
    }

    /// Pick link targets for every published, not yet linked article.
    ///
    /// Chosen targets are added to each article's `outgoing_links`.
    pub fn plan(&self, articles: &mut [Article]) -> Result<CrossLinkReport, IndexError> {
        let mut report = CrossLinkReport::default();

        for article in articles.iter_mut().filter(|a| a.published) {
            report.published += 1;
            if !article.outgoing_links.is_empty() {
                debug!(article = %article.id, "already has links, skipping");
                report.already_linked.push(article.id.clone());
                continue;
            }
            if self.max_links == 0 {
                continue;
            }

            let exclude = [article.id.clone()];
            let hits = self
                .retrieval
                .related_documents(article.body(), self.max_links + 1, &exclude)?;

            let mut links = Vec::new();
            for hit in hits {
                let filename = file_name(&hit.source_path);
                if hit.doc_id == article.id || !article.outgoing_links.insert(filename.clone()) {
                    continue;
                }
                links.push(LinkTarget {
                    doc_id: hit.doc_id,
                    filename,
                    title: hit.title,
                    score: hit.score,
                });
                if links.len() == self.max_links {
                    break;
                }
            }

            if !links.is_empty() {
                report.plans.push(LinkPlan {
                    doc_id: article.id.clone(),
                    path: article.path.clone(),
                    links,
                });
            }
        }
        Ok(report)
    }

    /// Write planned links into the article files, returning how many were updated
    pub fn apply(&self, plans: &[LinkPlan], articles: &[Article]) -> io::Result<usize> {
        let mut updated = 0;
        for plan in plans {
            let Some(article) = articles.iter().find(|a| a.id == plan.doc_id) else {
                continue;
            };
            let content = update_content_with_links(&article.content, &plan.links);
            write_atomic(&article.path, &content)?;
            info!(article = %article.id, links = plan.links.len(), "added related links");
            updated += 1;
        }
        Ok(updated)
    }
}

/// `content` with its related-articles section set to `links`.
///
/// An existing section is replaced up to the next `##` heading; otherwise the
/// section is appended.
pub fn update_content_with_links(content: &str, links: &[LinkTarget]) -> String {
    if links.is_empty() {
        return content.to_string();
    }

    let mut section = format!("{}\n\n", RELATED_HEADING);
    for link in links {
        let stem = link.filename.strip_suffix(".md").unwrap_or(&link.filename);
        section.push_str(&format!("* [[{}|{}]]\n", stem, link.title));
    }

    match RELATED_SECTION_RE.find(content) {
        Some(found) => {
            let rest = &content[found.end()..];
            let end = NEXT_HEADING_RE
                .find(rest)
                .map(|m| found.end() + m.start())
                .unwrap_or(content.len());
            let mut out = String::with_capacity(content.len() + section.len());
            out.push_str(&content[..found.start()]);
            out.push_str(&section);
            out.push_str(&content[end..]);
            out
        }
        None => format!("{}\n\n{}", content.trim_end(), section),
    }
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

/// Temp file in the same directory, fsync, then rename
fn write_atomic(path: &Path, content: &str) -> io::Result<()> {
    let temp_path = path.with_extension("md.tmp");
    let result = (|| {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }
    fs::rename(&temp_path, path)
}
