//! Crosslink command - Add related-article links between published articles

use anyhow::{bail, Result};
use colored::Colorize;
use serde::Serialize;
use std::path::PathBuf;

use super::build_manager;
use knowledge_index::core::config::Config;
use knowledge_index::search::crosslink::{self, CrossLinker, LinkPlan};

#[derive(Serialize)]
struct CrossLinkResult<'a> {
    dry_run: bool,
    articles: usize,
    published: usize,
    already_linked: &'a [String],
    updated: usize,
    plans: &'a [LinkPlan],
}

pub fn run(
    config: Config,
    dir: Option<PathBuf>,
    max_links: Option<usize>,
    rebuild_index: bool,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let content_dir = dir.unwrap_or_else(|| config.content_dir.clone());
    let max_links = max_links.unwrap_or(config.max_links_per_document);

    let (mut articles, errors) = crosslink::load_articles(&content_dir);
    if !json {
        println!(
            "{} Found {} articles in {}",
            "→".dimmed(),
            articles.len(),
            content_dir.display()
        );
        for err in &errors {
            println!("  {} {}", "✗".red(), err);
        }
    }
    if !articles.iter().any(|a| a.published) {
        bail!(
            "no published articles in {}; articles need `Published: true` in their front matter",
            content_dir.display()
        );
    }

    let manager = build_manager(&config)?;
    let linker = CrossLinker::new(manager, &content_dir, &config.crosslink_index_name, max_links);
    linker.prepare_index(rebuild_index)?;

    let report = linker.plan(&mut articles)?;
    let updated = if dry_run {
        0
    } else {
        linker.apply(&report.plans, &articles)?
    };

    if json {
        let result = CrossLinkResult {
            dry_run,
            articles: articles.len(),
            published: report.published,
            already_linked: &report.already_linked,
            updated,
            plans: &report.plans,
        };
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!(
        "{} {} published, {} already linked",
        "→".dimmed(),
        report.published,
        report.already_linked.len()
    );
    println!();
    for plan in &report.plans {
        println!("{}", plan.doc_id.cyan());
        for link in &plan.links {
            println!("  {} {} ({:.2})", "+".green(), link.title, link.score);
        }
    }

    println!();
    if dry_run {
        println!(
            "{} {} articles would be updated. Run with {} to write.",
            "→".dimmed(),
            report.plans.len(),
            "--execute".cyan()
        );
    } else {
        println!("{} Updated {} articles with crosslinks", "✓".green().bold(), updated);
    }

    Ok(())
}
