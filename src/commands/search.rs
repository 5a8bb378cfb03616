//! Search command - Similarity search over the knowledge index

use anyhow::Result;
use colored::Colorize;

use super::{build_manager, knowledge_target};
use knowledge_index::core::config::Config;
use knowledge_index::search::{format_context, RetrievalService};

pub fn run(config: Config, query: &str, limit: Option<usize>, json: bool, context: bool) -> Result<()> {
    let limit = limit.unwrap_or(config.top_k);
    let manager = build_manager(&config)?;
    let service = RetrievalService::new(manager, knowledge_target(&config));
    let results = service.retrieve(query, limit, &[])?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if context {
        print!("{}", format_context(&results));
        return Ok(());
    }

    if results.is_empty() {
        println!("{} No results found for: {}", "→".dimmed(), query.cyan());
        return Ok(());
    }

    println!("{} {} results for: {}", "→".dimmed(), results.len(), query.cyan());
    println!();

    for (i, hit) in results.iter().enumerate() {
        let score_str = format!("{:.2}", hit.score);
        let score_colored = if hit.score > 0.8 {
            score_str.green()
        } else if hit.score > 0.6 {
            score_str.yellow()
        } else {
            score_str.dimmed()
        };

        println!("{}. [{}] {}", (i + 1).to_string().bold(), score_colored, hit.title.cyan());

        let flat = hit.text.split_whitespace().collect::<Vec<_>>().join(" ");
        let preview = if flat.chars().count() > 100 {
            format!("{}...", flat.chars().take(100).collect::<String>())
        } else {
            flat
        };
        println!("   {}", preview.dimmed());

        if hit.tags.is_empty() {
            println!("   {}", hit.source_path);
        } else {
            println!("   {} | {}", hit.source_path, hit.tags.join(", "));
        }
        println!();
    }

    Ok(())
}
