//! Index command - Build or inspect the knowledge index

use anyhow::Result;
use colored::Colorize;

use super::{build_manager, knowledge_target, TargetArgs};
use knowledge_index::core::config::Config;
use knowledge_index::search::IndexOrigin;

pub fn run(mut config: Config, target_args: TargetArgs, status_only: bool, rebuild: bool, json: bool) -> Result<()> {
    target_args.apply(&mut config);
    config.validate()?;
    let manager = build_manager(&config)?;

    if status_only {
        return show_status(&manager, &config.index_name, json);
    }

    let target = knowledge_target(&config);
    if !json {
        println!(
            "{} Indexing {} into {}...",
            "→".dimmed(),
            config.knowledge_dir.display(),
            config.index_name.cyan()
        );
    }

    let outcome = manager.create_or_load(&target, rebuild || config.force_rebuild)?;
    let path = manager.store().path_for(&config.index_name)?;

    if json {
        let (action, stats) = match &outcome.origin {
            IndexOrigin::Loaded => ("loaded", None),
            IndexOrigin::Rebuilt(stats) => ("rebuilt", Some(stats)),
            IndexOrigin::Coalesced => ("coalesced", None),
        };
        println!(
            "{}",
            serde_json::json!({
                "action": action,
                "index": config.index_name,
                "records": outcome.index.len(),
                "documents": outcome.index.document_count(),
                "skipped_files": stats.map(|s| s.skipped_files),
                "duration_ms": stats.map(|s| s.duration_ms as u64),
                "path": path.display().to_string(),
            })
        );
        return Ok(());
    }

    println!();
    match &outcome.origin {
        IndexOrigin::Rebuilt(stats) => {
            println!(
                "{} Indexed {} documents ({} chunks) in {:.2}s",
                "✓".green().bold(),
                stats.documents.to_string().cyan(),
                stats.chunks,
                stats.duration_ms as f64 / 1000.0
            );
            if stats.skipped_files > 0 {
                println!("  {} {} files skipped (see log)", "✗".red(), stats.skipped_files);
            }
        }
        _ => {
            println!(
                "{} Loaded existing index with {} chunks ({} to rebuild)",
                "✓".green().bold(),
                outcome.index.len().to_string().cyan(),
                "--rebuild".cyan()
            );
        }
    }
    println!("  {} Index saved at: {}", "→".dimmed(), path.display());

    Ok(())
}

fn show_status(manager: &knowledge_index::IndexManager, name: &str, json: bool) -> Result<()> {
    let Some(status) = manager.status(name)? else {
        if json {
            println!(
                "{}",
                serde_json::json!({
                    "exists": false,
                    "index": name,
                })
            );
        } else {
            println!(
                "{} Index {} not found. Run {} first.",
                "!".yellow().bold(),
                name.cyan(),
                "kindex index".cyan()
            );
        }
        return Ok(());
    };

    let built = chrono::DateTime::from_timestamp(status.built_at, 0)
        .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "Unknown".to_string());

    if json {
        println!(
            "{}",
            serde_json::json!({
                "exists": true,
                "index": status.name,
                "path": status.path.display().to_string(),
                "records": status.records,
                "documents": status.documents,
                "dimension": status.dimension,
                "provider": status.provider_id,
                "built_at": built,
                "file_size_bytes": status.file_size,
            })
        );
    } else {
        println!("{}", "Index Status".bold());
        println!();
        println!("  {} {} documents indexed", "→".dimmed(), status.documents.to_string().cyan());
        println!("  {} {} chunks", "→".dimmed(), status.records.to_string().cyan());
        println!("  {} Provider: {} ({} dims)", "→".dimmed(), status.provider_id, status.dimension);
        println!("  {} Size: {:.2} KB", "→".dimmed(), status.file_size as f64 / 1024.0);
        println!("  {} Built: {}", "→".dimmed(), built);
    }

    Ok(())
}
