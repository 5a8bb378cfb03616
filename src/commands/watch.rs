//! Watch command - Keep the knowledge index current while files change

use anyhow::Result;
use colored::Colorize;
use std::time::Duration;

use super::{build_manager, knowledge_target, TargetArgs};
use knowledge_index::core::config::Config;
use knowledge_index::watcher::{self, WatchOptions};

pub fn run(mut config: Config, target_args: TargetArgs, cooldown: Option<u64>) -> Result<()> {
    target_args.apply(&mut config);
    if let Some(secs) = cooldown {
        config.cooldown_seconds = secs;
    }
    config.validate()?;

    let manager = build_manager(&config)?;
    let target = knowledge_target(&config);
    let options = WatchOptions {
        cooldown: config.cooldown(),
        tick: config.tick(),
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let handle = watcher::start(
        runtime.handle(),
        manager,
        target,
        vec![config.index_dir.clone()],
        options,
        config.force_rebuild,
    )?;

    println!(
        "{} Watching {} (cooldown {}s). Press Ctrl-C to stop.",
        "→".dimmed(),
        config.knowledge_dir.display().to_string().cyan(),
        config.cooldown_seconds
    );

    runtime.block_on(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
        }
        handle.shutdown().await;
    });
    runtime.shutdown_timeout(Duration::from_secs(1));

    println!("{} Stopped", "✓".green().bold());
    Ok(())
}
