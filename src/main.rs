mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::TargetArgs;
use knowledge_index::core::config::Config;

#[derive(Parser)]
#[command(name = "kindex")]
#[command(about = "Semantic index over a directory of documents", long_about = None)]
#[command(version)]
struct Cli {
    #[arg(long, global = true, help = "Configuration file (default: ./config.json)")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or load the knowledge index
    Index {
        #[arg(long, help = "Show index status only")]
        status: bool,
        #[arg(long, help = "Force rebuild index")]
        rebuild: bool,
        #[arg(long, help = "JSON output")]
        json: bool,
        #[arg(long, help = "Knowledge directory")]
        dir: Option<PathBuf>,
        #[arg(long, help = "Index name")]
        index: Option<String>,
        #[arg(long, num_args = 1.., help = "Only index markdown with one of these tags")]
        tags: Vec<String>,
    },
    /// Similarity search over the knowledge index
    Search {
        query: String,
        #[arg(long, short, help = "Limit results")]
        limit: Option<usize>,
        #[arg(long, help = "JSON output")]
        json: bool,
        #[arg(long, help = "Print results as a generation context")]
        context: bool,
    },
    /// Rebuild the index whenever the knowledge directory changes
    #[cfg(feature = "watch")]
    Watch {
        #[arg(long, help = "Knowledge directory")]
        dir: Option<PathBuf>,
        #[arg(long, help = "Index name")]
        index: Option<String>,
        #[arg(long, num_args = 1.., help = "Only index markdown with one of these tags")]
        tags: Vec<String>,
        #[arg(long, help = "Seconds without changes before rebuilding")]
        cooldown: Option<u64>,
    },
    /// Link published articles to related articles
    Crosslink {
        #[arg(long, short, help = "Directory of markdown articles")]
        dir: Option<PathBuf>,
        #[arg(long, short, help = "Maximum links per article")]
        max_links: Option<usize>,
        #[arg(long, help = "Force rebuild of the crosslink index")]
        rebuild_index: bool,
        #[arg(long, help = "Actually write links (default: dry-run)")]
        execute: bool,
        #[arg(long, help = "JSON output")]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Index {
            status,
            rebuild,
            json,
            dir,
            index,
            tags,
        } => commands::index::run(config, TargetArgs { dir, index, tags }, status, rebuild, json),
        Commands::Search {
            query,
            limit,
            json,
            context,
        } => commands::search::run(config, &query, limit, json, context),
        #[cfg(feature = "watch")]
        Commands::Watch {
            dir,
            index,
            tags,
            cooldown,
        } => commands::watch::run(config, TargetArgs { dir, index, tags }, cooldown),
        Commands::Crosslink {
            dir,
            max_links,
            rebuild_index,
            execute,
            json,
        } => commands::crosslink::run(config, dir, max_links, rebuild_index, !execute, json),
    }
}
