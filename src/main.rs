//! codeprint CLI entry point

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

#[derive(Parser)]
#[command(name = "codeprint")]
#[command(about = "Structural fingerprints for Python functions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Repository root path (defaults to current directory)
    #[arg(short, long, default_value = ".", global = true)]
    root: PathBuf,

    /// Config file (defaults to <root>/codeprint.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the fingerprint of each target (`module.function` or a unique function name)
    Hash {
        #[arg(required = true)]
        targets: Vec<String>,
    },
    /// Show a fingerprint and the dependencies it was built from
    Explain {
        target: String,

        /// How many dependency levels to expand
        #[arg(short, long, default_value = "1")]
        depth: usize,
    },
    /// Fingerprint every function in the repository
    Units {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Show version
    Version,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(format!(
            "codeprint={0},codeprint_core={0},codeprint_indexer={0}",
            log_level
        )))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!("Loaded environment from {}", path.display());
    }

    tracing::debug!("codeprint v{}", env!("CARGO_PKG_VERSION"));
    tracing::debug!("Repository root: {}", cli.root.display());

    match cli.command {
        Commands::Hash { targets } => {
            let session = commands::Session::load(&cli.root, cli.config.as_deref())?;
            commands::hash(&session, &targets)
        }
        Commands::Explain { target, depth } => {
            let session = commands::Session::load(&cli.root, cli.config.as_deref())?;
            commands::explain(&session, &target, depth)
        }
        Commands::Units { json } => {
            let session = commands::Session::load(&cli.root, cli.config.as_deref())?;
            commands::units(&session, json)
        }
        Commands::Version => {
            println!("codeprint v{} (format {})", env!("CARGO_PKG_VERSION"), codeprint_core::FORMAT_VERSION);
            Ok(())
        }
    }
}
