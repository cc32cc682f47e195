use std::path::PathBuf;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use ragd::commands::{analyze_log, ingest, serve, show_config};

#[derive(Parser)]
#[command(name = "ragd")]
#[command(about = "A local retrieval-augmented generation service with multi-knowledge-base management")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml, the metadata store, and logs
    #[arg(long, default_value = ".", global = true)]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Serve,
    /// Ingest local files into a knowledge base
    Ingest {
        /// Target knowledge base id
        kb_id: String,
        /// Files to ingest
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Drop and rebuild the collection before ingesting
        #[arg(long)]
        force: bool,
    },
    /// Analyze the flow log
    AnalyzeLog {
        /// Restrict to one session
        #[arg(long)]
        session: Option<Uuid>,
        /// Report operations slower than this many seconds
        #[arg(long, default_value_t = 5.0)]
        slow_threshold: f64,
        /// Export all events instead of printing a summary (json or csv)
        #[arg(long)]
        export: Option<String>,
        /// Write the export here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show the effective configuration
    Config {
        /// Print the resolved configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve => {
            serve(cli.config_dir).await?;
        }
        Commands::Ingest { kb_id, paths, force } => {
            ingest(cli.config_dir, kb_id, paths, force).await?;
        }
        Commands::AnalyzeLog {
            session,
            slow_threshold,
            export,
            output,
        } => {
            analyze_log(cli.config_dir, session, slow_threshold, export, output)?;
        }
        Commands::Config { show } => {
            if show {
                show_config(cli.config_dir)?;
            } else {
                println!("Edit config.toml in the config directory; use --show to print the effective configuration.");
            }
        }
    }

    Ok(())
}
