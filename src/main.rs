//! # Clinical Parse CLI (`cparse`)
//!
//! ## Usage
//!
//! ```bash
//! cparse --config ./config/cparse.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cparse init` | Create the SQLite database and run schema migrations |
//! | `cparse add <path> --patient <id>` | Register an uploaded file as a document |
//! | `cparse documents` | List documents |
//! | `cparse parse <id>` | Parse a document and follow the job to completion |
//! | `cparse status <id>` | Document status and latest parse job |
//! | `cparse result <id>` | Normalized chunks and blocks as JSON |
//! | `cparse facts <id>` | Structured facts (`--refresh` re-extracts them) |
//! | `cparse serve` | Start the HTTP API |
//!
//! Logs go to stderr; filter with `RUST_LOG`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use clinical_parse::{commands, config, migrate, server, vendor};

/// Clinical Parse CLI: vendor-backed parsing and fact extraction for
/// clinical documents.
#[derive(Parser)]
#[command(
    name = "cparse",
    about = "Clinical Parse: vendor-backed parsing and fact extraction for clinical documents",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cparse.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Register an uploaded file as a document in status UPLOADED.
    ///
    /// Prints the new document id.
    Add {
        /// Path of the stored upload.
        path: PathBuf,

        /// Patient the document belongs to.
        #[arg(long)]
        patient: String,

        /// MIME type; guessed from the file extension when omitted.
        #[arg(long)]
        mime: Option<String>,
    },

    /// List documents, newest first.
    Documents,

    /// Request a parse and follow the job until it finishes.
    ///
    /// If a parse is already running for the document, follows that job
    /// instead of starting another.
    Parse {
        /// Document id.
        id: String,
    },

    /// Show document status and the latest parse job.
    Status {
        /// Document id.
        id: String,
    },

    /// Print the chunks and blocks of the latest completed parse as JSON.
    #[command(name = "result")]
    Parsed {
        /// Document id.
        id: String,
    },

    /// List structured facts extracted from a document.
    Facts {
        /// Document id.
        id: String,

        /// Re-run extraction over the stored parse result first.
        #[arg(long)]
        refresh: bool,
    },

    /// Start the HTTP API on `[server].bind`.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if matches!(cli.command, Commands::Parse { .. } | Commands::Serve) {
        for key in vendor::missing_credentials(&cfg) {
            tracing::warn!(
                provider = %cfg.parser.provider,
                "{} is not set; vendor calls will fail",
                key
            );
        }
    }

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Add {
            path,
            patient,
            mime,
        } => {
            commands::run_add(&cfg, &path, &patient, mime.as_deref()).await?;
        }
        Commands::Documents => {
            commands::run_documents(&cfg).await?;
        }
        Commands::Parse { id } => {
            commands::run_parse(&cfg, &id).await?;
        }
        Commands::Status { id } => {
            commands::run_status(&cfg, &id).await?;
        }
        Commands::Parsed { id } => {
            commands::run_result(&cfg, &id).await?;
        }
        Commands::Facts { id, refresh } => {
            commands::run_facts(&cfg, &id, refresh).await?;
        }
        Commands::Serve => {
            let orchestrator = commands::build_orchestrator(&cfg).await?;
            server::run_server(&cfg, orchestrator).await?;
        }
    }

    Ok(())
}
