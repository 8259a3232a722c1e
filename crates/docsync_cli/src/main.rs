//! docsync CLI
//!
//! Command-line tools for local docsync stores.
//!
//! # Commands
//!
//! - `inspect` - Display store metadata and document counts
//! - `list` - List documents, optionally of one kind
//! - `get` / `put` / `remove` - Single-document access
//! - `compact` - Rewrite the journal with only live state
//! - `replicate` - One-shot bidirectional sync with another local store
//! - `sync` - One-shot bidirectional sync with a remote database over HTTP

mod commands;

use clap::{Parser, Subcommand};
use docsync_sync_engine::{RemoteConfig, DEFAULT_DATABASE};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// docsync command-line store tools.
#[derive(Parser)]
#[command(name = "docsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display store metadata and document counts
    Inspect {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List documents, most recently updated first
    List {
        /// Only documents of this kind
        #[arg(short, long)]
        kind: Option<String>,

        /// Maximum number of documents
        #[arg(short, long)]
        limit: Option<usize>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Print one document as JSON
    Get {
        /// Document id
        id: String,
    },

    /// Write a document
    Put {
        /// Document id (generated when omitted)
        #[arg(long)]
        id: Option<String>,

        /// Document kind
        #[arg(short, long)]
        kind: String,

        /// Content as JSON
        #[arg(short, long)]
        content: String,

        /// Current revision, required to overwrite
        #[arg(short, long)]
        rev: Option<String>,
    },

    /// Delete a document
    Remove {
        /// Document id
        id: String,

        /// Current revision
        #[arg(short, long)]
        rev: String,
    },

    /// Rewrite the journal keeping only the latest state
    Compact,

    /// Sync once, both ways, with another local store
    Replicate {
        /// Path of the other store
        #[arg(long)]
        to: PathBuf,
    },

    /// Sync once, both ways, with a remote database over HTTP
    Sync {
        /// Server URL, e.g. http://localhost:5984
        #[arg(long)]
        url: String,

        /// Remote database name
        #[arg(long, default_value = DEFAULT_DATABASE)]
        database: String,

        /// Basic auth user name
        #[arg(short, long)]
        username: Option<String>,

        /// Basic auth password
        #[arg(long, requires = "username")]
        password: Option<String>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let path = cli.path.ok_or("store path required (--path)")?;

    match cli.command {
        Commands::Inspect { format } => commands::inspect::run(&path, &format)?,
        Commands::List { kind, limit, format } => {
            commands::documents::list(&path, kind.as_deref(), limit, &format)?;
        }
        Commands::Get { id } => commands::documents::get(&path, &id)?,
        Commands::Put { id, kind, content, rev } => {
            commands::documents::put(&path, id, &kind, &content, rev)?;
        }
        Commands::Remove { id, rev } => commands::documents::remove(&path, &id, &rev)?,
        Commands::Compact => commands::compact::run(&path)?,
        Commands::Replicate { to } => commands::replicate::run(&path, &to)?,
        Commands::Sync {
            url,
            database,
            username,
            password,
        } => {
            let mut remote = RemoteConfig::new(&url, database)?;
            if let Some(username) = username {
                remote = remote.with_credentials(username, password.unwrap_or_default());
            }
            commands::replicate::run_remote(&path, &remote)?;
        }
    }

    Ok(())
}
