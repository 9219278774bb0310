use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "vault-inventory")]
#[command(about = "Resumable vault inventory and cross-reference", long_about = None)]
pub struct Cli {
    /// Settings file (toml, json or yaml). Defaults to ./Settings.*
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Index the configured sources into the inventory file
    Index(IndexArgs),
    /// Search a finished inventory by name or path
    Search {
        term: String,
    },
    /// List remote items without a local copy
    Missing,
    /// Print configuration values
    PrintConfig,
}

#[derive(Debug, Args)]
pub struct IndexArgs {
    /// Only enumerate the filesystem vault
    #[arg(long, conflicts_with = "plm_only")]
    pub pdm_only: bool,

    /// Only enumerate the remote repository
    #[arg(long)]
    pub plm_only: bool,

    /// Overwrite an existing inventory without asking
    #[arg(long, conflicts_with = "dry_run")]
    pub force: bool,

    /// Run the whole pipeline without writing the inventory
    #[arg(long)]
    pub dry_run: bool,

    /// Continue the last interrupted run
    #[arg(long)]
    pub resume: bool,

    /// Extensions to include (repeatable or comma separated)
    #[arg(long = "ext", value_name = "EXT")]
    pub extensions: Vec<String>,

    /// Only include paths under this prefix
    #[arg(long)]
    pub path_prefix: Option<String>,

    /// Modified on or after (YYYY-MM-DD or ISO-8601)
    #[arg(long)]
    pub date_from: Option<String>,

    /// Modified on or before (YYYY-MM-DD or ISO-8601)
    #[arg(long)]
    pub date_to: Option<String>,
}
