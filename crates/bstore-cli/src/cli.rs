use std::path::PathBuf;

use bstore_types::{ContentHash, TempId};
use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "bstore",
    about = "Content-addressed bundle store",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Store home; overrides `root` from --config
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// TOML store configuration
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// JSON owner -> hash manifest consulted before deleting stored content
    #[arg(long, global = true)]
    pub references: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create the data/ and temp/ directories
    Init(InitArgs),
    /// Store local paths or URLs as one bundle
    Upload(UploadArgs),
    /// Print where a hash is (or would be) stored
    Location(LocationArgs),
    /// Reserve a temp directory
    MakeTemp(MakeTempArgs),
    /// Delete one stored entry if nothing references it
    Cleanup(CleanupArgs),
    /// Sweep unreferenced data and abandoned temp entries
    Gc(GcArgs),
    /// Delete everything in the store
    Reset(ResetArgs),
}

#[derive(Args)]
pub struct InitArgs {}

#[derive(Args)]
pub struct UploadArgs {
    #[arg(required = true)]
    pub sources: Vec<String>,
    #[arg(long)]
    pub follow_symlinks: bool,
    #[arg(long)]
    pub exclude: Vec<String>,
    /// Treat URLs as git repositories
    #[arg(long)]
    pub git: bool,
    /// Unpack recognized archives
    #[arg(long)]
    pub unpack: bool,
    /// Move local sources in and delete them afterwards
    #[arg(long)]
    pub remove_sources: bool,
}

#[derive(Args)]
pub struct LocationArgs {
    pub hash: ContentHash,
    #[arg(long)]
    pub relative: bool,
}

#[derive(Args)]
pub struct MakeTempArgs {
    /// Defaults to a fresh UUID
    pub id: Option<TempId>,
}

#[derive(Args)]
pub struct CleanupArgs {
    pub hash: ContentHash,
    /// Owner whose reference is ignored (repeatable)
    #[arg(long)]
    pub except: Vec<String>,
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args)]
pub struct GcArgs {
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args)]
pub struct ResetArgs {
    #[arg(long)]
    pub yes: bool,
}
