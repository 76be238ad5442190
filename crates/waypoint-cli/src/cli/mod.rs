//! CLI command definitions and dispatch for the `waypoint` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod archive;
pub mod config;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use waypoint_observe::tracing_setup::LogFormat;

/// Run checkpointed background tasks locally.
#[derive(Parser)]
#[command(name = "waypoint", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Data directory (blob root and config location).
    #[arg(long, global = true, env = "WAYPOINT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Log output format: pretty or json.
    #[arg(long, global = true, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Archive every file in a directory into one zip.
    Archive(ArchiveArgs),

    /// Print the effective engine configuration.
    Config,
}

#[derive(Args, Debug, Clone)]
pub struct ArchiveArgs {
    /// Directory of files to archive, relative to the data directory.
    #[arg(long)]
    pub group_dir: String,

    /// Output path of the archive, relative to the data directory.
    #[arg(long)]
    pub output: String,

    /// Files streamed at once (overrides `archive.max_parallel_files`).
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Skip the manifest.json entry.
    #[arg(long)]
    pub no_manifest: bool,
}
