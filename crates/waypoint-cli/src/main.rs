//! Waypoint CLI entry point.
//!
//! Binary name: `waypoint`
//!
//! Parses CLI arguments, sets up tracing and application state, then
//! dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use waypoint_infra::config::resolve_data_dir;
use waypoint_observe::tracing_setup::init_tracing;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_format).map_err(|e| anyhow::anyhow!("failed to set up tracing: {e}"))?;

    let data_dir = cli.data_dir.clone().unwrap_or_else(resolve_data_dir);
    let state = AppState::init(data_dir).await?;

    match cli.command {
        Commands::Archive(args) => cli::archive::archive_group(&state, args, cli.json).await?,
        Commands::Config => cli::config::show_config(&state, cli.json)?,
    }

    Ok(())
}
