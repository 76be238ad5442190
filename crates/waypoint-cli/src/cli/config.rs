//! Show the effective engine configuration.

use anyhow::Result;
use console::style;
use waypoint_infra::config::{CONFIG_FILE, render_config};

use crate::state::AppState;

pub fn show_config(state: &AppState, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&state.config)?);
        return Ok(());
    }

    println!(
        "{}",
        style(format!("# {}", state.data_dir.join(CONFIG_FILE).display())).dim()
    );
    print!("{}", render_config(&state.config)?);
    Ok(())
}
