//! Engine configuration loader for Waypoint.
//!
//! Reads `waypoint.toml` from the data directory and deserializes it into
//! [`EngineConfig`]. Falls back to defaults when the file is missing or
//! malformed.

use std::path::{Path, PathBuf};

use waypoint_types::config::EngineConfig;

/// Name of the config file inside the data directory.
pub const CONFIG_FILE: &str = "waypoint.toml";

/// Resolve the data directory.
///
/// Priority: `WAYPOINT_DATA_DIR`, then `~/.waypoint`, then `./.waypoint`.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("WAYPOINT_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".waypoint");
    }

    PathBuf::from(".waypoint")
}

/// Load engine configuration from `{data_dir}/waypoint.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join(CONFIG_FILE);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE} found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Render a config as TOML, as it would appear in `waypoint.toml`.
pub fn render_config(config: &EngineConfig) -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(config)
}
