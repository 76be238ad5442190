//! Application state wiring the engine adapters together.
//!
//! The data directory doubles as the blob root: group directories and
//! archive outputs are blob paths relative to it.

use std::path::PathBuf;
use std::sync::Arc;

use waypoint_infra::config::load_engine_config;
use waypoint_infra::memory::group_repo::InMemoryGroupRepository;
use waypoint_infra::storage::local_blob::LocalBlobStore;
use waypoint_types::config::EngineConfig;

pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub groups: Arc<InMemoryGroupRepository>,
    pub blobs: Arc<LocalBlobStore>,
}

impl AppState {
    /// Create the data directory if needed and load `waypoint.toml`.
    pub async fn init(data_dir: PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&data_dir).await?;
        let config = load_engine_config(&data_dir).await;
        tracing::debug!(data_dir = %data_dir.display(), "application state initialized");

        Ok(Self {
            blobs: Arc::new(LocalBlobStore::new(data_dir.clone())),
            groups: Arc::new(InMemoryGroupRepository::new()),
            data_dir,
            config,
        })
    }
}
