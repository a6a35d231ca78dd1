pub mod board;
pub mod events;
pub mod group;
pub mod init;
pub mod instances;
pub mod status;
pub mod task;

use std::path::Path;

use anyhow::Context;
use th_core::board::TaskBoard;
use th_core::config::Config;
use th_core::event_bus::EventBus;
use th_core::instances::InstanceManager;
use th_core::store::Store;

/// The board and instance registry named by a config file.
pub struct Workspace {
    pub config: Config,
    pub board: TaskBoard,
    pub instances: InstanceManager,
}

impl Workspace {
    pub async fn open(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match config_path {
            Some(path) => Config::load_from(path),
            None => Config::load(),
        }
        .context("failed to load config (hint: run `th init`)")?;

        let path = config.store_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store = Store::new(&path)
            .await
            .with_context(|| format!("failed to open store at {}", path.display()))?;
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Config, store: Store) -> Self {
        let board = TaskBoard::new(store.clone(), config.role_directory(), EventBus::new());
        let instances = InstanceManager::new(store, config.reconciler.stale_after());
        Self {
            config,
            board,
            instances,
        }
    }
}

#[cfg(test)]
pub(crate) async fn test_workspace() -> Workspace {
    Workspace::with_store(Config::starter(), Store::new_in_memory().await.unwrap())
}
