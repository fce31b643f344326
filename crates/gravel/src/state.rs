//! Application state and shared resources.

use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::manager::NodeManager;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,

    /// Cluster membership facade
    pub manager: NodeManager,

    /// Fired once on shutdown; open node sessions subscribe to it
    pub shutdown: broadcast::Sender<()>,
}

impl AppState {
    pub fn new(config: AppConfig, shutdown: broadcast::Sender<()>) -> Self {
        let manager = NodeManager::new(&config);

        Self {
            config,
            manager,
            shutdown,
        }
    }
}
