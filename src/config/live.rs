//! Live reconciliation settings, re-read by the scheduler on every iteration.

use super::parse::{load_config, ConfigError};
use super::types::ReconcileConfig;
use async_trait::async_trait;
use std::path::PathBuf;

#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn current(&self) -> Result<ReconcileConfig, ConfigError>;
}

/// Re-reads the `reconcile` section of the config file on each call, so edits
/// to `enabled` and `update_interval_seconds` take effect without a restart.
pub struct FileSettingsSource {
    path: PathBuf,
}

impl FileSettingsSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SettingsSource for FileSettingsSource {
    async fn current(&self) -> Result<ReconcileConfig, ConfigError> {
        let path = self.path.clone();
        let config = tokio::task::spawn_blocking(move || load_config(&path))
            .await
            .map_err(|e| ConfigError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        Ok(config.reconcile)
    }
}

/// Settings that never change.
pub struct FixedSettings(pub ReconcileConfig);

#[async_trait]
impl SettingsSource for FixedSettings {
    async fn current(&self) -> Result<ReconcileConfig, ConfigError> {
        Ok(self.0.clone())
    }
}
