use arc_swap::ArcSwap;
use std::path::Path;
use std::sync::Arc;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a TOML file
///
/// Uses `ArcSwap` so readers never block an update.
#[derive(Clone)]
pub struct ConfigStore {
    cache: Arc<ArcSwap<AppConfig>>,
}

impl ConfigStore {
    /// Load configuration from `path`, or use defaults when no path is given
    pub async fn open(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::read_file(path).await?,
            None => AppConfig::default(),
        };

        Ok(Self {
            cache: Arc::new(ArcSwap::from_pointee(config)),
        })
    }

    async fn read_file(path: &Path) -> Result<AppConfig> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config: AppConfig = toml::from_str(&text)
            .map_err(|e| AppError::Config(format!("Invalid {}: {}", path.display(), e)))?;
        config.stream = config.stream.normalized();
        Ok(config)
    }

    /// Get current configuration (lock-free)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Apply an in-memory change (CLI overrides)
    pub fn update<F>(&self, f: F) -> Arc<AppConfig>
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (*self.get()).clone();
        f(&mut config);
        config.stream = config.stream.normalized();
        let config = Arc::new(config);
        self.cache.store(config.clone());
        config
    }
}
