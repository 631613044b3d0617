use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a TOML file
///
/// Reads go through an `ArcSwap` cache and never touch the filesystem,
/// so handlers and the capture path can consult settings freely.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Create a new configuration store
    ///
    /// Loads the file if it exists, otherwise writes the defaults.
    pub async fn new(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let config = Self::load_config(path).await?;
        let cache = Arc::new(ArcSwap::from_pointee(config));

        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path: path.to_path_buf(),
            cache,
            change_tx,
        })
    }

    /// Load configuration from file, creating defaults when absent
    async fn load_config(path: &Path) -> Result<AppConfig> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => toml::from_str(&text).map_err(|e| AppError::Config(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::save_config_to_file(path, &config).await?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Save configuration to file
    async fn save_config_to_file(path: &Path, config: &AppConfig) -> Result<()> {
        let text =
            toml::to_string_pretty(config).map_err(|e| AppError::Config(e.to_string()))?;
        tokio::fs::write(path, text).await?;
        Ok(())
    }

    /// Current configuration snapshot (lock-free).
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Set entire configuration
    pub async fn set(&self, config: AppConfig) -> Result<()> {
        Self::save_config_to_file(&self.path, &config).await?;
        self.cache.store(Arc::new(config));

        // Notify subscribers
        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });

        Ok(())
    }

    /// Apply a closure to a copy of the configuration and persist it.
    ///
    /// Read-modify-write; concurrent updates are last-write-wins, which is
    /// fine for user-initiated settings changes.
    pub async fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let current = self.cache.load();
        let mut config = (**current).clone();
        f(&mut config);

        // File first, cache second: the cache never holds unpersisted state
        Self::save_config_to_file(&self.path, &config).await?;
        self.cache.store(Arc::new(config));

        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });

        Ok(())
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }
}
