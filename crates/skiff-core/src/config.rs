//! Pipeline configuration loading and management

use crate::identity::{get_or_create_installation_id, new_session_id};
use crate::settings::{parse_sinks, AppSettings, LogSettings, ShippingSettings};
use crate::{Result, SkiffError};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level configuration file (`skiff.toml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SkiffConfig {
    pub app: AppConfig,
    pub logging: LogSettings,
    pub shipping: ShippingSettings,
}

/// Static part of [`AppSettings`]; ids are resolved at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub commit: String,
    pub user_id: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "skiff".to_string(),
            commit: option_env!("SKIFF_COMMIT").unwrap_or("unknown").to_string(),
            user_id: None,
        }
    }
}

impl SkiffConfig {
    /// Configuration with the platform log directory filled in
    pub fn with_platform_defaults() -> Self {
        let mut config = Self::default();
        if let Ok(dir) = Self::default_log_dir() {
            config.logging.directory = dir;
        }
        config
    }

    /// Load configuration from file or fall back to defaults.
    /// Environment overrides are applied in both cases.
    pub async fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        let mut config = if config_file.exists() {
            info!("Loading config from: {}", config_file.display());
            let content = tokio::fs::read_to_string(&config_file).await?;
            toml::from_str(&content).map_err(|e| SkiffError::ConfigLoadFailed {
                path: config_file.display().to_string(),
                source: Box::new(e),
            })?
        } else {
            info!("No config file found, using defaults");
            Self::with_platform_defaults()
        };

        config.load_env_overrides();
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save(&self, config_path: Option<&Path>) -> Result<()> {
        let config_file = match config_path {
            Some(path) => path.to_path_buf(),
            None => Self::default_config_path()?,
        };

        if let Some(parent) = config_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| SkiffError::Config {
            message: format!("Failed to serialize config: {}", e),
        })?;

        tokio::fs::write(&config_file, content).await?;
        Ok(())
    }

    /// Apply `SKIFF_*` environment variable overrides.
    /// Unparseable values leave the current setting untouched.
    pub fn load_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("SKIFF_SHIPPING_ENABLED") {
            self.shipping.enabled = enabled.parse().unwrap_or(self.shipping.enabled);
        }

        if let Ok(frequency) = std::env::var("SKIFF_LOG_FREQUENCY") {
            if let Ok(frequency) = frequency.parse() {
                self.logging.frequency = frequency;
            }
        }

        if let Ok(level) = std::env::var("SKIFF_LOG_LEVEL") {
            if let Ok(level) = level.parse() {
                self.logging.verbosity = level;
            }
        }

        if let Ok(sinks) = std::env::var("SKIFF_LOG_SINKS") {
            if let Ok(sinks) = parse_sinks(&sinks) {
                self.logging.sinks = sinks;
            }
        }

        if let Ok(dir) = std::env::var("SKIFF_LOG_DIR") {
            self.logging.directory = PathBuf::from(dir);
        }

        // Credentials
        if let Ok(key) = std::env::var("SKIFF_ACCESS_KEY_ID") {
            self.shipping.access_key_id = Some(key);
        }
        if let Ok(secret) = std::env::var("SKIFF_SECRET_ACCESS_KEY") {
            self.shipping.secret_access_key = Some(secret);
        }
        if let Ok(bucket) = std::env::var("SKIFF_BUCKET") {
            self.shipping.bucket = bucket;
        }
        if let Ok(url) = std::env::var("SKIFF_PRESIGN_URL") {
            self.shipping.presign_url = Some(url);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.app.name.trim().is_empty() {
            return Err(SkiffError::Config {
                message: "app.name must not be empty".to_string(),
            });
        }

        // The name ends up in file names and object keys
        if self.app.name.contains(['/', '\\']) {
            return Err(SkiffError::InvalidSetting {
                setting: "app.name".to_string(),
                value: self.app.name.clone(),
            });
        }

        if self.logging.close_timeout_secs == 0 {
            return Err(SkiffError::Config {
                message: "logging.close_timeout_secs must be greater than 0".to_string(),
            });
        }

        if self.shipping.enabled {
            if self.shipping.credentials().is_some() {
                if self.shipping.bucket.is_empty() {
                    return Err(SkiffError::Config {
                        message: "shipping.bucket is required with static credentials"
                            .to_string(),
                    });
                }
            } else if self.shipping.presign_url.is_none() {
                return Err(SkiffError::Config {
                    message: "shipping requires either static credentials or presign_url"
                        .to_string(),
                });
            }

            for url in [&self.shipping.presign_url, &self.shipping.endpoint]
                .into_iter()
                .flatten()
            {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(SkiffError::InvalidSetting {
                        setting: "shipping url".to_string(),
                        value: url.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Resolve ids and build the immutable [`AppSettings`] for this process
    pub fn app_settings(&self) -> Result<AppSettings> {
        let installation_id = get_or_create_installation_id(&self.logging.directory)?;
        let mut settings = AppSettings::new(
            self.app.name.clone(),
            self.app.commit.clone(),
            new_session_id(),
            installation_id,
        );
        settings.user_id = self.app.user_id.clone();
        Ok(settings)
    }

    fn default_config_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("com", "skiff", "skiff").ok_or_else(|| SkiffError::Config {
                message: "Could not determine config directory".to_string(),
            })?;

        Ok(project_dirs.config_dir().join("skiff.toml"))
    }

    fn default_log_dir() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("com", "skiff", "skiff").ok_or_else(|| SkiffError::Config {
                message: "Could not determine log directory".to_string(),
            })?;

        Ok(project_dirs.data_dir().join("logs"))
    }
}
