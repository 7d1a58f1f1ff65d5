//! Configuration management for Kiln

pub mod schema;

pub use schema::{BuildConfig, ClusterConfig, Config, ImageConfig};

use crate::error::{KilnError, KilnResult};
use crate::stage::StageKind;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Project configuration file name
pub const CONFIG_FILE_NAME: &str = "kiln.toml";

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Find `kiln.toml` in `start` or any of its parents
    pub fn discover(start: &Path) -> KilnResult<Self> {
        start
            .ancestors()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .find(|candidate| candidate.is_file())
            .map(Self::with_path)
            .ok_or_else(|| KilnError::ConfigNotFound(start.join(CONFIG_FILE_NAME)))
    }

    /// Get the state directory path
    pub fn state_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiln")
    }

    /// Directory containing the configuration file; dependency paths are relative to it
    pub fn project_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Load and validate the configuration
    pub async fn load(&self) -> KilnResult<Config> {
        if !self.config_path.exists() {
            return Err(KilnError::ConfigNotFound(self.config_path.clone()));
        }

        let content = fs::read_to_string(&self.config_path).await.map_err(|e| {
            KilnError::io(
                format!("reading config from {}", self.config_path.display()),
                e,
            )
        })?;

        let config = self.parse(&content)?;
        debug!(
            "Loaded {} image(s) from {}",
            config.images.len(),
            self.config_path.display()
        );
        Ok(config)
    }

    /// Parse and validate configuration content
    pub fn parse(&self, content: &str) -> KilnResult<Config> {
        let config: Config = toml::from_str(content).map_err(|e| self.invalid(e.to_string()))?;
        validate(&config).map_err(|reason| self.invalid(reason))?;
        Ok(config)
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    fn invalid(&self, reason: String) -> KilnError {
        KilnError::ConfigInvalid {
            path: self.config_path.clone(),
            reason,
        }
    }
}

/// Check structural rules that serde cannot express
fn validate(config: &Config) -> Result<(), String> {
    if config.project.trim().is_empty() {
        return Err("project name cannot be empty".to_string());
    }

    let mut seen = HashSet::new();
    for image in &config.images {
        if image.name.trim().is_empty() {
            return Err("image name cannot be empty".to_string());
        }
        if !seen.insert(image.name.as_str()) {
            return Err(format!("duplicate image name {:?}", image.name));
        }

        match (&image.from, &image.from_image) {
            (Some(_), Some(_)) => {
                return Err(format!(
                    "image {:?}: only one of `from` and `from_image` may be set",
                    image.name
                ))
            }
            (None, None) => {
                return Err(format!(
                    "image {:?}: one of `from` or `from_image` is required",
                    image.name
                ))
            }
            _ => {}
        }

        for stage in image.dependencies.keys() {
            match stage.parse::<StageKind>() {
                Ok(kind) if kind.is_user_stage() => {}
                _ => {
                    return Err(format!(
                        "image {:?}: dependencies can only be declared for user stages, got {:?}",
                        image.name, stage
                    ))
                }
            }
        }
    }

    for image in &config.images {
        if let Some(ref base) = image.from_image {
            if config.image(base).is_none() {
                return Err(format!(
                    "image {:?}: from_image refers to unknown image {:?}",
                    image.name, base
                ));
            }
        }
    }

    Ok(())
}
