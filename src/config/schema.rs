//! Configuration schema for Kiln
//!
//! Project configuration lives in `kiln.toml` at the project root.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Project name, used to namespace stage artifacts and lock keys
    pub project: String,

    /// General settings
    pub general: GeneralConfig,

    /// Build conveyor settings
    pub build: BuildConfig,

    /// Cluster API settings for `kubernetes://` synchronization
    pub cluster: ClusterConfig,

    /// Image definitions
    #[serde(rename = "image")]
    pub images: Vec<ImageConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            project: "kiln".to_string(),
            general: GeneralConfig::default(),
            build: BuildConfig::default(),
            cluster: ClusterConfig::default(),
            images: Vec::new(),
        }
    }
}

impl Config {
    /// Look up an image definition by name
    pub fn image(&self, name: &str) -> Option<&ImageConfig> {
        self.images.iter().find(|i| i.name == name)
    }

    /// Names of all configured images, in declaration order
    pub fn image_names(&self) -> Vec<&str> {
        self.images.iter().map(|i| i.name.as_str()).collect()
    }
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Build conveyor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Synchronization target: "local", "kubernetes://<ns>" or "http(s)://<host>"
    pub synchronization: String,

    /// Build independent images in parallel
    pub parallel: bool,

    /// Maximum concurrently running image pipelines (<= 0 = unbounded)
    pub parallel_tasks_limit: i64,

    /// Maximum time to wait for a stage lock
    pub lock_timeout_secs: u64,

    /// Image repository address ("local" = no remote storage)
    pub repo: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            synchronization: "local".to_string(),
            parallel: true,
            parallel_tasks_limit: 5,
            lock_timeout_secs: 1800,
            repo: "local".to_string(),
        }
    }
}

/// Cluster API connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Kubernetes API server address (e.g. a `kubectl proxy` endpoint)
    pub api_url: String,

    /// Bearer token, if the API requires one
    pub token: Option<String>,

    /// Lock lease duration; holders renew every third of it
    pub lease_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8001".to_string(),
            token: None,
            lease_secs: 60,
        }
    }
}

/// A single image definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Image name, unique within the project
    pub name: String,

    /// Base image reference from a registry
    pub from: Option<String>,

    /// Name of another image in this project to build on top of
    pub from_image: Option<String>,

    /// Shell used to run user commands
    pub shell: Option<String>,

    /// Environment for user commands
    pub env: BTreeMap<String, String>,

    /// Commands for the before-install stage
    pub before_install: Vec<String>,

    /// Commands for the install stage
    pub install: Vec<String>,

    /// Commands for the before-setup stage
    pub before_setup: Vec<String>,

    /// Commands for the setup stage
    pub setup: Vec<String>,

    /// Raw Dockerfile instructions applied last
    pub docker: Vec<String>,

    /// Files whose content contributes to a stage's checksum, keyed by stage name
    pub dependencies: BTreeMap<String, Vec<String>>,
}

impl ImageConfig {
    /// Shell for user commands
    pub fn shell(&self) -> &str {
        self.shell.as_deref().unwrap_or("/bin/sh")
    }
}
