//! CLI command implementations

pub mod build;
pub mod config;
pub mod plan;

pub use build::execute as build;
pub use config::execute as config;
pub use plan::execute as plan;

use crate::cli::args::SyncArgs;
use crate::config::{Config, ConfigManager};
use crate::error::{KilnError, KilnResult};
use crate::stage::{BuildPlan, GitDiffPatchProvider, GitPatchProvider, NoGitPatches, Planner, StageKind};
use crate::storage::SynchronizationTarget;
use std::path::{Path, PathBuf};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Loaded configuration and where it came from
pub struct Project {
    pub manager: ConfigManager,
    pub config: Config,
}

impl Project {
    /// Load `--config` or the nearest `kiln.toml`
    pub async fn load(config_path: Option<&Path>) -> KilnResult<Self> {
        let manager = config_manager(config_path)?;
        let config = manager.load().await?;
        Ok(Self { manager, config })
    }

    pub fn dir(&self) -> PathBuf {
        self.manager.project_dir()
    }

    /// Synchronization target from the flag or `[build]`
    pub fn synchronization(&self, sync: &SyncArgs) -> KilnResult<SynchronizationTarget> {
        let value = sync
            .synchronization
            .as_deref()
            .unwrap_or(&self.config.build.synchronization);
        SynchronizationTarget::parse(value)
    }

    /// Compute signatures for the selected images
    pub async fn plan(&self, images: &[String], target: Option<StageKind>) -> KilnResult<BuildPlan> {
        let dir = self.dir();
        let git: Box<dyn GitPatchProvider> = if dir.join(".git").exists() {
            debug!("Including uncommitted changes of stage dependencies");
            Box::new(GitDiffPatchProvider::new(dir.clone()))
        } else {
            Box::new(NoGitPatches)
        };
        Planner::new(&self.config, &dir, git.as_ref())
            .plan(images, target)
            .await
    }
}

/// `--config` or the nearest `kiln.toml`
pub fn config_manager(config_path: Option<&Path>) -> KilnResult<ConfigManager> {
    match config_path {
        Some(path) => Ok(ConfigManager::with_path(path.to_path_buf())),
        None => {
            let cwd = std::env::current_dir()
                .map_err(|e| KilnError::io("getting current directory", e))?;
            ConfigManager::discover(&cwd)
        }
    }
}

pub(crate) fn target_stage(sync: &SyncArgs) -> KilnResult<Option<StageKind>> {
    sync.target_stage.as_deref().map(str::parse::<StageKind>).transpose()
}

/// Channel flipped to `true` on SIGINT or SIGTERM
pub(crate) fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    term.recv().await;
                }
                Err(e) => {
                    warn!("Cannot listen for SIGTERM: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, stopping builds"),
            _ = terminate => info!("Received SIGTERM, stopping builds"),
        }

        let _ = tx.send(true);
    });

    rx
}
