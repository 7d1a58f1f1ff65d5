//! Stage model and signature chain
//!
//! Every image is built through the same fixed sequence of stages. Each
//! stage's signature covers its own inputs and the signature of the nearest
//! preceding present stage, so a change anywhere invalidates everything after
//! it and nothing before it.
//!
//! | Stage | Present when | Inputs |
//! |-------|--------------|--------|
//! | from | always | base image reference |
//! | before-install | commands given | commands, env, shell, deps, patch |
//! | install | commands given | commands, env, shell, deps, patch |
//! | before-setup | commands given | commands, env, shell, deps, patch |
//! | setup | commands given | commands, env, shell, deps, patch |
//! | docker-instructions | instructions given | instructions |

pub mod inputs;
pub mod plan;
pub mod signature;

pub use inputs::{dependencies_digest, GitDiffPatchProvider, GitPatchProvider, NoGitPatches};
pub use plan::{BaseRef, BuildPlan, ImagePlan, PlannedStage, Planner};
pub use signature::{compute_signature, LocalInputs, SignatureChain, ROOT_SIGNATURE};

use crate::error::KilnError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kinds of stages, in build order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageKind {
    /// Base image
    From,
    /// User commands run before dependencies are installed
    BeforeInstall,
    /// Dependency installation
    Install,
    /// User commands run before application setup
    BeforeSetup,
    /// Application setup
    Setup,
    /// Raw Dockerfile instructions
    DockerInstructions,
}

impl StageKind {
    /// All stages in build order
    pub fn all() -> &'static [Self] {
        &[
            Self::From,
            Self::BeforeInstall,
            Self::Install,
            Self::BeforeSetup,
            Self::Setup,
            Self::DockerInstructions,
        ]
    }

    /// Whether the stage runs user shell commands
    pub fn is_user_stage(&self) -> bool {
        matches!(
            self,
            Self::BeforeInstall | Self::Install | Self::BeforeSetup | Self::Setup
        )
    }

    /// Stable name used in signatures, reports and lock keys
    pub fn name(&self) -> &'static str {
        match self {
            Self::From => "from",
            Self::BeforeInstall => "before-install",
            Self::Install => "install",
            Self::BeforeSetup => "before-setup",
            Self::Setup => "setup",
            Self::DockerInstructions => "docker-instructions",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for StageKind {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::all()
            .iter()
            .copied()
            .find(|kind| kind.name() == normalized || (normalized == "docker" && *kind == Self::DockerInstructions))
            .ok_or_else(|| KilnError::UnknownStage(s.to_string()))
    }
}
