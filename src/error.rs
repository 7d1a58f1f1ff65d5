//! Error types for Kiln
//!
//! All modules use `KilnResult<T>` as their return type.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for Kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// Coarse classification of an error, used to decide how far it propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input detected before any build work starts
    Configuration,
    /// Lock service, cache service or storage failure
    Infrastructure,
    /// The underlying builder failed to execute a stage
    Build,
    /// The run was interrupted
    Cancelled,
    /// Broken internal invariant; the process must stop
    Internal,
}

/// All errors that can occur in Kiln
#[derive(Error, Debug)]
pub enum KilnError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Unknown synchronization target {0:?}")]
    UnknownSynchronization(String),

    #[error("You can't use both {deprecated} and {current}, use only the latter instead")]
    ConflictingFlags {
        current: &'static str,
        deprecated: &'static str,
    },

    #[error("Invalid custom tag {template:?}: {reason}")]
    InvalidCustomTag { template: String, reason: String },

    #[error(
        "Invalid custom tag {template:?}: it is necessary to use the image name in the tag \
         format if there is more than one image (e.g., {suggestion:?})"
    )]
    DuplicateCustomTag {
        template: String,
        suggestion: String,
    },

    #[error("Custom tags can only be used with remote storage: --repo=ADDRESS param required")]
    CustomTagRequiresRepo,

    #[error("Image not found in configuration: {0}")]
    UnknownImage(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Image dependency cycle detected: {0}")]
    DependencyCycle(String),

    #[error("Stage dependency {path} of image {image} (stage {stage}) not found")]
    StageDependencyMissing {
        image: String,
        stage: String,
        path: PathBuf,
    },

    #[error("Unknown build report format {0:?} (expected json or envfile)")]
    InvalidReportFormat(String),

    // Lock errors
    #[error("Lock service error for {key}: {reason}")]
    LockService { key: String, reason: String },

    #[error("Timed out after {waited:?} waiting for lock {key}")]
    LockTimeout { key: String, waited: Duration },

    #[error("Lock {key} is held by another builder")]
    LockBusy { key: String },

    // Cache errors
    #[error("Stages storage cache error for {signature}: {reason}")]
    CacheService { signature: String, reason: String },

    #[error("Cluster API error during {operation}: {reason}")]
    ClusterApi { operation: String, reason: String },

    // Build errors
    #[error("Image {image}: stage {stage} failed: {reason}")]
    StageBuild {
        image: String,
        stage: String,
        reason: String,
    },

    #[error("Build cancelled")]
    Cancelled,

    #[error("{failed} of {total} image(s) were not built")]
    RunIncomplete { failed: usize, total: usize },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command execution error: {command}, stderr: {stderr}")]
    CommandExecution { command: String, stderr: String },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KilnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Create a command execution error
    pub fn command_exec(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::CommandExecution {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a stage build error
    pub fn stage_build(
        image: impl Into<String>,
        stage: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::StageBuild {
            image: image.into(),
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigInvalid { .. }
            | Self::ConfigNotFound(_)
            | Self::UnknownSynchronization(_)
            | Self::ConflictingFlags { .. }
            | Self::InvalidCustomTag { .. }
            | Self::DuplicateCustomTag { .. }
            | Self::CustomTagRequiresRepo
            | Self::UnknownImage(_)
            | Self::UnknownStage(_)
            | Self::DependencyCycle(_)
            | Self::StageDependencyMissing { .. }
            | Self::InvalidReportFormat(_)
            | Self::TomlParse(_) => ErrorKind::Configuration,

            Self::LockService { .. }
            | Self::LockTimeout { .. }
            | Self::LockBusy { .. }
            | Self::CacheService { .. }
            | Self::ClusterApi { .. }
            | Self::Io { .. }
            | Self::Json(_)
            | Self::TomlSerialize(_) => ErrorKind::Infrastructure,

            Self::StageBuild { .. }
            | Self::CommandFailed { .. }
            | Self::CommandExecution { .. }
            | Self::RunIncomplete { .. } => ErrorKind::Build,

            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::UnknownSynchronization(_) => Some(
                "Use \"local\", \"kubernetes://<namespace>\" or \"http(s)://<host>\"",
            ),
            Self::DuplicateCustomTag { .. } => Some("Include the %image% placeholder in the tag"),
            Self::CustomTagRequiresRepo => Some("Pass --repo=ADDRESS or set build.repo"),
            Self::ConflictingFlags { .. } => Some("Drop the deprecated flag"),
            Self::LockTimeout { .. } => Some("Raise build.lock_timeout_secs or check for a stuck builder"),
            Self::ConfigNotFound(_) => Some("Create kiln.toml or pass --config"),
            Self::RunIncomplete { .. } => Some("Re-run with -v for build output"),
            _ => None,
        }
    }
}
