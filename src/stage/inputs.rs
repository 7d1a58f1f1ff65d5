//! Stage input collection
//!
//! Hashes the files a stage declares as dependencies and obtains optional
//! git patch content. Same files = same digest, regardless of timestamps.

use crate::error::{KilnError, KilnResult};
use crate::stage::StageKind;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;
use walkdir::WalkDir;

/// Hash a file's contents using SHA256
fn hash_file_contents(path: &Path) -> KilnResult<String> {
    let contents = fs::read(path).map_err(|e| KilnError::Io {
        context: format!("reading stage dependency {}", path.display()),
        source: e,
    })?;

    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Ok(hex::encode(hasher.finalize()))
}

/// Digest the declared dependency paths of one stage.
///
/// Directories are walked recursively in sorted order. Each file contributes
/// its path relative to `project_dir` and its content hash.
pub fn dependencies_digest(
    project_dir: &Path,
    image: &str,
    stage: StageKind,
    paths: &[String],
) -> KilnResult<String> {
    let mut files: Vec<(String, PathBuf)> = Vec::new();

    for declared in paths {
        let root = project_dir.join(declared);
        if !root.exists() {
            return Err(KilnError::StageDependencyMissing {
                image: image.to_string(),
                stage: stage.to_string(),
                path: root,
            });
        }

        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(|e| KilnError::Io {
                context: format!("walking stage dependency {}", root.display()),
                source: e.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(project_dir)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            files.push((relative, entry.path().to_path_buf()));
        }
    }

    files.sort_by(|a, b| a.0.cmp(&b.0));
    files.dedup_by(|a, b| a.0 == b.0);

    let mut hasher = Sha256::new();
    for (relative, path) in &files {
        hasher.update(relative.as_bytes());
        hasher.update([0u8]);
        hasher.update(hash_file_contents(path)?.as_bytes());
        hasher.update(b"\n");
    }

    debug!(
        "Hashed {} dependency file(s) for {} stage {}",
        files.len(),
        image,
        stage
    );
    Ok(hex::encode(hasher.finalize()))
}

/// Source of git patch content for user stages
///
/// The patch is opaque here: it only contributes to the stage checksum.
#[async_trait]
pub trait GitPatchProvider: Send + Sync {
    /// Patch bytes for the given stage, or `None` when there are no changes
    async fn patch(
        &self,
        image: &str,
        stage: StageKind,
        paths: &[String],
    ) -> KilnResult<Option<Vec<u8>>>;
}

/// Provider for projects without git tracking
pub struct NoGitPatches;

#[async_trait]
impl GitPatchProvider for NoGitPatches {
    async fn patch(&self, _: &str, _: StageKind, _: &[String]) -> KilnResult<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Uncommitted changes of the stage's dependency paths via `git diff`
pub struct GitDiffPatchProvider {
    repo_dir: PathBuf,
}

impl GitDiffPatchProvider {
    pub fn new(repo_dir: PathBuf) -> Self {
        Self { repo_dir }
    }
}

#[async_trait]
impl GitPatchProvider for GitDiffPatchProvider {
    async fn patch(
        &self,
        image: &str,
        stage: StageKind,
        paths: &[String],
    ) -> KilnResult<Option<Vec<u8>>> {
        if paths.is_empty() {
            return Ok(None);
        }

        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_dir)
            .args(["diff", "--binary", "HEAD", "--"])
            .args(paths)
            .output()
            .await
            .map_err(|e| KilnError::command_failed("git diff", e))?;

        if !output.status.success() {
            return Err(KilnError::command_exec(
                "git diff",
                String::from_utf8_lossy(&output.stderr),
            ));
        }

        if output.stdout.is_empty() {
            return Ok(None);
        }

        debug!(
            "Git patch of {} bytes for {} stage {}",
            output.stdout.len(),
            image,
            stage
        );
        Ok(Some(output.stdout))
    }
}
