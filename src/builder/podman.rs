//! Podman-backed stage builder
//!
//! Renders each stage as a one-stage Dockerfile in a scratch directory and
//! runs `podman build`. The produced image is named after the stage
//! signature, so identical stages map to identical image names.

use crate::builder::dockerfile::{generate_dockerfile, labels};
use crate::builder::{build_error_output, stream_child_output, ArtifactRef, BuildContainer, StageBuilder};
use crate::error::{KilnError, KilnResult};
use crate::tag::slug::slug;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Stage builder driving the podman CLI
pub struct PodmanStageBuilder {
    binary: String,
    repository: String,
    builds_dir: PathBuf,
}

impl PodmanStageBuilder {
    /// Create a builder storing stage artifacts as `kiln-stages/<project>`
    pub fn new(project: &str, builds_dir: PathBuf) -> Self {
        Self {
            binary: "podman".to_string(),
            repository: format!("kiln-stages/{}", slug(project)),
            builds_dir,
        }
    }

    /// Use a different podman-compatible binary (e.g. `docker`)
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn artifact_name(&self, signature: &str) -> String {
        format!("{}:{}", self.repository, signature)
    }

    async fn prepare_build_dir(
        &self,
        container: &BuildContainer,
        instructions: &[String],
    ) -> KilnResult<PathBuf> {
        let build_dir = self.builds_dir.join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&build_dir)
            .await
            .map_err(|e| KilnError::io("creating build directory", e))?;

        let mut stamp = BTreeMap::new();
        stamp.insert(labels::STAGE_ARTIFACT.to_string(), container.stage.to_string());
        stamp.insert(labels::IMAGE.to_string(), container.image.clone());
        stamp.insert(labels::SIGNATURE.to_string(), container.signature.clone());

        let dockerfile = generate_dockerfile(container.base.as_str(), instructions, &stamp);
        tokio::fs::write(build_dir.join("Dockerfile"), dockerfile)
            .await
            .map_err(|e| KilnError::io("writing Dockerfile", e))?;

        Ok(build_dir)
    }
}

#[async_trait]
impl StageBuilder for PodmanStageBuilder {
    async fn build_stage_instructions(
        &self,
        container: &BuildContainer,
        instructions: &[String],
    ) -> KilnResult<ArtifactRef> {
        let tag = self.artifact_name(&container.signature);
        let build_dir = self.prepare_build_dir(container, instructions).await?;

        info!(
            "Building {} stage {} on {}",
            container.image, container.stage, container.base
        );

        let spawned = Command::new(&self.binary)
            .arg("build")
            .arg("--layers")
            .arg("-t")
            .arg(&tag)
            .arg("-f")
            .arg(build_dir.join("Dockerfile"))
            .arg(&build_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let _ = tokio::fs::remove_dir_all(&build_dir).await;
                return Err(KilnError::command_failed(format!("{} build", self.binary), e));
            }
        };

        let image = container.image.clone();
        let stage = container.stage;
        let output = stream_child_output(&mut child, &move |line| {
            debug!("[{} {}] {}", image, stage, line);
        })
        .await;

        let status = child.wait().await;

        // Clean up build directory (best-effort)
        let _ = tokio::fs::remove_dir_all(&build_dir).await;

        let status = status.map_err(|e| KilnError::command_failed(format!("{} build", self.binary), e))?;
        if !status.success() {
            return Err(KilnError::stage_build(
                &container.image,
                container.stage.to_string(),
                format!(
                    "{} build exited with {}\n{}",
                    self.binary,
                    status,
                    build_error_output(&output)
                ),
            ));
        }

        Ok(ArtifactRef::new(tag))
    }

    async fn introspect(&self, artifact: &ArtifactRef) -> KilnResult<()> {
        info!("Opening shell in {} (exit to continue)", artifact);

        let status = Command::new(&self.binary)
            .args(["run", "-it", "--rm", "--entrypoint", "/bin/sh"])
            .arg(artifact.as_str())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| KilnError::command_failed(format!("{} run", self.binary), e))?;

        debug!("Introspection shell exited with {}", status);
        Ok(())
    }

    async fn tag_artifact(&self, artifact: &ArtifactRef, reference: &str) -> KilnResult<()> {
        let output = Command::new(&self.binary)
            .arg("tag")
            .arg(artifact.as_str())
            .arg(reference)
            .output()
            .await
            .map_err(|e| KilnError::command_failed(format!("{} tag", self.binary), e))?;

        if !output.status.success() {
            return Err(KilnError::command_exec(
                format!("{} tag {} {}", self.binary, artifact, reference),
                String::from_utf8_lossy(&output.stderr),
            ));
        }

        debug!("Tagged {} as {}", artifact, reference);
        Ok(())
    }

    fn builder_name(&self) -> &'static str {
        "podman"
    }
}
