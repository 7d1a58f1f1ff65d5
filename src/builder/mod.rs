//! Stage builder abstraction
//!
//! The conveyor never executes instructions itself; it hands a stage's
//! Dockerfile instructions to a `StageBuilder` and gets back a reference to
//! the produced artifact.

pub mod dockerfile;
mod podman;

pub use podman::PodmanStageBuilder;

use crate::error::KilnResult;
use crate::stage::StageKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Max number of output lines to include in build error messages.
const BUILD_ERROR_TAIL_LINES: usize = 50;

/// Addressable identifier of a built image or layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(pub String);

impl ArtifactRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The build environment a stage's instructions run in
#[derive(Debug, Clone)]
pub struct BuildContainer {
    /// Image being built
    pub image: String,
    /// Stage being built
    pub stage: StageKind,
    /// Signature the produced artifact will be stored under
    pub signature: String,
    /// Artifact the instructions run on top of
    pub base: ArtifactRef,
}

/// Executes stage instructions
#[async_trait]
pub trait StageBuilder: Send + Sync {
    /// Run `instructions` on top of `container.base` and commit the result
    async fn build_stage_instructions(
        &self,
        container: &BuildContainer,
        instructions: &[String],
    ) -> KilnResult<ArtifactRef>;

    /// State left behind by a failed build, if the builder keeps one
    async fn failed_state(&self, _container: &BuildContainer) -> KilnResult<Option<ArtifactRef>> {
        Ok(None)
    }

    /// Open an interactive shell in `artifact`; returns when the shell exits
    async fn introspect(&self, artifact: &ArtifactRef) -> KilnResult<()>;

    /// Give `artifact` an additional name
    async fn tag_artifact(&self, artifact: &ArtifactRef, reference: &str) -> KilnResult<()>;

    /// Human-readable builder name for display
    fn builder_name(&self) -> &'static str;
}

/// Extract the useful tail of build output for error diagnostics.
pub(crate) fn build_error_output(lines: &[String]) -> String {
    let total = lines.len();
    let tail = if total > BUILD_ERROR_TAIL_LINES {
        &lines[total - BUILD_ERROR_TAIL_LINES..]
    } else {
        lines
    };
    tail.join("\n")
}

/// Stream stdout+stderr from a child process, calling `on_output` for each line.
///
/// Returns all collected output lines for error reporting. Pipes that were
/// not captured are treated as already closed.
pub(crate) async fn stream_child_output(
    child: &mut tokio::process::Child,
    on_output: &(dyn Fn(&str) + Send + Sync),
) -> Vec<String> {
    let mut stderr_reader = child.stderr.take().map(|s| BufReader::new(s).lines());
    let mut stdout_reader = child.stdout.take().map(|s| BufReader::new(s).lines());

    let mut all_output = Vec::new();
    let mut stderr_done = stderr_reader.is_none();
    let mut stdout_done = stdout_reader.is_none();

    while !stderr_done || !stdout_done {
        tokio::select! {
            line = next_line(&mut stderr_reader), if !stderr_done => {
                match line {
                    Some(line) => {
                        on_output(&line);
                        all_output.push(line);
                    }
                    None => stderr_done = true,
                }
            }
            line = next_line(&mut stdout_reader), if !stdout_done => {
                match line {
                    Some(line) => {
                        on_output(&line);
                        all_output.push(line);
                    }
                    None => stdout_done = true,
                }
            }
        }
    }

    all_output
}

async fn next_line<R>(reader: &mut Option<tokio::io::Lines<BufReader<R>>>) -> Option<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match reader {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_output_keeps_tail() {
        let lines: Vec<String> = (0..80).map(|i| format!("line {}", i)).collect();
        let out = build_error_output(&lines);
        assert!(out.starts_with("line 30"));
        assert!(out.ends_with("line 79"));
    }

    #[test]
    fn error_output_short() {
        let lines = vec!["a".to_string(), "b".to_string()];
        assert_eq!(build_error_output(&lines), "a\nb");
    }

    #[test]
    fn artifact_ref_serializes_transparently() {
        let artifact = ArtifactRef::new("kiln-stages/app:abc");
        assert_eq!(serde_json::to_string(&artifact).unwrap(), "\"kiln-stages/app:abc\"");
    }

    #[tokio::test]
    async fn streams_child_output() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "echo out; echo err 1>&2"])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();

        let lines = stream_child_output(&mut child, &|_| {}).await;
        child.wait().await.unwrap();

        assert!(lines.contains(&"out".to_string()));
        assert!(lines.contains(&"err".to_string()));
    }
}
