//! Per-image and per-run build results

use crate::builder::ArtifactRef;
use crate::error::{ErrorKind, KilnError};
use crate::stage::{ImagePlan, StageKind};
use serde::Serialize;
use std::fmt;

/// Final state of one image pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Built,
    Failed,
    Cancelled,
    /// Never started because a base image was not built
    Skipped,
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Built => "built",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// What happened to one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    /// Reused from the stages storage cache
    Cached,
    Built,
    Failed,
    /// Not reached
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: StageKind,
    pub signature: String,
    pub outcome: StageOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageOutcome {
    #[serde(skip)]
    pub image: String,
    pub status: ImageStatus,
    pub content_based_tag: String,
    /// Final stage artifact
    pub artifact: Option<ArtifactRef>,
    /// Published reference of the image
    pub reference: Option<String>,
    pub custom_tags: Vec<String>,
    pub stages: Vec<StageReport>,
    pub error: Option<String>,
    #[serde(skip)]
    pub error_kind: Option<ErrorKind>,
}

impl ImageOutcome {
    /// Outcome with every stage still pending
    pub(crate) fn pending(plan: &ImagePlan) -> Self {
        Self {
            image: plan.name.clone(),
            status: ImageStatus::Skipped,
            content_based_tag: plan.content_based_tag().to_string(),
            artifact: None,
            reference: None,
            custom_tags: Vec::new(),
            stages: plan
                .stages
                .iter()
                .map(|s| StageReport {
                    stage: s.kind,
                    signature: s.signature.clone(),
                    outcome: StageOutcome::Skipped,
                })
                .collect(),
            error: None,
            error_kind: None,
        }
    }

    /// Image that was never started
    pub(crate) fn skipped(plan: &ImagePlan, reason: impl Into<String>) -> Self {
        let mut outcome = Self::pending(plan);
        outcome.error = Some(reason.into());
        outcome
    }

    /// Image stopped before it started
    pub(crate) fn cancelled(plan: &ImagePlan) -> Self {
        let mut outcome = Self::pending(plan);
        outcome.status = ImageStatus::Cancelled;
        outcome.error = Some(KilnError::Cancelled.to_string());
        outcome.error_kind = Some(ErrorKind::Cancelled);
        outcome
    }

    pub(crate) fn fail(&mut self, err: &KilnError) {
        self.status = match err.kind() {
            ErrorKind::Cancelled => ImageStatus::Cancelled,
            _ => ImageStatus::Failed,
        };
        self.error = Some(err.to_string());
        self.error_kind = Some(err.kind());
    }

    pub fn is_built(&self) -> bool {
        self.status == ImageStatus::Built
    }

    /// Number of stages with the given outcome
    pub fn count(&self, outcome: StageOutcome) -> usize {
        self.stages.iter().filter(|s| s.outcome == outcome).count()
    }
}

/// Aggregated outcome of a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub images: Vec<ImageOutcome>,
}

impl RunSummary {
    /// True when every image was built
    pub fn is_success(&self) -> bool {
        self.images.iter().all(ImageOutcome::is_built)
    }

    pub fn count(&self, status: ImageStatus) -> usize {
        self.images.iter().filter(|i| i.status == status).count()
    }

    pub fn image(&self, name: &str) -> Option<&ImageOutcome> {
        self.images.iter().find(|i| i.image == name)
    }

    /// First broken-invariant error, which must end the run
    pub fn internal_error(&self) -> Option<&ImageOutcome> {
        self.images
            .iter()
            .find(|i| i.error_kind == Some(ErrorKind::Internal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{BaseRef, PlannedStage};

    fn plan() -> ImagePlan {
        ImagePlan {
            name: "app".to_string(),
            base: BaseRef::Registry("alpine".to_string()),
            stages: vec![
                PlannedStage {
                    kind: StageKind::From,
                    upstream: "0".into(),
                    signature: "s1".into(),
                    instructions: vec![],
                },
                PlannedStage {
                    kind: StageKind::Setup,
                    upstream: "s1".into(),
                    signature: "s2".into(),
                    instructions: vec![],
                },
            ],
        }
    }

    #[test]
    fn pending_outcome_lists_all_stages() {
        let outcome = ImageOutcome::pending(&plan());
        assert_eq!(outcome.count(StageOutcome::Skipped), 2);
        assert_eq!(outcome.content_based_tag, "s2");
    }

    #[test]
    fn fail_classifies_cancellation() {
        let mut outcome = ImageOutcome::pending(&plan());
        outcome.fail(&KilnError::Cancelled);
        assert_eq!(outcome.status, ImageStatus::Cancelled);

        outcome.fail(&KilnError::stage_build("app", "setup", "exit 1"));
        assert_eq!(outcome.status, ImageStatus::Failed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Build));
    }

    #[test]
    fn summary_success_requires_all_built() {
        let mut built = ImageOutcome::pending(&plan());
        built.status = ImageStatus::Built;
        let skipped = ImageOutcome::skipped(&plan(), "base failed");

        let summary = RunSummary {
            images: vec![built.clone()],
        };
        assert!(summary.is_success());

        let summary = RunSummary {
            images: vec![built, skipped],
        };
        assert!(!summary.is_success());
        assert_eq!(summary.count(ImageStatus::Skipped), 1);
    }
}
