//! Bounded parallel execution of image pipelines
//!
//! Waves run one after another. Inside a wave every image gets its own
//! task, and a semaphore caps how many pipelines run at once.

use crate::builder::ArtifactRef;
use crate::conveyor::outcome::{ImageOutcome, RunSummary};
use crate::conveyor::pipeline::Conveyor;
use crate::error::{KilnError, KilnResult};
use crate::stage::BuildPlan;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub struct ParallelScheduler {
    /// Max concurrent pipelines; `None` = unbounded
    limit: Option<usize>,
}

impl ParallelScheduler {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit: limit.map(|l| l.max(1)),
        }
    }

    pub fn sequential() -> Self {
        Self::new(Some(1))
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Build every planned image.
    ///
    /// Image failures are collected into the summary. A broken internal
    /// invariant stops the run after the current wave: later images are
    /// reported as skipped and `RunSummary::internal_error` names the cause.
    /// Only a panicked pipeline task is returned as an error.
    pub async fn run(&self, plan: &BuildPlan, conveyor: Arc<Conveyor>) -> KilnResult<RunSummary> {
        let semaphore = self.limit.map(|limit| Arc::new(Semaphore::new(limit)));
        let mut artifacts: HashMap<String, ArtifactRef> = HashMap::new();
        let mut summary = RunSummary::default();

        for (wave_index, wave) in plan.waves.iter().enumerate() {
            debug!("Wave {}: {} image(s)", wave_index + 1, wave.len());

            let mut slots: Vec<Option<ImageOutcome>> = vec![None; wave.len()];
            let mut tasks = JoinSet::new();

            for (index, image) in wave.iter().enumerate() {
                if let Some(dependency) = image.depends_on() {
                    if !artifacts.contains_key(dependency) {
                        warn!("Skipping {}: base image {} was not built", image.name, dependency);
                        slots[index] = Some(ImageOutcome::skipped(
                            image,
                            format!("base image {} was not built", dependency),
                        ));
                        continue;
                    }
                }

                if conveyor.is_cancelled() {
                    slots[index] = Some(ImageOutcome::cancelled(image));
                    continue;
                }

                let bases: HashMap<String, ArtifactRef> = image
                    .depends_on()
                    .and_then(|d| artifacts.get_key_value(d))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .into_iter()
                    .collect();
                let semaphore = semaphore.clone();
                let conveyor = conveyor.clone();
                let image = image.clone();

                tasks.spawn(async move {
                    let _permit = match semaphore {
                        Some(semaphore) => semaphore.acquire_owned().await.ok(),
                        None => None,
                    };
                    let outcome = conveyor.build_image(&image, &bases).await;
                    (index, outcome)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (index, outcome) = joined
                    .map_err(|e| KilnError::Internal(format!("image pipeline task failed: {}", e)))?;
                slots[index] = Some(outcome);
            }

            for outcome in slots.into_iter().flatten() {
                if let Some(artifact) = outcome.artifact.as_ref().filter(|_| outcome.is_built()) {
                    artifacts.insert(outcome.image.clone(), artifact.clone());
                }
                summary.images.push(outcome);
            }

            if let Some(broken) = summary.internal_error() {
                error!("Stopping run after internal error in {}", broken.image);
                let reason = format!("run stopped after an internal error in {}", broken.image);
                let remaining: Vec<ImageOutcome> = plan.waves[wave_index + 1..]
                    .iter()
                    .flatten()
                    .map(|image| ImageOutcome::skipped(image, reason.clone()))
                    .collect();
                summary.images.extend(remaining);
                return Ok(summary);
            }
        }

        info!(
            "Run finished: {} of {} image(s) built",
            summary.images.iter().filter(|i| i.is_built()).count(),
            summary.images.len()
        );
        Ok(summary)
    }
}
