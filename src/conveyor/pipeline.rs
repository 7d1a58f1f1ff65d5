//! Per-image stage pipeline
//!
//! For each stage: look the signature up in the stages storage cache; on a
//! miss take the stage lock, look again (another builder may have finished
//! the stage while we waited), build, store, release. Locks are released on
//! every path, including failures and cancellation.

use crate::builder::{ArtifactRef, BuildContainer, StageBuilder};
use crate::conveyor::options::ConveyorOptions;
use crate::conveyor::outcome::{ImageOutcome, ImageStatus, StageOutcome};
use crate::error::{ErrorKind, KilnError, KilnResult};
use crate::stage::{BaseRef, ImagePlan, PlannedStage};
use crate::storage::lock::cancelled;
use crate::storage::{CacheEntry, LockHandle, LockManager, LockOptions, StagesStorageCache};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Runs image pipelines against one set of backends
pub struct Conveyor {
    builder: Arc<dyn StageBuilder>,
    cache: Arc<dyn StagesStorageCache>,
    locks: Arc<dyn LockManager>,
    options: ConveyorOptions,
    cancel: watch::Receiver<bool>,
}

impl Conveyor {
    pub fn new(
        builder: Arc<dyn StageBuilder>,
        cache: Arc<dyn StagesStorageCache>,
        locks: Arc<dyn LockManager>,
        options: ConveyorOptions,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            builder,
            cache,
            locks,
            options,
            cancel,
        }
    }

    /// Whether the run was interrupted
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Lock key guarding the build of one stage
    pub fn lock_key(signature: &str) -> String {
        format!("stage-{}", signature)
    }

    /// Build one image. `bases` holds the final artifacts of images this
    /// one may be built on.
    pub async fn build_image(
        &self,
        plan: &ImagePlan,
        bases: &HashMap<String, ArtifactRef>,
    ) -> ImageOutcome {
        let mut outcome = ImageOutcome::pending(plan);

        let mut base = match &plan.base {
            BaseRef::Registry(reference) => ArtifactRef::new(reference.clone()),
            BaseRef::Image(name) => match bases.get(name) {
                Some(artifact) => artifact.clone(),
                None => {
                    outcome.fail(&KilnError::Internal(format!(
                        "image {} started before its base {}",
                        plan.name, name
                    )));
                    return outcome;
                }
            },
        };

        info!("Building image {}", plan.name);

        for (index, stage) in plan.stages.iter().enumerate() {
            if self.is_cancelled() {
                outcome.fail(&KilnError::Cancelled);
                return outcome;
            }

            match self.run_stage(plan, stage, &base).await {
                Ok((artifact, stage_outcome)) => {
                    outcome.stages[index].outcome = stage_outcome;
                    base = artifact;
                }
                Err(err) => {
                    match err.kind() {
                        ErrorKind::Cancelled => {
                            info!("Image {} cancelled at stage {}", plan.name, stage.kind);
                        }
                        kind => {
                            outcome.stages[index].outcome = StageOutcome::Failed;
                            if kind == ErrorKind::Build {
                                self.introspect_failure(plan, stage, &base).await;
                            }
                            warn!("Image {} failed at stage {}: {}", plan.name, stage.kind, err);
                        }
                    }
                    outcome.fail(&err);
                    return outcome;
                }
            }
        }

        if let Err(err) = self.publish(plan, &base, &mut outcome).await {
            outcome.fail(&err);
            return outcome;
        }

        outcome.artifact = Some(base);
        outcome.status = ImageStatus::Built;
        info!(
            "Image {} ready ({} cached, {} built)",
            plan.name,
            outcome.count(StageOutcome::Cached),
            outcome.count(StageOutcome::Built)
        );
        outcome
    }

    async fn run_stage(
        &self,
        plan: &ImagePlan,
        stage: &PlannedStage,
        base: &ArtifactRef,
    ) -> KilnResult<(ArtifactRef, StageOutcome)> {
        if let Some(entry) = self.cache.get(&stage.signature).await? {
            info!("{} stage {}: using cache {}", plan.name, stage.kind, entry.artifact);
            return Ok((entry.artifact, StageOutcome::Cached));
        }

        let key = Self::lock_key(&stage.signature);
        debug!("{} stage {}: waiting for lock {}", plan.name, stage.kind, key);
        let handle = self.acquire(&key).await?;

        let result = self.build_locked(plan, stage, base).await;

        self.release(&handle).await;
        result
    }

    async fn acquire(&self, key: &str) -> KilnResult<LockHandle> {
        let opts = LockOptions {
            timeout: self.options.lock_timeout,
            non_blocking: false,
        };
        self.locks
            .acquire_or_cancel(key, opts, self.cancel.clone())
            .await
    }

    async fn release(&self, handle: &LockHandle) {
        if let Err(e) = self.locks.release(handle).await {
            warn!("Failed to release lock {}: {}", handle.key, e);
        }
    }

    async fn build_locked(
        &self,
        plan: &ImagePlan,
        stage: &PlannedStage,
        base: &ArtifactRef,
    ) -> KilnResult<(ArtifactRef, StageOutcome)> {
        if let Some(entry) = self.cache.get(&stage.signature).await? {
            info!(
                "{} stage {}: built concurrently, using cache {}",
                plan.name, stage.kind, entry.artifact
            );
            return Ok((entry.artifact, StageOutcome::Cached));
        }

        let container = container(plan, stage, base);
        let mut cancel = self.cancel.clone();

        let artifact = tokio::select! {
            biased;
            _ = cancelled(&mut cancel) => Err(KilnError::Cancelled),
            built = self.builder.build_stage_instructions(&container, &stage.instructions) => built,
        }?;

        let entry = CacheEntry::new(
            &stage.signature,
            &plan.name,
            stage.kind,
            artifact.clone(),
            self.builder.builder_name(),
        );
        self.cache.put(&stage.signature, &entry).await?;

        info!("{} stage {}: built {}", plan.name, stage.kind, artifact);
        Ok((artifact, StageOutcome::Built))
    }

    async fn introspect_failure(&self, plan: &ImagePlan, stage: &PlannedStage, base: &ArtifactRef) {
        let introspect = self.options.introspect;

        if introspect.before_error {
            info!("Introspecting {} before stage {}", plan.name, stage.kind);
            if let Err(e) = self.builder.introspect(base).await {
                warn!("Introspection failed: {}", e);
            }
        }

        if introspect.error {
            let target = match self.builder.failed_state(&container(plan, stage, base)).await {
                Ok(Some(state)) => state,
                Ok(None) => {
                    warn!(
                        "{} keeps no failed state, introspecting the stage base instead",
                        self.builder.builder_name()
                    );
                    base.clone()
                }
                Err(e) => {
                    warn!("Could not get failed state: {}", e);
                    base.clone()
                }
            };
            info!("Introspecting failed stage {} of {}", stage.kind, plan.name);
            if let Err(e) = self.builder.introspect(&target).await {
                warn!("Introspection failed: {}", e);
            }
        }
    }

    /// Give the finished image its repository and custom tags
    async fn publish(
        &self,
        plan: &ImagePlan,
        artifact: &ArtifactRef,
        outcome: &mut ImageOutcome,
    ) -> KilnResult<()> {
        if !self.options.tag_images || !self.options.has_remote_repo() {
            outcome.reference = Some(artifact.to_string());
            return Ok(());
        }

        let repo = &self.options.repo;
        let content_reference = format!("{}:{}", repo, plan.content_based_tag());
        self.builder.tag_artifact(artifact, &content_reference).await?;

        let resolved = self
            .options
            .custom_tags
            .resolve(&plan.name, plan.content_based_tag());
        for tag in &resolved.tags {
            self.builder
                .tag_artifact(artifact, &format!("{}:{}", repo, tag))
                .await?;
        }

        outcome.reference = Some(match &resolved.use_tag {
            Some(tag) => format!("{}:{}", repo, tag),
            None => content_reference,
        });
        outcome.custom_tags = resolved.tags;
        Ok(())
    }
}

fn container(plan: &ImagePlan, stage: &PlannedStage, base: &ArtifactRef) -> BuildContainer {
    BuildContainer {
        image: plan.name.clone(),
        stage: stage.kind,
        signature: stage.signature.clone(),
        base: base.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conveyor::testing::{plan_for, ScriptedBuilder};
    use crate::storage::{FileStagesStorageCache, LocalLockManager};
    use crate::tag::CustomTags;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        builder: Arc<ScriptedBuilder>,
        cache: Arc<FileStagesStorageCache>,
        locks: Arc<LocalLockManager>,
        cancel: watch::Sender<bool>,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let (cancel, _) = watch::channel(false);
            Self {
                builder: Arc::new(ScriptedBuilder::default()),
                cache: Arc::new(FileStagesStorageCache::new(temp.path().join("cache"))),
                locks: Arc::new(LocalLockManager::new(temp.path().join("locks"))),
                cancel,
                _temp: temp,
            }
        }

        fn conveyor(&self, options: ConveyorOptions) -> Conveyor {
            Conveyor::new(
                self.builder.clone(),
                self.cache.clone(),
                self.locks.clone(),
                options,
                self.cancel.subscribe(),
            )
        }
    }

    #[tokio::test]
    async fn second_run_is_fully_cached() {
        let fx = Fixture::new();
        let conveyor = fx.conveyor(ConveyorOptions::default());
        let plan = plan_for("app", &["s1", "s2", "s3"]);

        let first = conveyor.build_image(&plan, &HashMap::new()).await;
        assert_eq!(first.status, ImageStatus::Built);
        assert_eq!(first.count(StageOutcome::Built), 3);

        let second = conveyor.build_image(&plan, &HashMap::new()).await;
        assert_eq!(second.status, ImageStatus::Built);
        assert_eq!(second.count(StageOutcome::Cached), 3);
        assert_eq!(fx.builder.build_count(), 3);
        assert_eq!(first.artifact, second.artifact);
    }

    #[tokio::test]
    async fn racing_pipelines_build_once() {
        let fx = Fixture::new();
        fx.builder.set_delay(Duration::from_millis(300));
        let conveyor = Arc::new(fx.conveyor(ConveyorOptions::default()));
        let plan = plan_for("app", &["shared"]);

        let a = {
            let conveyor = conveyor.clone();
            let plan = plan.clone();
            tokio::spawn(async move { conveyor.build_image(&plan, &HashMap::new()).await })
        };
        let b = {
            let conveyor = conveyor.clone();
            let plan = plan.clone();
            tokio::spawn(async move { conveyor.build_image(&plan, &HashMap::new()).await })
        };

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(a.is_built() && b.is_built());
        assert_eq!(fx.builder.build_count(), 1);

        let mut outcomes = vec![a.stages[0].outcome, b.stages[0].outcome];
        outcomes.sort_by_key(|o| *o == StageOutcome::Cached);
        assert_eq!(outcomes, vec![StageOutcome::Built, StageOutcome::Cached]);
    }

    #[tokio::test]
    async fn failure_stops_image_and_releases_lock() {
        let fx = Fixture::new();
        fx.builder.fail_on("s2");
        let conveyor = fx.conveyor(ConveyorOptions::default());
        let plan = plan_for("app", &["s1", "s2", "s3"]);

        let outcome = conveyor.build_image(&plan, &HashMap::new()).await;
        assert_eq!(outcome.status, ImageStatus::Failed);
        let stages: Vec<_> = outcome.stages.iter().map(|s| s.outcome).collect();
        assert_eq!(
            stages,
            vec![StageOutcome::Built, StageOutcome::Failed, StageOutcome::Skipped]
        );
        assert!(outcome.error.unwrap().contains("app"));

        assert!(fx.locks.try_acquire(&Conveyor::lock_key("s2")).await.unwrap().is_some());
        assert!(fx.cache.get("s2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancellation_releases_lock_and_reports_partial() {
        let fx = Fixture::new();
        fx.builder.set_delay(Duration::from_secs(30));
        let conveyor = Arc::new(fx.conveyor(ConveyorOptions::default()));
        let plan = plan_for("app", &["s1", "s2"]);

        let task = {
            let conveyor = conveyor.clone();
            tokio::spawn(async move { conveyor.build_image(&plan, &HashMap::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        fx.cancel.send(true).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.status, ImageStatus::Cancelled);
        assert_eq!(outcome.count(StageOutcome::Skipped), 2);
        assert!(fx.locks.try_acquire(&Conveyor::lock_key("s1")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancelled_lock_wait_gives_up() {
        let fx = Fixture::new();
        let _held = fx
            .locks
            .try_acquire(&Conveyor::lock_key("s1"))
            .await
            .unwrap()
            .unwrap();
        let conveyor = Arc::new(fx.conveyor(ConveyorOptions::default()));
        let plan = plan_for("app", &["s1"]);

        let task = {
            let conveyor = conveyor.clone();
            tokio::spawn(async move { conveyor.build_image(&plan, &HashMap::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        fx.cancel.send(true).unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.status, ImageStatus::Cancelled);
        assert_eq!(fx.builder.build_count(), 0);
    }

    #[tokio::test]
    async fn lock_timeout_fails_image() {
        let fx = Fixture::new();
        let _held = fx
            .locks
            .try_acquire(&Conveyor::lock_key("s1"))
            .await
            .unwrap()
            .unwrap();
        let conveyor = fx.conveyor(ConveyorOptions {
            lock_timeout: Some(Duration::from_millis(200)),
            ..Default::default()
        });

        let outcome = conveyor
            .build_image(&plan_for("app", &["s1"]), &HashMap::new())
            .await;
        assert_eq!(outcome.status, ImageStatus::Failed);
        assert_eq!(outcome.error_kind, Some(ErrorKind::Infrastructure));
    }

    #[tokio::test]
    async fn introspects_base_before_failed_stage() {
        let fx = Fixture::new();
        fx.builder.fail_on("s2");
        let conveyor = fx.conveyor(ConveyorOptions {
            introspect: crate::conveyor::IntrospectOptions {
                before_error: true,
                error: true,
            },
            ..Default::default()
        });

        conveyor
            .build_image(&plan_for("app", &["s1", "s2"]), &HashMap::new())
            .await;

        // No failed state is kept, so both shells open in the s1 artifact
        let shells = fx.builder.introspected();
        assert_eq!(shells.len(), 2);
        assert!(shells.iter().all(|a| a.as_str().ends_with(":s1")));
    }

    #[tokio::test]
    async fn publishes_custom_tags_to_repo() {
        let fx = Fixture::new();
        let custom_tags = CustomTags::compile(
            Some("%image%-release"),
            &["%image%-latest".to_string()],
            &["app"],
            "registry.local/shop",
        )
        .unwrap();
        let conveyor = fx.conveyor(ConveyorOptions {
            repo: "registry.local/shop".to_string(),
            custom_tags,
            ..Default::default()
        });

        let outcome = conveyor
            .build_image(&plan_for("app", &["s1", "s2"]), &HashMap::new())
            .await;

        assert_eq!(outcome.reference.as_deref(), Some("registry.local/shop:app-release"));
        assert_eq!(outcome.custom_tags, vec!["app-release", "app-latest"]);
        let tagged = fx.builder.tagged();
        assert!(tagged.contains(&"registry.local/shop:s2".to_string()));
        assert!(tagged.contains(&"registry.local/shop:app-latest".to_string()));
    }

    #[tokio::test]
    async fn dependent_image_builds_on_base_artifact() {
        let fx = Fixture::new();
        let conveyor = fx.conveyor(ConveyorOptions::default());
        let mut plan = plan_for("app", &["s1"]);
        plan.base = BaseRef::Image("base".to_string());

        let missing = conveyor.build_image(&plan, &HashMap::new()).await;
        assert_eq!(missing.error_kind, Some(ErrorKind::Internal));

        let mut bases = HashMap::new();
        bases.insert("base".to_string(), ArtifactRef::new("kiln-stages/test:base-final"));
        let outcome = conveyor.build_image(&plan, &bases).await;
        assert!(outcome.is_built());
        assert_eq!(fx.builder.bases(), vec!["kiln-stages/test:base-final".to_string()]);
    }
}
