//! Test doubles for pipeline and scheduler tests

use crate::builder::{ArtifactRef, BuildContainer, StageBuilder};
use crate::error::{KilnError, KilnResult};
use crate::stage::{BaseRef, ImagePlan, PlannedStage, StageKind, ROOT_SIGNATURE};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Builder that records calls instead of running anything
#[derive(Default)]
pub struct ScriptedBuilder {
    delay: Mutex<Duration>,
    failing: Mutex<HashSet<String>>,
    broken: Mutex<HashSet<String>>,
    builds: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
    bases: Mutex<Vec<String>>,
    introspected: Mutex<Vec<ArtifactRef>>,
    tagged: Mutex<Vec<String>>,
}

impl ScriptedBuilder {
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Fail builds of the stage with this signature
    pub fn fail_on(&self, signature: &str) {
        self.failing.lock().unwrap().insert(signature.to_string());
    }

    /// Report a broken invariant when building this signature
    pub fn break_on(&self, signature: &str) {
        self.broken.lock().unwrap().insert(signature.to_string());
    }

    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    /// Highest number of builds that ran at the same time
    pub fn max_concurrent(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn bases(&self) -> Vec<String> {
        self.bases.lock().unwrap().clone()
    }

    pub fn introspected(&self) -> Vec<ArtifactRef> {
        self.introspected.lock().unwrap().clone()
    }

    pub fn tagged(&self) -> Vec<String> {
        self.tagged.lock().unwrap().clone()
    }
}

struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StageBuilder for ScriptedBuilder {
    async fn build_stage_instructions(
        &self,
        container: &BuildContainer,
        _instructions: &[String],
    ) -> KilnResult<ArtifactRef> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        self.bases.lock().unwrap().push(container.base.to_string());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let _running = Running(&self.running);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if self.broken.lock().unwrap().contains(&container.signature) {
            return Err(KilnError::Internal(format!(
                "scripted breakage at {}",
                container.signature
            )));
        }
        if self.failing.lock().unwrap().contains(&container.signature) {
            return Err(KilnError::stage_build(
                &container.image,
                container.stage.to_string(),
                "exit status 1",
            ));
        }
        Ok(ArtifactRef::new(format!("kiln-stages/test:{}", container.signature)))
    }

    async fn introspect(&self, artifact: &ArtifactRef) -> KilnResult<()> {
        self.introspected.lock().unwrap().push(artifact.clone());
        Ok(())
    }

    async fn tag_artifact(&self, _artifact: &ArtifactRef, reference: &str) -> KilnResult<()> {
        self.tagged.lock().unwrap().push(reference.to_string());
        Ok(())
    }

    fn builder_name(&self) -> &'static str {
        "scripted"
    }
}

/// Image plan from a registry base with one stage per signature
pub fn plan_for(name: &str, signatures: &[&str]) -> ImagePlan {
    let mut upstream = ROOT_SIGNATURE.to_string();
    let stages = signatures
        .iter()
        .zip(StageKind::all())
        .map(|(signature, &kind)| {
            let stage = PlannedStage {
                kind,
                upstream: upstream.clone(),
                signature: signature.to_string(),
                instructions: Vec::new(),
            };
            upstream = signature.to_string();
            stage
        })
        .collect();

    ImagePlan {
        name: name.to_string(),
        base: BaseRef::Registry("alpine:3.19".to_string()),
        stages,
    }
}
