//! Build planning
//!
//! Turns the image configuration into ordered stage lists with signatures,
//! grouped into dependency waves: every image in a wave only depends on
//! images from earlier waves.

use crate::builder::dockerfile::{env_instruction, run_instruction};
use crate::config::{Config, ImageConfig};
use crate::error::{KilnError, KilnResult};
use crate::stage::inputs::{dependencies_digest, GitPatchProvider};
use crate::stage::signature::{LocalInputs, SignatureChain};
use crate::stage::StageKind;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::debug;

/// What an image is built on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseRef {
    /// Image pulled from a registry
    Registry(String),
    /// Final artifact of another image of the project
    Image(String),
}

/// One present stage with its computed signature
#[derive(Debug, Clone)]
pub struct PlannedStage {
    pub kind: StageKind,
    /// Signature of the nearest preceding present stage
    pub upstream: String,
    pub signature: String,
    /// Dockerfile instructions executed on top of the upstream artifact
    pub instructions: Vec<String>,
}

/// Ordered stage list for one image
#[derive(Debug, Clone)]
pub struct ImagePlan {
    pub name: String,
    pub base: BaseRef,
    pub stages: Vec<PlannedStage>,
}

impl ImagePlan {
    /// Tag derived from the final stage signature
    pub fn content_based_tag(&self) -> &str {
        self.stages
            .last()
            .map(|s| s.signature.as_str())
            .unwrap_or_default()
    }

    /// Image this one is built on, if any
    pub fn depends_on(&self) -> Option<&str> {
        match &self.base {
            BaseRef::Image(name) => Some(name),
            BaseRef::Registry(_) => None,
        }
    }
}

/// Images grouped into dependency waves
#[derive(Debug, Clone, Default)]
pub struct BuildPlan {
    pub waves: Vec<Vec<ImagePlan>>,
}

impl BuildPlan {
    /// All planned images, wave by wave
    pub fn images(&self) -> impl Iterator<Item = &ImagePlan> {
        self.waves.iter().flatten()
    }

    /// Number of planned images
    pub fn len(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Computes build plans for a configuration
pub struct Planner<'a> {
    config: &'a Config,
    project_dir: &'a Path,
    git: &'a dyn GitPatchProvider,
}

impl<'a> Planner<'a> {
    pub fn new(config: &'a Config, project_dir: &'a Path, git: &'a dyn GitPatchProvider) -> Self {
        Self {
            config,
            project_dir,
            git,
        }
    }

    /// Plan the selected images (all when `selection` is empty).
    ///
    /// Base images of selected images are added automatically. `target`
    /// truncates images that no other planned image builds on.
    pub async fn plan(&self, selection: &[String], target: Option<StageKind>) -> KilnResult<BuildPlan> {
        let selected = self.select(selection)?;
        let waves = dependency_waves(self.config, &selected)?;

        let bases: HashSet<&str> = selected
            .iter()
            .filter_map(|name| self.config.image(name).and_then(|i| i.from_image.as_deref()))
            .collect();

        let mut final_signatures: HashMap<String, String> = HashMap::new();
        let mut planned_waves = Vec::with_capacity(waves.len());

        for wave in waves {
            let mut planned = Vec::with_capacity(wave.len());
            for name in wave {
                let image = self
                    .config
                    .image(&name)
                    .ok_or_else(|| KilnError::UnknownImage(name.clone()))?;
                let truncate_at = if bases.contains(name.as_str()) { None } else { target };
                let plan = self.plan_image(image, &final_signatures, truncate_at).await?;
                final_signatures.insert(name, plan.content_based_tag().to_string());
                planned.push(plan);
            }
            planned_waves.push(planned);
        }

        Ok(BuildPlan {
            waves: planned_waves,
        })
    }

    fn select(&self, selection: &[String]) -> KilnResult<HashSet<String>> {
        if selection.is_empty() {
            return Ok(self.config.images.iter().map(|i| i.name.clone()).collect());
        }

        let mut selected = HashSet::new();
        let mut pending: Vec<String> = selection.to_vec();
        while let Some(name) = pending.pop() {
            let image = self
                .config
                .image(&name)
                .ok_or_else(|| KilnError::UnknownImage(name.clone()))?;
            if selected.insert(name) {
                if let Some(ref base) = image.from_image {
                    pending.push(base.clone());
                }
            }
        }
        Ok(selected)
    }

    async fn plan_image(
        &self,
        image: &ImageConfig,
        final_signatures: &HashMap<String, String>,
        target: Option<StageKind>,
    ) -> KilnResult<ImagePlan> {
        let (base, base_input) = match (&image.from, &image.from_image) {
            (_, Some(dependency)) => {
                let signature = final_signatures.get(dependency).ok_or_else(|| {
                    KilnError::Internal(format!(
                        "image {} planned before its base {}",
                        image.name, dependency
                    ))
                })?;
                (
                    BaseRef::Image(dependency.clone()),
                    format!("image:{}", signature),
                )
            }
            (Some(reference), None) => (BaseRef::Registry(reference.clone()), reference.clone()),
            (None, None) => {
                return Err(KilnError::Internal(format!(
                    "image {} has no base",
                    image.name
                )))
            }
        };

        let mut chain = SignatureChain::new();
        let mut stages = Vec::new();

        for &kind in StageKind::all() {
            if target.is_some_and(|t| kind > t) {
                break;
            }

            let Some((inputs, instructions)) = self.stage_inputs(image, kind, &base_input).await?
            else {
                continue;
            };

            let upstream = chain.upstream().to_string();
            let signature = chain.push(kind, &inputs);
            debug!("{} stage {}: {}", image.name, kind, signature);

            stages.push(PlannedStage {
                kind,
                upstream,
                signature,
                instructions,
            });
        }

        Ok(ImagePlan {
            name: image.name.clone(),
            base,
            stages,
        })
    }

    /// Inputs and instructions of a stage, or `None` if the stage is absent
    async fn stage_inputs(
        &self,
        image: &ImageConfig,
        kind: StageKind,
        base_input: &str,
    ) -> KilnResult<Option<(LocalInputs, Vec<String>)>> {
        let commands = match kind {
            StageKind::From => {
                let inputs = LocalInputs {
                    base: Some(base_input.to_string()),
                    ..Default::default()
                };
                return Ok(Some((inputs, Vec::new())));
            }
            StageKind::DockerInstructions => {
                if image.docker.is_empty() {
                    return Ok(None);
                }
                let inputs = LocalInputs {
                    instructions: image.docker.clone(),
                    ..Default::default()
                };
                return Ok(Some((inputs, image.docker.clone())));
            }
            StageKind::BeforeInstall => &image.before_install,
            StageKind::Install => &image.install,
            StageKind::BeforeSetup => &image.before_setup,
            StageKind::Setup => &image.setup,
        };

        if commands.is_empty() {
            return Ok(None);
        }

        let declared = image
            .dependencies
            .iter()
            .find(|(stage, _)| stage.parse::<StageKind>().ok() == Some(kind))
            .map(|(_, paths)| paths.as_slice())
            .unwrap_or_default();

        let (dependencies_digest, git_patch) = if declared.is_empty() {
            (None, None)
        } else {
            let digest = dependencies_digest(self.project_dir, &image.name, kind, declared)?;
            let patch = self.git.patch(&image.name, kind, declared).await?;
            (Some(digest), patch)
        };

        let shell = image.shell();
        let mut instructions: Vec<String> = image
            .env
            .iter()
            .map(|(key, value)| env_instruction(key, value))
            .collect();
        instructions.extend(commands.iter().map(|cmd| run_instruction(shell, cmd)));

        let inputs = LocalInputs {
            base: None,
            instructions: commands.clone(),
            env: image.env.clone(),
            builder_config: Some(shell.to_string()),
            dependencies_digest,
            git_patch,
        };

        Ok(Some((inputs, instructions)))
    }
}

/// Group images into waves so that every image comes after its base.
///
/// Images keep configuration order within a wave.
pub fn dependency_waves(config: &Config, selected: &HashSet<String>) -> KilnResult<Vec<Vec<String>>> {
    let mut depth: HashMap<&str, usize> = HashMap::new();

    for image in config.images.iter().filter(|i| selected.contains(&i.name)) {
        let mut path: Vec<&str> = Vec::new();
        image_depth(config, &image.name, &mut depth, &mut path)?;
    }

    let max_depth = depth.values().copied().max();
    let mut waves: Vec<Vec<String>> = match max_depth {
        Some(max) => vec![Vec::new(); max + 1],
        None => Vec::new(),
    };

    for image in config.images.iter().filter(|i| selected.contains(&i.name)) {
        if let Some(&d) = depth.get(image.name.as_str()) {
            waves[d].push(image.name.clone());
        }
    }

    Ok(waves)
}

fn image_depth<'c>(
    config: &'c Config,
    name: &'c str,
    depth: &mut HashMap<&'c str, usize>,
    path: &mut Vec<&'c str>,
) -> KilnResult<usize> {
    if let Some(&d) = depth.get(name) {
        return Ok(d);
    }
    if path.contains(&name) {
        path.push(name);
        return Err(KilnError::DependencyCycle(path.join(" -> ")));
    }

    let image = config
        .image(name)
        .ok_or_else(|| KilnError::UnknownImage(name.to_string()))?;

    path.push(name);
    let d = match image.from_image.as_deref() {
        Some(base) => image_depth(config, base, depth, path)? + 1,
        None => 0,
    };
    path.pop();

    depth.insert(name, d);
    Ok(d)
}
