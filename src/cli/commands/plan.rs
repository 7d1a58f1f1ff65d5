//! Plan command - signatures and cache status, no locks, no builds

use super::{target_stage, Project};
use crate::cli::args::PlanArgs;
use crate::error::KilnResult;
use crate::stage::{BuildPlan, StageKind};
use crate::storage::{create_stages_storage_cache, StagesStorageCache, StoragePaths};
use crate::ui::{self, UiContext};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Serialize)]
struct PlannedImage {
    content_based_tag: String,
    /// Wave the image is built in, starting at 0
    wave: usize,
    stages: Vec<PlannedStageStatus>,
}

#[derive(Debug, Serialize)]
struct PlannedStageStatus {
    stage: StageKind,
    signature: String,
    cached: bool,
}

/// Execute the plan command
pub async fn execute(args: PlanArgs, config_path: Option<&Path>) -> KilnResult<()> {
    let project = Project::load(config_path).await?;
    let sync = project.synchronization(&args.sync)?;
    let target = target_stage(&args.sync)?;

    let plan = project.plan(&args.images, target).await?;
    let cache = create_stages_storage_cache(&sync, &StoragePaths::default(), &project.config.cluster)?;
    let images = cache_status(&plan, cache.as_ref()).await?;

    if args.json {
        let images: BTreeMap<&str, &PlannedImage> =
            images.iter().map(|(name, image)| (name.as_str(), image)).collect();
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "images": images }))?);
        return Ok(());
    }

    let ctx = UiContext::detect();
    if images.is_empty() {
        ui::step_warn(&ctx, "No images configured");
        return Ok(());
    }

    ui::intro(&ctx, &format!("kiln plan ({} via {})", project.config.project, sync));
    for (name, image) in &images {
        let cached = image.stages.iter().filter(|s| s.cached).count();
        ui::section(
            &ctx,
            &format!(
                "{} (wave {}, {}/{} stages cached)",
                name,
                image.wave + 1,
                cached,
                image.stages.len()
            ),
        );
        for stage in &image.stages {
            ui::remark(
                &ctx,
                &format!(
                    "{:<20} {} {}",
                    stage.stage.to_string(),
                    stage.signature,
                    if stage.cached { "cached" } else { "to build" }
                ),
            );
        }
    }
    Ok(())
}

/// Look every planned stage up in the cache, in plan order
async fn cache_status(
    plan: &BuildPlan,
    cache: &dyn StagesStorageCache,
) -> KilnResult<Vec<(String, PlannedImage)>> {
    let mut images = Vec::with_capacity(plan.len());

    for (wave, planned) in plan.waves.iter().enumerate() {
        for image in planned {
            let mut stages = Vec::with_capacity(image.stages.len());
            for stage in &image.stages {
                stages.push(PlannedStageStatus {
                    stage: stage.kind,
                    signature: stage.signature.clone(),
                    cached: cache.get(&stage.signature).await?.is_some(),
                });
            }
            images.push((
                image.name.clone(),
                PlannedImage {
                    content_based_tag: image.content_based_tag().to_string(),
                    wave,
                    stages,
                },
            ));
        }
    }

    Ok(images)
}
