//! Build command - run the conveyor over the planned images

use super::{shutdown_signal, target_stage, Project};
use crate::builder::PodmanStageBuilder;
use crate::cli::args::BuildArgs;
use crate::config::Config;
use crate::conveyor::{
    parallel_limit, resolve_report, write_report, Conveyor, ConveyorOptions, ImageStatus,
    IntrospectOptions, ParallelScheduler, ReportFlags, ReportOptions, RunSummary,
};
use crate::error::{KilnError, KilnResult};
use crate::stage::StageKind;
use crate::storage::{create_lock_manager, create_stages_storage_cache, StoragePaths};
use crate::tag::CustomTags;
use crate::ui::{self, RunSpinner, UiContext};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Everything a run needs besides the plan and the backends
#[derive(Debug)]
struct RunSettings {
    options: ConveyorOptions,
    limit: Option<usize>,
    report: Option<ReportOptions>,
}

/// Execute the build command
pub async fn execute(args: BuildArgs, config_path: Option<&Path>, verbose: u8) -> KilnResult<()> {
    let ctx = UiContext::detect();
    let project = Project::load(config_path).await?;

    // Flag and configuration errors surface before any hashing
    let sync = project.synchronization(&args.sync)?;
    let target = target_stage(&args.sync)?;
    let report = resolve_report(&report_flags(&args))?;
    let settings = run_settings(&args, &project.config, target, report)?;
    debug!("Run settings: {:?}", settings);

    let plan = project.plan(&args.images, target).await?;

    if plan.is_empty() {
        ui::step_warn(&ctx, "No images configured");
        return Ok(());
    }

    let paths = StoragePaths::default();
    let locks = create_lock_manager(&sync, &paths, &project.config.cluster)?;
    let cache = create_stages_storage_cache(&sync, &paths, &project.config.cluster)?;
    let builder = Arc::new(PodmanStageBuilder::new(
        &project.config.project,
        paths.builds_dir.clone(),
    ));

    let introspecting = settings.options.introspect.is_enabled();
    let conveyor = Arc::new(Conveyor::new(
        builder,
        cache,
        locks,
        settings.options,
        shutdown_signal(),
    ));

    ui::intro(&ctx, &format!("kiln build ({} via {})", project.config.project, sync));

    // Logs share the terminal with the spinner only when they are quiet
    let spinner_ctx = if verbose == 0 && !introspecting {
        ctx
    } else {
        UiContext::plain()
    };
    let spinner = RunSpinner::start(&spinner_ctx, &format!("Building {} image(s)", plan.len()));
    let summary = ParallelScheduler::new(settings.limit)
        .run(&plan, conveyor)
        .await;
    spinner.finish();
    let summary = summary?;

    print_summary(&ctx, &summary);
    write_and_finish(&ctx, &summary, settings.report.as_ref()).await
}

/// The report is written for every run that produced a summary, whatever its status
async fn write_and_finish(
    ctx: &UiContext,
    summary: &RunSummary,
    report: Option<&ReportOptions>,
) -> KilnResult<()> {
    if let Some(report) = report {
        write_report(summary, report).await?;
        ui::remark(ctx, &format!("Build report: {}", report.path.display()));
    }

    finish(ctx, summary)
}

fn report_flags(args: &BuildArgs) -> ReportFlags {
    ReportFlags {
        path: args.build_report_path.clone(),
        format: args.build_report_format.clone(),
        deprecated_path: args.report_path.clone(),
        deprecated_format: args.report_format.clone(),
    }
}

/// Merge flags over `[build]`
fn run_settings(
    args: &BuildArgs,
    config: &Config,
    target: Option<StageKind>,
    report: Option<ReportOptions>,
) -> KilnResult<RunSettings> {
    let repo = args.repo.clone().unwrap_or_else(|| config.build.repo.clone());

    // Tags must be unique across every configured image, not only the selected ones
    let custom_tags = CustomTags::compile(
        args.use_custom_tag.as_deref(),
        &args.add_custom_tags,
        &config.image_names(),
        &repo,
    )?;

    let introspect = IntrospectOptions {
        before_error: args.introspect_before_error,
        error: args.introspect_error,
    };

    let lock_timeout = match args.lock_timeout.unwrap_or(config.build.lock_timeout_secs) {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let limit = parallel_limit(
        args.parallel_flag().unwrap_or(config.build.parallel),
        args.parallel_tasks_limit
            .unwrap_or(config.build.parallel_tasks_limit),
        &introspect,
        target,
        !args.images.is_empty(),
    );

    Ok(RunSettings {
        options: ConveyorOptions {
            lock_timeout,
            introspect,
            repo,
            custom_tags,
            tag_images: target.is_none(),
        },
        limit,
        report,
    })
}

fn print_summary(ctx: &UiContext, summary: &RunSummary) {
    for image in &summary.images {
        ui::section(
            ctx,
            &format!("{} {}", image.image, ui::image_status(image.status)),
        );
        for stage in &image.stages {
            let short = &stage.signature[..stage.signature.len().min(12)];
            ui::remark(
                ctx,
                &format!(
                    "{:<20} {} {}",
                    stage.stage.to_string(),
                    short,
                    ui::stage_outcome(stage.outcome)
                ),
            );
        }
        if let Some(ref reference) = image.reference {
            ui::step_ok(ctx, reference);
        }
        for tag in &image.custom_tags {
            ui::remark(ctx, &format!("tag {}", tag));
        }
        if let Some(ref error) = image.error {
            ui::step_error_detail(ctx, &format!("{} {}", image.image, image.status), error);
        }
    }
}

fn finish(ctx: &UiContext, summary: &RunSummary) -> KilnResult<()> {
    let total = summary.images.len();

    if let Some(broken) = summary.internal_error() {
        ui::outro_error(ctx, "Build stopped");
        return Err(KilnError::Internal(format!(
            "image {}: {}",
            broken.image,
            broken.error.as_deref().unwrap_or_default()
        )));
    }

    if summary.count(ImageStatus::Cancelled) > 0 {
        ui::outro_error(ctx, "Build cancelled");
        return Err(KilnError::Cancelled);
    }

    if !summary.is_success() {
        let failed = total - summary.count(ImageStatus::Built);
        ui::outro_error(ctx, &format!("{} of {} image(s) not built", failed, total));
        return Err(KilnError::RunIncomplete { failed, total });
    }

    ui::outro_success(ctx, &format!("{} image(s) ready", total));
    Ok(())
}
