//! Styled output with a plain fallback

use super::context::UiContext;
use crate::conveyor::{ImageStatus, StageOutcome};
use console::{style, StyledObject};

pub fn intro(ctx: &UiContext, title: &str) {
    if ctx.use_fancy_output() {
        cliclack::intro(style(title).bold()).ok();
    } else {
        println!("{}", style(title).bold());
    }
}

pub fn outro_success(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::outro(style(message).green().bold()).ok();
    } else {
        println!("{} {}", style("[OK]").green(), message);
    }
}

pub fn outro_error(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::outro(style(message).red().bold()).ok();
    } else {
        println!("{} {}", style("[ERROR]").red(), message);
    }
}

pub fn section(ctx: &UiContext, title: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::step(style(title).bold()).ok();
    } else {
        println!();
        println!("{}", style(title).bold());
    }
}

pub fn step_ok(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::success(message).ok();
    } else {
        println!("  {} {}", style("[OK]").green(), message);
    }
}

pub fn step_warn(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::warning(message).ok();
    } else {
        println!("  {} {}", style("[WARN]").yellow(), message);
    }
}

/// Error step with a dimmed detail line
pub fn step_error_detail(ctx: &UiContext, message: &str, detail: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::error(format!("{}\n{}", message, style(detail).dim())).ok();
    } else {
        println!("  {} {}: {}", style("[FAIL]").red(), message, detail);
    }
}

pub fn remark(ctx: &UiContext, message: &str) {
    if ctx.use_fancy_output() {
        cliclack::log::remark(message).ok();
    } else {
        println!("  {}", style(message).dim());
    }
}

/// Image status label, colored
pub fn image_status(status: ImageStatus) -> StyledObject<String> {
    let label = status.to_string();
    match status {
        ImageStatus::Built => style(label).green(),
        ImageStatus::Failed => style(label).red(),
        ImageStatus::Cancelled | ImageStatus::Skipped => style(label).yellow(),
    }
}

/// Stage outcome label, colored
pub fn stage_outcome(outcome: StageOutcome) -> StyledObject<&'static str> {
    match outcome {
        StageOutcome::Cached => style("cached").cyan(),
        StageOutcome::Built => style("built").green(),
        StageOutcome::Failed => style("failed").red(),
        StageOutcome::Skipped => style("skipped").dim(),
    }
}
