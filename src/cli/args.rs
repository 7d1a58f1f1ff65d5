//! CLI argument definitions using clap derive

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Kiln - distributed stage-cached image builder
///
/// Builds container images stage by stage, reusing any stage whose
/// signature was already built by this or another builder.
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path (default: kiln.toml in this or a parent directory)
    #[arg(short, long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, env = "KILN_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build images
    Build(BuildArgs),

    /// Show stage signatures and cache status without building
    Plan(PlanArgs),

    /// Show configuration
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Flags shared by `build` and `plan`
#[derive(Args, Debug, Clone, Default)]
pub struct SyncArgs {
    /// Where locks and the stages storage cache live:
    /// local, kubernetes://<namespace> or http(s)://<host>
    #[arg(long, env = "KILN_SYNCHRONIZATION")]
    pub synchronization: Option<String>,

    /// Build only up to this stage (from, before-install, install, before-setup, setup,
    /// docker-instructions)
    #[arg(long, env = "KILN_TARGET_STAGE")]
    pub target_stage: Option<String>,
}

#[derive(Parser, Debug, Clone, Default)]
pub struct BuildArgs {
    /// Images to build (default: all). Base images are included automatically
    pub images: Vec<String>,

    #[command(flatten)]
    pub sync: SyncArgs,

    /// Build independent images in parallel
    #[arg(long, overrides_with = "no_parallel", env = "KILN_PARALLEL")]
    pub parallel: bool,

    /// Build images one at a time
    #[arg(long, overrides_with = "parallel")]
    pub no_parallel: bool,

    /// Maximum images built at once (<= 0 = unbounded)
    #[arg(long, env = "KILN_PARALLEL_TASKS_LIMIT", allow_negative_numbers = true)]
    pub parallel_tasks_limit: Option<i64>,

    /// Maximum seconds to wait for a stage lock (0 = forever)
    #[arg(long, env = "KILN_LOCK_TIMEOUT")]
    pub lock_timeout: Option<u64>,

    /// Open a shell in the failed state of a failing stage
    #[arg(long, env = "KILN_INTROSPECT_ERROR")]
    pub introspect_error: bool,

    /// Open a shell in the last good state before a failing stage
    #[arg(long, env = "KILN_INTROSPECT_BEFORE_ERROR")]
    pub introspect_before_error: bool,

    /// Image repository address ("local" = no remote storage)
    #[arg(long, env = "KILN_REPO")]
    pub repo: Option<String>,

    /// Extra tag for every built image (repeatable). Supports %image%,
    /// %image_slug%, %image_safe_slug% and %image_content_based_tag%
    #[arg(long = "add-custom-tag", env = "KILN_ADD_CUSTOM_TAG", value_delimiter = ',')]
    pub add_custom_tags: Vec<String>,

    /// Tag used as the published reference of every built image
    #[arg(long, env = "KILN_USE_CUSTOM_TAG")]
    pub use_custom_tag: Option<String>,

    /// Write a build report to this path
    #[arg(long, env = "KILN_BUILD_REPORT_PATH")]
    pub build_report_path: Option<PathBuf>,

    /// Build report format: json or envfile
    #[arg(long, env = "KILN_BUILD_REPORT_FORMAT")]
    pub build_report_format: Option<String>,

    #[arg(long, hide = true)]
    pub report_path: Option<PathBuf>,

    #[arg(long, hide = true)]
    pub report_format: Option<String>,
}

impl BuildArgs {
    /// Explicit parallel setting, if any
    pub fn parallel_flag(&self) -> Option<bool> {
        match (self.parallel, self.no_parallel) {
            (true, _) => Some(true),
            (_, true) => Some(false),
            _ => None,
        }
    }
}

#[derive(Parser, Debug, Clone, Default)]
pub struct PlanArgs {
    /// Images to plan (default: all)
    pub images: Vec<String>,

    #[command(flatten)]
    pub sync: SyncArgs,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show the effective configuration
    Show,

    /// Show the configuration file path
    Path,
}
