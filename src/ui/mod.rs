//! Terminal output
//!
//! `cliclack` log lines and an `indicatif` spinner on a terminal, plain
//! prefixed lines in CI or when output is piped.

mod context;
mod output;
mod progress;
mod theme;

pub use context::UiContext;
pub use output::{
    image_status, intro, outro_error, outro_success, remark, section, stage_outcome,
    step_error_detail, step_ok, step_warn,
};
pub use progress::RunSpinner;
pub use theme::{init_theme, KilnTheme};
