//! Progress indicators with CI fallback

use super::context::UiContext;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner shown while a run is in flight
pub struct RunSpinner {
    bar: Option<ProgressBar>,
}

impl RunSpinner {
    /// Start the spinner. Plain contexts print one line instead.
    pub fn start(ctx: &UiContext, message: &str) -> Self {
        if !ctx.use_fancy_output() {
            println!("{} {}", style("...").dim(), message);
            return Self { bar: None };
        }

        let bar = ProgressBar::new_spinner();
        let template = ProgressStyle::with_template("  {spinner:.208} {msg} {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ");
        bar.set_style(template);
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));
        Self { bar: Some(bar) }
    }

    pub fn set_message(&self, message: &str) {
        if let Some(ref bar) = self.bar {
            bar.set_message(message.to_string());
        }
    }

    /// Remove the spinner; output after this is not overdrawn
    pub fn finish(self) {
        if let Some(bar) = self.bar {
            bar.finish_and_clear();
        }
    }
}
