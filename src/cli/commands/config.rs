//! Config command - show the effective configuration or its path

use super::{config_manager, Project};
use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::Config;
use crate::error::KilnResult;
use std::path::Path;

/// Execute the config command
pub async fn execute(args: ConfigArgs, config_path: Option<&Path>) -> KilnResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => {
            let project = Project::load(config_path).await?;
            print!("{}", render(&project.config)?);
        }
        Some(ConfigAction::Path) => {
            println!("{}", config_manager(config_path)?.path().display());
        }
    }
    Ok(())
}

fn render(config: &Config) -> KilnResult<String> {
    Ok(toml::to_string_pretty(config)?)
}
