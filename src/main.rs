//! Kiln CLI entry point

use clap::Parser;
use console::style;
use kiln::cli::{Cli, Commands, LogFormat};
use kiln::error::KilnResult;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> KilnResult<()> {
    let cli = Cli::parse();
    let log_format = match cli.log_format {
        Some(format) => format,
        None => configured_log_format(&cli).await,
    };
    init_logging(cli.verbose, log_format);
    kiln::ui::init_theme();

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Build(args) => kiln::cli::commands::build(args, config_path, cli.verbose).await,
        Commands::Plan(args) => kiln::cli::commands::plan(args, config_path).await,
        Commands::Config(args) => kiln::cli::commands::config(args, config_path).await,
    }
}

/// `general.log_format` of the project, if it can be read; load errors are
/// reported by the command itself
async fn configured_log_format(cli: &Cli) -> LogFormat {
    let Ok(manager) = kiln::cli::commands::config_manager(cli.config.as_deref()) else {
        return LogFormat::Text;
    };
    match manager.load().await {
        Ok(config) if config.general.log_format == "json" => LogFormat::Json,
        _ => LogFormat::Text,
    }
}

/// 0 = warn, 1 = info, 2+ = debug. `RUST_LOG` wins when set.
fn init_logging(verbose: u8, format: LogFormat) {
    let level = match verbose {
        0 => "kiln=warn",
        1 => "kiln=info",
        _ => "kiln=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.without_time().init(),
    }
}
