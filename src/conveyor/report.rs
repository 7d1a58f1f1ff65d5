//! Build report output

use crate::conveyor::options::{ReportFormat, ReportOptions};
use crate::conveyor::outcome::{ImageOutcome, RunSummary};
use crate::error::{KilnError, KilnResult};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

#[derive(Serialize)]
struct JsonReport<'a> {
    images: BTreeMap<&'a str, &'a ImageOutcome>,
}

/// Render the summary in the requested format
pub fn render_report(summary: &RunSummary, format: ReportFormat) -> KilnResult<String> {
    match format {
        ReportFormat::Json => {
            let report = JsonReport {
                images: summary
                    .images
                    .iter()
                    .map(|i| (i.image.as_str(), i))
                    .collect(),
            };
            let mut out = serde_json::to_string_pretty(&report)?;
            out.push('\n');
            Ok(out)
        }
        ReportFormat::Envfile => Ok(envfile(summary)),
    }
}

fn envfile(summary: &RunSummary) -> String {
    let mut images: Vec<&ImageOutcome> = summary.images.iter().collect();
    images.sort_by(|a, b| a.image.cmp(&b.image));

    let mut out = String::new();
    for image in images {
        let prefix = format!("KILN_{}", env_name(&image.image));
        out.push_str(&format!("{}_STATUS={}\n", prefix, image.status));
        out.push_str(&format!(
            "{}_CONTENT_BASED_TAG={}\n",
            prefix, image.content_based_tag
        ));
        if let Some(ref reference) = image.reference {
            out.push_str(&format!("{}_REFERENCE={}\n", prefix, reference));
        }
    }
    out
}

/// `my-app.v2` -> `MY_APP_V2`
fn env_name(image: &str) -> String {
    image
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Write the build report
pub async fn write_report(summary: &RunSummary, options: &ReportOptions) -> KilnResult<()> {
    let content = render_report(summary, options.format)?;

    if let Some(parent) = options.path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| KilnError::io(format!("create {}", parent.display()), e))?;
    }
    tokio::fs::write(&options.path, content)
        .await
        .map_err(|e| KilnError::io(format!("write report {}", options.path.display()), e))?;

    info!("Build report written to {}", options.path.display());
    Ok(())
}
