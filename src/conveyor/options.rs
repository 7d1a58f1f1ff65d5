//! Run options derived from flags and configuration

use crate::error::{KilnError, KilnResult};
use crate::stage::StageKind;
use crate::tag::{CustomTags, LOCAL_REPO};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Interactive shells on build failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntrospectOptions {
    /// Shell in the last good state before the failed stage
    pub before_error: bool,
    /// Shell in the failed state
    pub error: bool,
}

impl IntrospectOptions {
    pub fn is_enabled(&self) -> bool {
        self.before_error || self.error
    }
}

/// Options shared by every image pipeline of a run
#[derive(Debug, Clone)]
pub struct ConveyorOptions {
    /// Longest wait for a stage lock (`None` = unbounded)
    pub lock_timeout: Option<Duration>,
    pub introspect: IntrospectOptions,
    /// Image repository, `local` for none
    pub repo: String,
    pub custom_tags: CustomTags,
    /// Tag finished images; off when builds stop at a target stage
    pub tag_images: bool,
}

impl Default for ConveyorOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Some(Duration::from_secs(1800)),
            introspect: IntrospectOptions::default(),
            repo: LOCAL_REPO.to_string(),
            custom_tags: CustomTags::default(),
            tag_images: true,
        }
    }
}

impl ConveyorOptions {
    pub fn has_remote_repo(&self) -> bool {
        !self.repo.is_empty() && self.repo != LOCAL_REPO
    }
}

/// Concurrency limit for image pipelines; `None` is unbounded.
///
/// Parallelism is forced off while introspecting, when building up to a
/// target stage, or when specific images were requested.
pub fn parallel_limit(
    parallel: bool,
    tasks_limit: i64,
    introspect: &IntrospectOptions,
    target_stage: Option<StageKind>,
    images_selected: bool,
) -> Option<usize> {
    if introspect.is_enabled() || target_stage.is_some() || images_selected {
        debug!("Building images sequentially");
        return Some(1);
    }
    if !parallel {
        return Some(1);
    }
    if tasks_limit <= 0 {
        None
    } else {
        Some(tasks_limit as usize)
    }
}

/// Build report format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReportFormat {
    #[default]
    Json,
    Envfile,
}

impl FromStr for ReportFormat {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "envfile" => Ok(Self::Envfile),
            other => Err(KilnError::InvalidReportFormat(other.to_string())),
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Envfile => write!(f, "envfile"),
        }
    }
}

/// Where and how to write the build report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOptions {
    pub path: PathBuf,
    pub format: ReportFormat,
}

/// Report-related flags as given on the command line
#[derive(Debug, Clone, Default)]
pub struct ReportFlags {
    pub path: Option<PathBuf>,
    pub format: Option<String>,
    pub deprecated_path: Option<PathBuf>,
    pub deprecated_format: Option<String>,
}

/// Merge current and deprecated report flags.
///
/// Giving both forms of the same flag is an error. Returns `None` when no
/// report was requested.
pub fn resolve_report(flags: &ReportFlags) -> KilnResult<Option<ReportOptions>> {
    let path = pick(
        flags.path.clone(),
        flags.deprecated_path.clone(),
        "--build-report-path",
        "--report-path",
    )?;
    let format = pick(
        flags.format.clone(),
        flags.deprecated_format.clone(),
        "--build-report-format",
        "--report-format",
    )?;

    let format = match format {
        Some(format) => format.parse()?,
        None => ReportFormat::default(),
    };

    Ok(path.map(|path| ReportOptions { path, format }))
}

fn pick<T>(
    current: Option<T>,
    deprecated: Option<T>,
    current_flag: &'static str,
    deprecated_flag: &'static str,
) -> KilnResult<Option<T>> {
    match (current, deprecated) {
        (Some(_), Some(_)) => Err(KilnError::ConflictingFlags {
            current: current_flag,
            deprecated: deprecated_flag,
        }),
        (Some(value), None) => Ok(Some(value)),
        (None, Some(value)) => {
            warn!("{} is deprecated, use {} instead", deprecated_flag, current_flag);
            Ok(Some(value))
        }
        (None, None) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallel_defaults_to_configured_limit() {
        let none = IntrospectOptions::default();
        assert_eq!(parallel_limit(true, 5, &none, None, false), Some(5));
        assert_eq!(parallel_limit(true, 0, &none, None, false), None);
        assert_eq!(parallel_limit(true, -1, &none, None, false), None);
        assert_eq!(parallel_limit(false, 5, &none, None, false), Some(1));
    }

    #[test]
    fn introspection_and_targets_force_sequential() {
        let introspect = IntrospectOptions {
            error: true,
            ..Default::default()
        };
        let none = IntrospectOptions::default();

        assert_eq!(parallel_limit(true, 5, &introspect, None, false), Some(1));
        assert_eq!(parallel_limit(true, 5, &none, Some(StageKind::Install), false), Some(1));
        assert_eq!(parallel_limit(true, 0, &none, None, true), Some(1));
    }

    #[test]
    fn report_requires_path() {
        assert_eq!(resolve_report(&ReportFlags::default()).unwrap(), None);

        let flags = ReportFlags {
            path: Some("report.json".into()),
            ..Default::default()
        };
        let report = resolve_report(&flags).unwrap().unwrap();
        assert_eq!(report.format, ReportFormat::Json);
    }

    #[test]
    fn deprecated_flags_still_work() {
        let flags = ReportFlags {
            deprecated_path: Some("out.env".into()),
            deprecated_format: Some("envfile".into()),
            ..Default::default()
        };
        let report = resolve_report(&flags).unwrap().unwrap();
        assert_eq!(report.path, PathBuf::from("out.env"));
        assert_eq!(report.format, ReportFormat::Envfile);
    }

    #[test]
    fn current_and_deprecated_conflict() {
        let flags = ReportFlags {
            path: Some("a".into()),
            deprecated_path: Some("b".into()),
            ..Default::default()
        };
        let err = resolve_report(&flags).unwrap_err();
        assert!(matches!(
            err,
            KilnError::ConflictingFlags {
                current: "--build-report-path",
                deprecated: "--report-path"
            }
        ));

        let flags = ReportFlags {
            format: Some("json".into()),
            deprecated_format: Some("json".into()),
            ..Default::default()
        };
        assert!(resolve_report(&flags).is_err());
    }

    #[test]
    fn unknown_format_rejected() {
        let flags = ReportFlags {
            path: Some("a".into()),
            format: Some("yaml".into()),
            ..Default::default()
        };
        assert!(matches!(
            resolve_report(&flags),
            Err(KilnError::InvalidReportFormat(_))
        ));
    }
}
