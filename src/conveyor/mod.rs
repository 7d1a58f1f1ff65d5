//! Conveyor: drives image pipelines through the stages storage
//!
//! Each image walks its stages in order. A stage is looked up in the stages
//! storage cache first; on a miss its lock is taken, the cache is checked
//! again, and only then is the stage built and recorded. Images run in
//! dependency waves under a bounded scheduler.

mod options;
mod outcome;
mod pipeline;
mod report;
mod scheduler;
#[cfg(test)]
mod testing;

pub use options::{
    parallel_limit, resolve_report, ConveyorOptions, IntrospectOptions, ReportFlags, ReportFormat,
    ReportOptions,
};
pub use outcome::{ImageOutcome, ImageStatus, RunSummary, StageOutcome, StageReport};
pub use pipeline::Conveyor;
pub use report::{render_report, write_report};
pub use scheduler::ParallelScheduler;

#[cfg(test)]
mod tests {
    use super::testing::ScriptedBuilder;
    use super::*;
    use crate::config::ConfigManager;
    use crate::stage::{NoGitPatches, Planner};
    use crate::storage::{FileStagesStorageCache, LocalLockManager};
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::watch;

    const PROJECT: &str = r#"
        [[image]]
        name = "a"
        from = "alpine:3.19"
        install = ["apk add curl"]

        [[image]]
        name = "b"
        from = "alpine:3.19"
        install = ["make deps"]
        setup = ["make"]

        [image.dependencies]
        setup = ["src"]
    "#;

    async fn run(project: &Path, state: &Path, builder: Arc<ScriptedBuilder>) -> RunSummary {
        let config = ConfigManager::with_path(PathBuf::from("kiln.toml"))
            .parse(PROJECT)
            .unwrap();
        let plan = Planner::new(&config, project, &NoGitPatches)
            .plan(&[], None)
            .await
            .unwrap();

        let (_cancel, receiver) = watch::channel(false);
        let conveyor = Conveyor::new(
            builder,
            Arc::new(FileStagesStorageCache::new(state.join("cache"))),
            Arc::new(LocalLockManager::new(state.join("locks"))),
            ConveyorOptions::default(),
            receiver,
        );
        ParallelScheduler::new(Some(2))
            .run(&plan, Arc::new(conveyor))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn only_changed_image_is_rebuilt() {
        let project = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        std::fs::create_dir(project.path().join("src")).unwrap();
        std::fs::write(project.path().join("src/main.c"), "int main() {}").unwrap();

        let first = Arc::new(ScriptedBuilder::default());
        let summary = run(project.path(), state.path(), first.clone()).await;
        assert!(summary.is_success());
        // both images share the from stage
        assert_eq!(first.build_count(), 4);

        std::fs::write(project.path().join("src/main.c"), "int main() { return 1; }").unwrap();

        let second = Arc::new(ScriptedBuilder::default());
        let summary = run(project.path(), state.path(), second.clone()).await;
        assert!(summary.is_success());
        assert_eq!(second.build_count(), 1);

        let a = summary.image("a").unwrap();
        assert_eq!(a.count(StageOutcome::Cached), 2);
        let b = summary.image("b").unwrap();
        assert_eq!(b.count(StageOutcome::Cached), 2);
        assert_eq!(b.count(StageOutcome::Built), 1);
    }
}
