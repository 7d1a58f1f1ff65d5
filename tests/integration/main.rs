//! Integration tests for Kiln

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    const PROJECT: &str = r#"
project = "shop"

[[image]]
name = "backend"
from = "alpine:3.19"
install = ["apk add --no-cache nodejs"]
setup = ["node build.js"]

[image.dependencies]
install = ["package.json"]

[[image]]
name = "worker"
from_image = "backend"
docker = ["CMD [\"node\", \"worker.js\"]"]
"#;

    /// Temp project with kiln state kept inside it
    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("kiln.toml"), PROJECT).unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        dir
    }

    fn kiln(dir: &Path) -> Command {
        let mut cmd = cargo_bin_cmd!("kiln");
        cmd.current_dir(dir)
            .env("XDG_DATA_HOME", dir.join(".state"))
            .env("HOME", dir)
            .env_remove("KILN_CONFIG")
            .env_remove("KILN_SYNCHRONIZATION")
            .env_remove("KILN_REPO");
        cmd
    }

    fn plan_json(dir: &Path, extra: &[&str]) -> serde_json::Value {
        let output = kiln(dir)
            .args(["plan", "--json"])
            .args(extra)
            .output()
            .unwrap();
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
        serde_json::from_slice(&output.stdout).unwrap()
    }

    #[test]
    fn help_displays() {
        let dir = TempDir::new().unwrap();
        kiln(dir.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("stage-cached image builder"));
    }

    #[test]
    fn version_displays() {
        let dir = TempDir::new().unwrap();
        kiln(dir.path())
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn config_path_finds_project_file() {
        let dir = project();
        let nested = dir.path().join("src");
        std::fs::create_dir(&nested).unwrap();

        kiln(&nested)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln.toml"));
    }

    #[test]
    fn config_show() {
        let dir = project();
        kiln(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("project = \"shop\""))
            .stdout(predicate::str::contains("[build]"));
    }

    #[test]
    fn missing_config_is_reported() {
        let dir = TempDir::new().unwrap();
        kiln(dir.path())
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Configuration file not found"))
            .stderr(predicate::str::contains("Hint:"));
    }

    #[test]
    fn plan_lists_stages_in_waves() {
        let dir = project();
        let plan = plan_json(dir.path(), &[]);

        let backend = &plan["images"]["backend"];
        assert_eq!(backend["wave"], 0);
        let stages: Vec<&str> = backend["stages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["stage"].as_str().unwrap())
            .collect();
        assert_eq!(stages, vec!["from", "install", "setup"]);
        assert_eq!(backend["stages"][0]["cached"], false);
        assert_eq!(
            backend["content_based_tag"],
            backend["stages"][2]["signature"]
        );

        let worker = &plan["images"]["worker"];
        assert_eq!(worker["wave"], 1);
        assert_eq!(worker["stages"][1]["stage"], "docker-instructions");
    }

    #[test]
    fn dependency_change_invalidates_from_that_stage() {
        let dir = project();
        let before = plan_json(dir.path(), &[]);

        std::fs::write(dir.path().join("package.json"), "{\"name\":\"shop\"}").unwrap();
        let after = plan_json(dir.path(), &[]);

        let sig = |plan: &serde_json::Value, image: &str, i: usize| {
            plan["images"][image]["stages"][i]["signature"].clone()
        };
        assert_eq!(sig(&before, "backend", 0), sig(&after, "backend", 0));
        assert_ne!(sig(&before, "backend", 1), sig(&after, "backend", 1));
        assert_ne!(sig(&before, "backend", 2), sig(&after, "backend", 2));
        // the base change cascades into the dependent image
        assert_ne!(sig(&before, "worker", 0), sig(&after, "worker", 0));
    }

    #[test]
    fn plan_stops_at_target_stage() {
        let dir = project();
        let plan = plan_json(dir.path(), &["--target-stage", "install", "backend"]);

        let stages = plan["images"]["backend"]["stages"].as_array().unwrap();
        assert_eq!(stages.len(), 2);
        assert!(plan["images"].get("worker").is_none());
    }

    #[test]
    fn missing_dependency_file_fails() {
        let dir = project();
        std::fs::remove_file(dir.path().join("package.json")).unwrap();

        kiln(dir.path())
            .arg("plan")
            .assert()
            .failure()
            .stderr(predicate::str::contains("package.json"));
    }

    #[test]
    fn unknown_synchronization_rejected() {
        let dir = project();
        kiln(dir.path())
            .args(["plan", "--synchronization", "ftp://cache"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown synchronization target"));
    }

    #[test]
    fn unknown_target_stage_rejected() {
        let dir = project();
        kiln(dir.path())
            .args(["build", "--target-stage", "deploy"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown stage"));
    }

    #[test]
    fn custom_tags_require_repo() {
        let dir = project();
        kiln(dir.path())
            .args(["build", "--add-custom-tag", "%image%-latest"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--repo=ADDRESS"));
    }

    #[test]
    fn shared_custom_tag_needs_image_placeholder() {
        let dir = project();
        kiln(dir.path())
            .args([
                "build",
                "--repo",
                "registry.example.com/shop",
                "--use-custom-tag",
                "latest",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("%image%"));
    }

    #[test]
    fn report_flag_forms_conflict() {
        let dir = project();
        kiln(dir.path())
            .args([
                "build",
                "--build-report-path",
                "a.json",
                "--report-path",
                "b.json",
            ])
            .assert()
            .failure()
            .stderr(predicate::str::contains("You can't use both --report-path"));
    }
}
