use std::fs;
use std::path::Path;

use assert_cmd::Command;
use tempfile::tempdir;

const RECIPE: &str = r#"
version: 1
application:
  name: netflix-clone-app
registry:
  account: asa96
workspace: ./ws
credentials:
  source_repo: github
pipeline:
  - stage: scan
    name: trivy-fs
    params:
      command: trivy fs .
      report: trivyfs.txt
  - stage: update-manifest
    params:
      path: Kubernetes/deployment.yml
  - stage: push-manifest
"#;

fn shipyard() -> Command {
    let mut cmd = Command::cargo_bin("shipyard").expect("binary present");
    cmd.env_remove("SHIPYARD_BUILD_ID")
        .env_remove("SHIPYARD_REGISTRY_ACCOUNT")
        .env("RUST_LOG", "warn");
    cmd
}

/// Recipe, workspace with one manifest, and a credential index.
fn project(root: &Path) {
    fs::write(root.join("recipe.yaml"), RECIPE).unwrap();
    let manifests = root.join("ws/Kubernetes");
    fs::create_dir_all(&manifests).unwrap();
    fs::write(
        manifests.join("deployment.yml"),
        "containers:\n  - image: asa96/netflix-clone-app:1\n",
    )
    .unwrap();
    fs::write(root.join("github.token"), "gh-secret\n").unwrap();
    fs::write(
        root.join("credentials.yaml"),
        "credentials:\n  github:\n    secret_file: github.token\n",
    )
    .unwrap();
}

#[test]
fn generated_preset_validates() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("recipes/gitops.yaml");

    shipyard()
        .args(["recipe", "new", "--preset", "gitops", "--output"])
        .arg(&path)
        .assert()
        .success();
    assert!(path.is_file());

    shipyard().arg("validate").arg(&path).assert().success();
    shipyard().args(["recipe", "lint"]).arg(&path).assert().success();
}

#[test]
fn validate_rejects_misordered_pipeline() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("bad.yaml");
    fs::write(
        &path,
        "version: 1\napplication:\n  name: app\nregistry:\n  account: me\npipeline:\n  - stage: publish\n  - stage: build\n",
    )
    .unwrap();

    shipyard().arg("validate").arg(&path).assert().failure();
}

#[test]
fn list_stages_names_the_catalogue() {
    let output = shipyard().arg("list-stages").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for stage in ["checkout", "scan", "build", "publish", "update-manifest", "push-manifest"] {
        assert!(stdout.contains(stage), "missing {stage}");
    }
}

#[test]
fn dry_run_updates_manifest_and_writes_summary() {
    let temp = tempdir().unwrap();
    project(temp.path());
    let summary = temp.path().join("out/summary.json");
    let metrics = temp.path().join("out/metrics.json");

    shipyard()
        .current_dir(temp.path())
        .args(["run", "recipe.yaml", "--dry-run", "--build-id", "7"])
        .args(["--credentials-file", "credentials.yaml"])
        .arg("--summary-json")
        .arg(&summary)
        .arg("--metrics-json")
        .arg(&metrics)
        .assert()
        .success();

    let manifest = fs::read_to_string(temp.path().join("ws/Kubernetes/deployment.yml")).unwrap();
    assert!(manifest.contains("asa96/netflix-clone-app:7"));
    assert!(temp.path().join("ws/trivyfs.txt").is_file());

    let run: serde_json::Value = serde_json::from_slice(&fs::read(&summary).unwrap()).unwrap();
    assert_eq!(run["status"], "succeeded");
    assert_eq!(run["build_id"], "7");
    assert_eq!(run["stages"].as_array().unwrap().len(), 3);
    assert_eq!(run["reports"][0]["stage"], "trivy-fs");
    assert!(!fs::read_to_string(&summary).unwrap().contains("gh-secret"));

    let snapshot: serde_json::Value =
        serde_json::from_slice(&fs::read(&metrics).unwrap()).unwrap();
    assert_eq!(snapshot["stages"]["trivy-fs"]["calls"], 1);
}

#[test]
fn build_id_can_come_from_environment() {
    let temp = tempdir().unwrap();
    project(temp.path());

    shipyard()
        .current_dir(temp.path())
        .env("SHIPYARD_BUILD_ID", "99")
        .args(["run", "recipe.yaml", "--dry-run"])
        .args(["--credentials-file", "credentials.yaml"])
        .assert()
        .success();

    let manifest = fs::read_to_string(temp.path().join("ws/Kubernetes/deployment.yml")).unwrap();
    assert!(manifest.contains("asa96/netflix-clone-app:99"));
}

#[test]
fn failed_run_exits_with_one() {
    let temp = tempdir().unwrap();
    project(temp.path());
    fs::remove_file(temp.path().join("ws/Kubernetes/deployment.yml")).unwrap();

    shipyard()
        .current_dir(temp.path())
        .args(["run", "recipe.yaml", "--dry-run", "--build-id", "7"])
        .args(["--credentials-file", "credentials.yaml"])
        .assert()
        .code(1);
}

#[test]
fn missing_credential_fails_the_push_stage() {
    let temp = tempdir().unwrap();
    project(temp.path());
    let summary = temp.path().join("summary.json");

    shipyard()
        .current_dir(temp.path())
        .env_remove("SHIPYARD_CREDENTIAL_GITHUB")
        .args(["run", "recipe.yaml", "--dry-run", "--build-id", "7"])
        .arg("--summary-json")
        .arg(&summary)
        .assert()
        .code(1);

    let run: serde_json::Value = serde_json::from_slice(&fs::read(&summary).unwrap()).unwrap();
    assert_eq!(run["stages"][2]["error_kind"], "AuthError");
}

#[test]
fn completions_are_generated() {
    let output = shipyard().args(["completions", "bash"]).output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("shipyard"));
}
