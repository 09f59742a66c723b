use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use shipyard::credentials::{StaticCredentialStore, with_credential};
use shipyard::git::{self, ChangePublisher};
use shipyard::manifest;
use shipyard::tools::ProcessRunner;
use tempfile::{TempDir, tempdir};

const DEPLOYMENT: &str = "spec:\n  containers:\n    - name: netflix-app\n      image: asa96/netflix-clone-app:41\n";

fn git_in(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(["-c", "user.name=seed", "-c", "user.email=seed@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git is installed");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Bare remote seeded with one manifest commit on `main`.
fn seeded_remote() -> (TempDir, String) {
    let temp = tempdir().unwrap();
    let remote = temp.path().join("remote.git");
    fs::create_dir_all(&remote).unwrap();
    git_in(&remote, &["init", "--bare", "--quiet"]);

    let seed = temp.path().join("seed");
    fs::create_dir_all(seed.join("Kubernetes")).unwrap();
    fs::write(seed.join("Kubernetes/deployment.yml"), DEPLOYMENT).unwrap();
    git_in(&seed, &["init", "--quiet"]);
    git_in(&seed, &["add", "."]);
    git_in(&seed, &["commit", "--quiet", "-m", "initial"]);
    let url = format!("file://{}", remote.display());
    git_in(&seed, &["push", "--quiet", &url, "HEAD:refs/heads/main"]);
    (temp, url)
}

fn checkout(temp: &TempDir, url: &str) -> PathBuf {
    let work = temp.path().join("work");
    git::checkout(&ProcessRunner, url, "main", &work).unwrap();
    work
}

fn store() -> StaticCredentialStore {
    StaticCredentialStore::new().with("github", None, "gh-token")
}

fn publish(work: &Path, paths: &[PathBuf]) -> shipyard::error::Result<git::CommitChange> {
    let runner = ProcessRunner;
    with_credential(&store(), "github", |bindings| {
        ChangePublisher::new(&runner, work).commit_and_push(
            paths,
            "Update netflix-clone-app image to 42",
            "main",
            bindings,
        )
    })
}

#[test]
fn updated_manifest_is_committed_and_pushed() {
    let (temp, url) = seeded_remote();
    let work = checkout(&temp, &url);
    let manifest_path = work.join("Kubernetes/deployment.yml");

    let descriptor = manifest::update(&manifest_path, "netflix-clone-app", "42").unwrap();
    assert!(descriptor.changed());

    let change = publish(&work, &[PathBuf::from("Kubernetes/deployment.yml")]).unwrap();
    let commit = change.commit.expect("a commit was created");

    let remote = temp.path().join("remote.git");
    assert_eq!(git_in(&remote, &["rev-parse", "main"]).trim(), commit);
    assert_eq!(
        git_in(&remote, &["log", "-1", "--format=%s", "main"]).trim(),
        "Update netflix-clone-app image to 42"
    );
    assert_eq!(
        git_in(&remote, &["show", "--name-only", "--format=", "main"]).trim(),
        "Kubernetes/deployment.yml"
    );
    assert_eq!(
        git_in(&remote, &["show", "main:Kubernetes/deployment.yml"]),
        DEPLOYMENT.replace(":41", ":42")
    );
}

#[test]
fn unchanged_manifest_pushes_nothing() {
    let (temp, url) = seeded_remote();
    let work = checkout(&temp, &url);
    let manifest_path = work.join("Kubernetes/deployment.yml");
    let remote = temp.path().join("remote.git");
    let before = git_in(&remote, &["rev-parse", "main"]);

    let descriptor = manifest::update(&manifest_path, "netflix-clone-app", "41").unwrap();
    assert!(!descriptor.changed());

    let change = publish(&work, &[PathBuf::from("Kubernetes/deployment.yml")]).unwrap();
    assert!(change.commit.is_none());
    assert_eq!(git_in(&remote, &["rev-parse", "main"]), before);
}

#[test]
fn concurrent_upstream_change_is_a_conflict() {
    let (temp, url) = seeded_remote();
    let work = checkout(&temp, &url);

    // Someone else moves main after our checkout.
    let seed = temp.path().join("seed");
    fs::write(seed.join("README.md"), "hello\n").unwrap();
    git_in(&seed, &["add", "README.md"]);
    git_in(&seed, &["commit", "--quiet", "-m", "docs"]);
    git_in(&seed, &["push", "--quiet", &url, "HEAD:refs/heads/main"]);

    manifest::update(&work.join("Kubernetes/deployment.yml"), "netflix-clone-app", "42").unwrap();
    let err = publish(&work, &[PathBuf::from("Kubernetes/deployment.yml")]).unwrap_err();
    assert_eq!(err.kind(), "GitConflictError");

    let remote = temp.path().join("remote.git");
    assert_eq!(
        git_in(&remote, &["log", "-1", "--format=%s", "main"]).trim(),
        "docs"
    );
}

#[test]
fn checkout_of_missing_branch_fails() {
    let (temp, url) = seeded_remote();
    let err = git::checkout(&ProcessRunner, &url, "does-not-exist", &temp.path().join("w"))
        .unwrap_err();
    assert_eq!(err.kind(), "CheckoutError");
}
