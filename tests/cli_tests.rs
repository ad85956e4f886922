//! CLI surface checks via the compiled binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn cmd() -> Command {
    Command::cargo_bin("buildsmith").unwrap()
}

#[test]
fn version_flag_prints_version() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn init_rejects_tiny_prd() {
    let dir = tempfile::tempdir().unwrap();
    let prd = dir.path().join("prd.md");
    std::fs::write(&prd, "too short").unwrap();

    cmd()
        .arg("--project-dir")
        .arg(dir.path())
        .arg("init")
        .arg(&prd)
        .assert()
        .failure()
        .stderr(predicate::str::contains("PRD too small"));
}

#[test]
fn init_rejects_missing_prd() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .arg("--project-dir")
        .arg(dir.path())
        .arg("init")
        .arg(dir.path().join("missing.md"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("PRD not found"));
}

#[test]
fn init_accepts_real_prd_and_writes_config() {
    let dir = tempfile::tempdir().unwrap();
    let prd = dir.path().join("prd.md");
    std::fs::write(
        &prd,
        "# Commerce platform\n\nAn auth service, an order service, and a notification \
         service communicating over REST and events. Users register, place orders, \
         and receive notifications by email.\n",
    )
    .unwrap();

    cmd()
        .arg("--project-dir")
        .arg(dir.path())
        .arg("init")
        .arg(&prd)
        .assert()
        .success()
        .stdout(predicate::str::contains("PRD accepted"));

    assert!(dir.path().join("buildsmith.toml").exists());
    assert!(dir.path().join(".buildsmith").exists());
}

#[test]
fn status_without_state_prints_hint() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .arg("--project-dir")
        .arg(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No pipeline state found"));
}

#[test]
fn run_with_tiny_prd_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    let prd = dir.path().join("prd.md");
    std::fs::write(&prd, "x").unwrap();

    cmd()
        .arg("--project-dir")
        .arg(dir.path())
        .arg("run")
        .arg(&prd)
        .assert()
        .failure();
}

#[test]
fn resume_without_state_exits_nonzero() {
    let dir = tempfile::tempdir().unwrap();
    cmd()
        .arg("--project-dir")
        .arg(dir.path())
        .arg("resume")
        .assert()
        .failure()
        .stderr(predicate::str::contains("No pipeline state to resume"));
}
