use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;
use tempfile::tempdir;

fn base_command() -> Command {
    let mut cmd = Command::cargo_bin("did-imputation").unwrap();
    cmd.arg("--data")
        .arg("tests/data/panel.csv")
        .arg("--outcome")
        .arg("y")
        .arg("--unit")
        .arg("id")
        .arg("--time")
        .arg("year")
        .arg("--cohort")
        .arg("g");
    cmd
}

#[test]
fn test_static_effect() {
    base_command()
        .assert()
        .success()
        .stdout(predicate::str::contains("Imputation Difference-in-Differences"))
        .stdout(predicate::str::contains("treat"));
}

#[test]
fn test_event_study_with_pretrends() {
    base_command()
        .arg("--horizon")
        .arg("0,1,2")
        .arg("--pretrends")
        .arg("-2,-1")
        .arg("--first-stage")
        .arg("~ x | id + year")
        .arg("--weights")
        .arg("w")
        .assert()
        .success()
        .stdout(predicate::str::contains("-2"))
        .stdout(predicate::str::contains("95% CI"));
}

#[test]
fn test_exports() {
    let dir = tempdir().unwrap();
    let json = dir.path().join("results.json");
    let md = dir.path().join("results.md");
    let panel = dir.path().join("panel.csv");

    base_command()
        .arg("--horizon")
        .arg("all")
        .arg("--output-json")
        .arg(&json)
        .arg("--output-markdown")
        .arg(&md)
        .arg("--output-panel")
        .arg(&panel)
        .assert()
        .success();

    let json = std::fs::read_to_string(json).unwrap();
    assert!(json.contains("\"terms\""));
    let md = std::fs::read_to_string(md).unwrap();
    assert!(md.starts_with("### Imputation Difference-in-Differences Results"));
    let panel = std::fs::read_to_string(panel).unwrap();
    assert!(panel.lines().next().unwrap().contains("residual_centered_0"));
}

#[test]
fn test_invalid_horizon() {
    base_command()
        .arg("--horizon")
        .arg("9")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error: Configuration error"));
}

#[test]
fn test_missing_argument() {
    let mut cmd = Command::cargo_bin("did-imputation").unwrap();
    cmd.arg("--data").arg("tests/data/panel.csv");
    cmd.assert().failure();
}
