//! End-to-end CLI tests driving the compiled `shepherd` binary through
//! `assert_cmd`, mirroring the teacher's `tests/cli_e2e.rs` conventions.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;

fn shepherd() -> Command {
    Command::cargo_bin("shepherd").unwrap()
}

#[test]
fn test_help_shows_usage() {
    shepherd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("shepherd"));
}

#[test]
fn test_version_displays_version() {
    shepherd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("shepherd"));
}

#[test]
fn test_missing_subcommand_fails() {
    shepherd().assert().failure();
}

#[test]
fn test_invalid_subcommand_fails() {
    shepherd().arg("not-a-command").assert().failure();
}

#[test]
fn test_out_of_scope_subcommands_fail_with_explanation() {
    for sub in ["run", "cleanup", "move"] {
        shepherd()
            .arg(sub)
            .assert()
            .failure()
            .stderr(predicate::str::contains("not implemented"));
    }
}

#[test]
fn test_missing_config_file_is_a_fatal_error() {
    let state_dir = tempfile::tempdir().unwrap();
    shepherd()
        .args([
            "--config",
            "/nonexistent/config.json",
            "--state-dir",
            state_dir.path().to_str().unwrap(),
            "upload",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("loading configuration"));
}

#[test]
fn test_unknown_uploader_filter_is_a_fatal_error() {
    let workdir = tempfile::tempdir().unwrap();
    let cred_dir = workdir.path().join("creds");
    fs::create_dir_all(&cred_dir).unwrap();
    fs::write(cred_dir.join("sa1.json"), "{}").unwrap();

    let config_path = workdir.path().join("config.json");
    fs::write(
        &config_path,
        format!(
            r#"{{
                "uploaders": {{
                    "main": {{
                        "local_path": "/data/src",
                        "remote_path": "remote:dest",
                        "credential_path": {:?}
                    }}
                }},
                "rc": {{ "url": "http://127.0.0.1:5572" }}
            }}"#,
            cred_dir.to_str().unwrap()
        ),
    )
    .unwrap();

    let state_dir = workdir.path().join("state");
    shepherd()
        .args([
            "--config",
            config_path.to_str().unwrap(),
            "--state-dir",
            state_dir.to_str().unwrap(),
            "upload",
            "does-not-exist",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no such uploader"));
}

#[test]
fn test_upload_with_missing_engine_binary_fails_with_engine_error() {
    let workdir = tempfile::tempdir().unwrap();
    let cred_dir = workdir.path().join("creds");
    fs::create_dir_all(&cred_dir).unwrap();
    fs::write(cred_dir.join("sa1.json"), "{}").unwrap();

    let config_path = workdir.path().join("config.json");
    fs::write(
        &config_path,
        format!(
            r#"{{
                "uploaders": {{
                    "main": {{
                        "local_path": "/data/src",
                        "remote_path": "remote:dest",
                        "credential_path": {:?}
                    }}
                }},
                "core": {{ "engine_binary_path": "/nonexistent/rclone-binary" }},
                "rc": {{ "url": "http://127.0.0.1:5572" }}
            }}"#,
            cred_dir.to_str().unwrap()
        ),
    )
    .unwrap();

    let state_dir = workdir.path().join("state");
    shepherd()
        .args([
            "--config",
            config_path.to_str().unwrap(),
            "--state-dir",
            state_dir.to_str().unwrap(),
            "upload",
            "main",
        ])
        .assert()
        .failure();
}
