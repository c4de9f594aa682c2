//! Command-line tests for s3csv-target
//!
//! Only configuration failures are exercised here: they must be reported
//! before any input is read, so no object store is needed.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

fn target() -> Command {
    let mut cmd = Command::cargo_bin("s3csv-target").unwrap();
    // Keep the developer's environment out of the way
    cmd.env_remove("AWS_ACCESS_KEY_ID")
        .env_remove("AWS_SECRET_ACCESS_KEY")
        .env("LOG_LEVEL", "warn");
    cmd
}

#[test]
fn test_help() {
    target()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--config"))
        .stdout(predicate::str::contains("--abort-open-uploads"));
}

#[test]
fn test_missing_config_fails_validation() {
    target()
        .write_stdin("{\"type\":\"STATE\",\"value\":{}}\n")
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("s3_bucket is required"));
}

#[test]
fn test_every_config_problem_is_listed() {
    let file = config_file(r#"{"delimiter": "||", "upload_batch_record_count": 0}"#);

    target()
        .arg("--config")
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"))
        .stderr(predicate::str::contains("s3_bucket is required"))
        .stderr(predicate::str::contains("delimiter must be a single ASCII character"))
        .stderr(predicate::str::contains("upload_batch_record_count must be at least 1"));
}

#[test]
fn test_unparsable_config_file() {
    let file = config_file("{ not json");

    target()
        .arg("--config")
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config is not valid"));
}

#[test]
fn test_nonexistent_config_file() {
    target()
        .arg("--config")
        .arg("/nonexistent/s3csv-config.json")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Cannot read config file"));
}
