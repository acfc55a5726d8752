//! Command-line behavior of gram-post

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Empty config file plus a scratch directory for media
fn setup_test_env() -> (TempDir, String) {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    fs::write(&config_path, "[polling]\ndelay = \"0s\"\n").unwrap();
    (temp_dir, config_path.to_string_lossy().to_string())
}

fn gram_post(config_path: &str) -> Command {
    let mut cmd = Command::cargo_bin("gram-post").unwrap();
    cmd.env("GRAMCAST_CONFIG", config_path)
        .env_remove("GRAMCAST_ACCOUNT_ID")
        .env_remove("GRAMCAST_ACCESS_TOKEN");
    cmd
}

#[test]
fn test_help_lists_exit_codes() {
    Command::cargo_bin("gram-post")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("EXIT CODES"))
        .stdout(predicate::str::contains("--no-share-to-feed"));
}

#[test]
fn test_media_argument_required() {
    Command::cargo_bin("gram-post")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("MEDIA"));
}

#[test]
fn test_unknown_content_type_rejected() {
    Command::cargo_bin("gram-post")
        .unwrap()
        .args(["a.jpg", "--type", "story"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown content type"));
}

#[test]
fn test_missing_credentials_exit_code() {
    let (_temp_dir, config_path) = setup_test_env();

    gram_post(&config_path)
        .args(["https://cdn.example.com/a.jpg", "-c", "hello"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_missing_media_file_exit_code() {
    let (temp_dir, config_path) = setup_test_env();
    let missing = temp_dir.path().join("missing.jpg");

    gram_post(&config_path)
        .env("GRAMCAST_ACCOUNT_ID", "1789")
        .env("GRAMCAST_ACCESS_TOKEN", "test-token")
        .arg(missing.to_string_lossy().to_string())
        .args(["-c", "hello"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("missing.jpg"));
}

#[test]
fn test_invalid_format_exit_code() {
    let (_temp_dir, config_path) = setup_test_env();

    gram_post(&config_path)
        .args(["https://cdn.example.com/a.jpg", "-c", "hello", "--format", "yaml"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Invalid format"));
}
