//! Smoke tests driving the stowage binary
//!
//! These tests run the built binary against temporary cache and output
//! directories and check what ends up on disk and on stdout.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

/// Run stowage with a fresh environment
fn run_stowage(cache: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stowage"))
        .arg("--cache-dir")
        .arg(cache)
        .args(args)
        .env_remove("STOWAGE_CONFIG")
        .env_remove("STOWAGE_CACHE_DIR")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run stowage")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_store_then_load_round_trip() {
    let work = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let out = work.path().join("dist");
    fs::create_dir_all(out.join("assets")).unwrap();
    fs::write(out.join("index.html"), "<html></html>").unwrap();
    fs::write(out.join("assets/app.js"), "run()").unwrap();
    let dir_arg = format!("dist={}", out.display());

    let stored = run_stowage(cache.path(), &["store", "-i", ":web:build", "--dir", &dir_arg]);
    assert!(stored.status.success(), "{}", String::from_utf8_lossy(&stored.stderr));
    assert!(stdout(&stored).starts_with("stored "), "{}", stdout(&stored));

    fs::remove_dir_all(&out).unwrap();
    let loaded = run_stowage(cache.path(), &["load", "-i", ":web:build", "--dir", &dir_arg]);
    assert!(loaded.status.success(), "{}", String::from_utf8_lossy(&loaded.stderr));
    assert!(stdout(&loaded).starts_with("restored "), "{}", stdout(&loaded));

    assert_eq!(fs::read_to_string(out.join("index.html")).unwrap(), "<html></html>");
    assert_eq!(fs::read_to_string(out.join("assets/app.js")).unwrap(), "run()");
}

#[test]
fn test_load_miss_reports_json() {
    let work = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let file_arg = format!("report={}", work.path().join("report.txt").display());

    let output = run_stowage(
        cache.path(),
        &["--json", "load", "-i", ":never:ran", "--file", &file_arg],
    );
    assert!(output.status.success());

    let envelope: serde_json::Value = serde_json::from_str(stdout(&output).trim()).unwrap();
    assert_eq!(envelope["status"], "ok");
    assert_eq!(envelope["data"]["command"], "miss");
}

#[test]
fn test_missing_outputs_is_a_usage_error() {
    let cache = TempDir::new().unwrap();
    let output = run_stowage(cache.path(), &["store", "-i", ":nothing"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_stats_on_empty_cache() {
    let cache = TempDir::new().unwrap();
    let output = run_stowage(cache.path(), &["stats"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("0 blobs, 0 bytes"), "{}", stdout(&output));
}
