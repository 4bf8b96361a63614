use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const SIGNAL: &str = "2018-02-28 15:51:07,123\tsbacli\tWARN disk almost full";

fn harvest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("log-harvest");
    path
}

fn setup_test_env() -> (TempDir, PathBuf, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let logs_dir = root.join("logs");
    fs::create_dir_all(logs_dir.join("nested")).unwrap();
    fs::write(
        logs_dir.join("app.log"),
        format!("{}\nstack frame 1\nstack frame 2\n", SIGNAL),
    )
    .unwrap();
    fs::write(logs_dir.join("nested").join("worker.out"), SIGNAL).unwrap();
    fs::write(logs_dir.join("noise.txt"), "no structured entries\n").unwrap();
    fs::write(logs_dir.join("image.png"), SIGNAL).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/harvest.sqlite"

[pipeline]
scorer_workers = 2
loader_workers = 2
"#,
        root.display()
    );

    let config_path = config_dir.join("log-harvest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path, logs_dir)
}

fn run_harvest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = harvest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run log-harvest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config_path, _) = setup_test_env();

    let (stdout, stderr, success) = run_harvest(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("log_files: created"));
    assert!(stdout.contains("log_lines: created"));

    let (stdout, _, success) = run_harvest(&config_path, &["init"]);
    assert!(success);
    assert!(stdout.contains("log_files: exists"));
}

#[test]
fn test_run_then_stats() {
    let (_tmp, config_path, logs_dir) = setup_test_env();
    let dir = logs_dir.to_str().unwrap();

    let (stdout, stderr, success) =
        run_harvest(&config_path, &["run", "--sys", "web01", "--dir", dir]);
    assert!(success, "run failed: {}", stderr);
    assert!(stdout.contains("run web01"));
    assert!(stdout.contains("persisted: 2 files, 5 lines"), "{}", stdout);
    assert!(stdout.contains("s total, "), "{}", stdout);
    assert!(stdout.contains("s pipeline"), "{}", stdout);
    assert!(stdout.contains("ok"));

    let (stdout, _, success) = run_harvest(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("web01"));
    assert!(stdout.contains("Files:       2"));
    assert!(stdout.contains("Lines:       5"));
}

#[test]
fn test_run_json_summary() {
    let (_tmp, config_path, logs_dir) = setup_test_env();
    let dir = logs_dir.to_str().unwrap();

    let (stdout, stderr, success) =
        run_harvest(&config_path, &["run", "--sys", "web01", "--dir", dir, "--json"]);
    assert!(success, "run failed: {}", stderr);

    let summary: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(summary["report"]["system_tag"], "web01");
    assert_eq!(summary["report"]["decide"]["kept"], 2);
    assert_eq!(summary["report"]["load"]["lines"], 5);
    assert!(summary["watermark"]["stored_max"].is_null());
    let total = summary["total_elapsed_secs"].as_f64().unwrap();
    assert!(total >= summary["report"]["elapsed_secs"].as_f64().unwrap());
}

#[test]
fn test_watermark_advances_after_run() {
    let (_tmp, config_path, logs_dir) = setup_test_env();
    let dir = logs_dir.to_str().unwrap();

    let (stdout, _, success) = run_harvest(&config_path, &["watermark", "--sys", "web01"]);
    assert!(success);
    assert!(stdout.contains("stored max:    none"));
    assert!(stdout.contains("2016-01-01T00:00:00+00:00"));

    let (_, stderr, success) = run_harvest(&config_path, &["run", "--sys", "web01", "--dir", dir]);
    assert!(success, "run failed: {}", stderr);

    let (stdout, _, success) = run_harvest(&config_path, &["watermark", "--sys", "web01"]);
    assert!(success);
    assert!(!stdout.contains("stored max:    none"));
}

#[test]
fn test_cleanup_removes_window() {
    let (_tmp, config_path, logs_dir) = setup_test_env();
    let dir = logs_dir.to_str().unwrap();

    let (_, stderr, success) = run_harvest(&config_path, &["run", "--sys", "web01", "--dir", dir]);
    assert!(success, "run failed: {}", stderr);

    let (stdout, stderr, success) =
        run_harvest(&config_path, &["cleanup", "--sys", "web01", "--from", "2016-01-01"]);
    assert!(success, "cleanup failed: {}", stderr);
    assert!(stdout.contains("files deleted: 2"));
    assert!(stdout.contains("lines deleted: 5"));
}

#[test]
fn test_empty_system_tag_is_rejected() {
    let (_tmp, config_path, logs_dir) = setup_test_env();
    let dir = logs_dir.to_str().unwrap();

    let (_, _, success) = run_harvest(&config_path, &["run", "--sys", "", "--dir", dir]);
    assert!(!success);

    let (_, _, success) = run_harvest(&config_path, &["run", "--sys", "web01"]);
    assert!(!success);
}

#[test]
fn test_missing_dir_fails_run() {
    let (tmp, config_path, _) = setup_test_env();
    let missing = tmp.path().join("nope");

    let (_, stderr, success) = run_harvest(
        &config_path,
        &["run", "--sys", "web01", "--dir", missing.to_str().unwrap()],
    );
    assert!(!success);
    assert!(stderr.contains("failed to traverse"), "{}", stderr);
}
