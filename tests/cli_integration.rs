//! Integration tests for the patternbank CLI binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Binary pointed at an isolated data dir and home (no user config)
fn patternbank(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("patternbank").expect("binary builds");
    cmd.env("PATTERNBANK_DATA_DIR", dir.path())
        .env("HOME", dir.path())
        .env_remove("RUST_LOG");
    cmd
}

fn save_sample(dir: &TempDir) -> String {
    let output = patternbank(dir)
        .args([
            "--json",
            "save",
            "--name",
            "Agent Resolution Counts",
            "--domain",
            "servicedesk",
            "--question-type",
            "aggregation",
            "--description",
            "count tickets resolved by each support agent",
            "--template",
            "SELECT agent, COUNT(*) FROM tickets WHERE resolved_at >= {{start_date}} GROUP BY agent",
            "--tag",
            "tickets",
        ])
        .output()
        .expect("Failed to execute command");
    assert!(output.status.success(), "save failed: {:?}", output);

    let pattern: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("save emits JSON");
    pattern["pattern_id"].as_str().expect("pattern_id").to_string()
}

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    patternbank(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("save"))
        .stdout(predicate::str::contains("search"))
        .stdout(predicate::str::contains("suggest"))
        .stdout(predicate::str::contains("stats"))
        .stdout(predicate::str::contains("reindex"));
}

#[test]
fn test_save_search_show_roundtrip() {
    let dir = TempDir::new().unwrap();
    let id = save_sample(&dir);

    patternbank(&dir)
        .args(["search", "count tickets resolved by each support agent"])
        .assert()
        .success()
        .stdout(predicate::str::contains(&id));

    let output = patternbank(&dir)
        .args(["--json", "show", &id])
        .output()
        .unwrap();
    assert!(output.status.success());
    let pattern: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(pattern["domain"], "servicedesk");
    assert_eq!(pattern["version"], 1);
    assert_eq!(pattern["status"], "active");
}

#[test]
fn test_search_threshold_flag_raises_score_floor() {
    let dir = TempDir::new().unwrap();
    let id = save_sample(&dir);
    // Close paraphrase of the stored description, but not an exact match
    let query = "tickets resolved by each support agent";

    patternbank(&dir)
        .args(["search", query])
        .assert()
        .success()
        .stdout(predicate::str::contains(&id));

    // The same query finds nothing above a near-exact floor
    patternbank(&dir)
        .args(["search", query, "--threshold", "0.99"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No matching patterns"));
}

#[test]
fn test_suggest_reports_confidence() {
    let dir = TempDir::new().unwrap();
    save_sample(&dir);

    let output = patternbank(&dir)
        .args([
            "--json",
            "suggest",
            "count tickets resolved by each support agent",
            "--domain",
            "servicedesk",
        ])
        .output()
        .unwrap();
    assert!(output.status.success());
    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["matched"], true);
    assert_eq!(result["band"], "high");
    // Without --auto-apply there is never ready-to-run SQL
    assert!(result["sql_ready"].is_null());
}

#[test]
fn test_suggest_no_match_still_succeeds() {
    let dir = TempDir::new().unwrap();
    save_sample(&dir);

    patternbank(&dir)
        .args(["suggest", "completely unrelated marketing question"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No pattern matched"));
}

#[test]
fn test_update_then_history() {
    let dir = TempDir::new().unwrap();
    let id = save_sample(&dir);

    patternbank(&dir)
        .args([
            "update",
            &id,
            "--note",
            "clarify description",
            "--description",
            "tickets resolved per agent per week",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("v2"));

    patternbank(&dir)
        .args(["show", &id, "--history"])
        .assert()
        .success()
        .stdout(predicate::str::contains("v1"))
        .stdout(predicate::str::contains("deprecated"))
        .stdout(predicate::str::contains("clarify description"));
}

#[test]
fn test_delete_then_show_exits_one() {
    let dir = TempDir::new().unwrap();
    let id = save_sample(&dir);

    patternbank(&dir).args(["delete", &id]).assert().success();

    patternbank(&dir)
        .args(["show", &id])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("not found"));

    // Restorable with the explicit flag path
    patternbank(&dir)
        .args(["show", &id, "--include-archived"])
        .assert()
        .success()
        .stdout(predicate::str::contains("archived"));
    patternbank(&dir)
        .args(["restore", &id])
        .assert()
        .success()
        .stdout(predicate::str::contains("v2"));
}

#[test]
fn test_track_feeds_stats() {
    let dir = TempDir::new().unwrap();
    let id = save_sample(&dir);

    patternbank(&dir)
        .args(["track", &id, "--question", "how many tickets?"])
        .assert()
        .success();
    patternbank(&dir)
        .args(["track", &id, "--question", "tickets again", "--failed"])
        .assert()
        .success();

    patternbank(&dir)
        .args(["stats"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 uses"))
        .stdout(predicate::str::contains("50% success"));
}

#[test]
fn test_validation_error_exits_one() {
    let dir = TempDir::new().unwrap();
    patternbank(&dir)
        .args([
            "save",
            "--name",
            "X",
            "--domain",
            "y",
            "--question-type",
            "lookup",
            "--description",
            "",
            "--template",
            "SELECT 1",
        ])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("description"));
}

#[test]
fn test_reindex_reports_count() {
    let dir = TempDir::new().unwrap();
    save_sample(&dir);

    patternbank(&dir)
        .arg("reindex")
        .assert()
        .success()
        .stdout(predicate::str::contains("Reindexed 1 patterns"));
}

#[test]
fn test_config_path_prints() {
    let dir = TempDir::new().unwrap();
    patternbank(&dir)
        .args(["config", "--path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
}
