use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../tsm_core/tests/fixtures")
        .join(name)
}

fn seed(name: &str, dir: &Path) -> PathBuf {
    let target = dir.join("TradeSkillMaster.lua");
    fs::copy(fixture_path(name), &target).expect("failed to seed SavedVariables");
    target
}

fn run_cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tsm-reconcile"))
        .args(args)
        .env_remove("TSM_SAVED_VARIABLES")
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run tsm-reconcile CLI")
}

fn stdout_json(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout).expect("stdout should be valid JSON")
}

fn backups(dir: &Path) -> usize {
    fs::read_dir(dir)
        .expect("failed to list dir")
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "bak"))
        .count()
}

#[test]
fn groups_json_lists_classic_tree() {
    let path = fixture_path("classic.lua");
    let path = path.to_string_lossy().to_string();

    let output = run_cli(&["groups", "--json", "--file", &path]);
    assert!(output.status.success());

    let json = stdout_json(&output);
    assert_eq!(json["dialect"], "Classic");
    assert_eq!(json["profile"], "Default");
    let paths: Vec<&str> = json["groups"]
        .as_array()
        .expect("groups array")
        .iter()
        .map(|g| g["path"].as_str().expect("path string"))
        .collect();
    assert_eq!(paths, vec!["Armor", "Armor`Cloth", "Weapons"]);
}

#[test]
fn file_path_can_come_from_environment() {
    let path = fixture_path("retail.lua");
    let output = Command::new(env!("CARGO_BIN_EXE_tsm-reconcile"))
        .args(["summary"])
        .env("TSM_SAVED_VARIABLES", &path)
        .output()
        .expect("failed to run tsm-reconcile CLI");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("Dialect:  Retail\n"));
}

#[test]
fn missing_file_argument_is_a_usage_error() {
    let output = run_cli(&["groups"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TSM_SAVED_VARIABLES"));
}

#[test]
fn add_commits_with_backup() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let target = seed("classic.lua", dir.path());
    let target_arg = target.to_string_lossy().to_string();

    let output = run_cli(&["add", "Weapons", "3000", "3001", "--json", "-f", &target_arg]);
    assert!(output.status.success());

    let json = stdout_json(&output);
    assert_eq!(json["dry_run"], false);
    assert_eq!(json["result"]["totals"]["added"], 2);
    assert!(json["commit"]["backup"].is_string());
    assert_eq!(backups(dir.path()), 1);

    let text = fs::read_to_string(&target).expect("failed to read target");
    assert!(text.contains("[\"item:3000:0:0:0:0:0:0\"] = true,"));
    assert!(text.contains("[\"item:3001:0:0:0:0:0:0\"] = true,"));
}

#[test]
fn dry_run_leaves_file_untouched() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let target = seed("ascension.lua", dir.path());
    let target_arg = target.to_string_lossy().to_string();

    let output = run_cli(&[
        "--dry-run",
        "-f",
        &target_arg,
        "create-group",
        "Consumables`Flasks",
    ]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("created Consumables`Flasks\n"));
    assert!(stdout.contains("Dry run: nothing written"));
    assert_eq!(
        fs::read_to_string(&target).expect("failed to read target"),
        fs::read_to_string(fixture_path("ascension.lua")).expect("failed to read fixture")
    );
    assert_eq!(backups(dir.path()), 0);
}

#[test]
fn rejected_move_exits_nonzero_without_writing() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let target = seed("classic.lua", dir.path());
    let target_arg = target.to_string_lossy().to_string();

    let output = run_cli(&["move-group", "Armor", "--to", "Armor`Cloth", "-f", &target_arg]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("move Armor under Armor`Cloth: failed:"));
    assert_eq!(backups(dir.path()), 0);
}

#[test]
fn import_groups_records_by_category() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let target = seed("retail_empty.lua", dir.path());
    let records = dir.path().join("records.json");
    fs::write(
        &records,
        r#"[
            {"id": 152505, "category": "Herbs", "bind": 0},
            {"id": 152510, "category": "Herbs", "bind": 1},
            {"id": 160711, "category": "Cooking", "bind": 0}
        ]"#,
    )
    .expect("failed to write records");

    let output = run_cli(&[
        "import",
        &records.to_string_lossy(),
        "--prefix",
        "Scraped",
        "--bind",
        "0",
        "--json",
        "-f",
        &target.to_string_lossy(),
    ]);
    assert!(output.status.success());

    let json = stdout_json(&output);
    assert_eq!(json["result"]["import"]["planned"], 2);
    assert_eq!(
        json["result"]["import"]["filtered_by_bind"],
        serde_json::json!([152510])
    );
    assert_eq!(json["result"]["merge"]["totals"]["added"], 2);

    let text = fs::read_to_string(&target).expect("failed to read target");
    assert!(text.contains("\t\t[\"Scraped`Herbs\"] = {\n\t\t\t[\"items\"] = {\n\t\t\t\t\"i:152505\", -- [1]\n"));
    assert!(text.contains("\"i:160711\""));
    assert!(!text.contains("152510"));
}

#[test]
fn config_file_supplies_path_and_backup_dir() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    seed("classic.lua", dir.path());
    let config = dir.path().join("tsm.json");
    fs::write(
        &config,
        r#"{"tsm_path": "TradeSkillMaster.lua", "backup_dir": "backups"}"#,
    )
    .expect("failed to write config");

    let output = run_cli(&[
        "--config",
        &config.to_string_lossy(),
        "remove-everywhere",
        "4306",
    ]);
    assert!(output.status.success());
    assert_eq!(backups(dir.path()), 0);
    assert_eq!(backups(&dir.path().join("backups")), 1);

    let text = fs::read_to_string(dir.path().join("TradeSkillMaster.lua"))
        .expect("failed to read target");
    assert!(!text.contains("item:4306:"));
}

#[test]
fn unknown_profile_fails() {
    let path = fixture_path("classic.lua");
    let output = run_cli(&["--profile", "Nope", "summary", "-f", &path.to_string_lossy()]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Nope"));
}
