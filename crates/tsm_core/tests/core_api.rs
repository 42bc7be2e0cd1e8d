use std::fs;
use std::path::{Path, PathBuf};

use tsm_core::core_api::{
    CoreErrorCode, Dialect, Engine, EngineOptions, GroupPath, ItemId, MergeInstruction,
};

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn fixture(name: &str) -> String {
    let path = fixture_path(name);
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("failed to read {:?}: {}", path, e))
}

fn path(raw: &str) -> GroupPath {
    GroupPath::parse(raw).expect("valid group path")
}

fn id(raw: u32) -> ItemId {
    ItemId::new(raw).expect("non-zero item id")
}

fn copy_fixture(name: &str, dir: &Path) -> PathBuf {
    let target = dir.join("TradeSkillMaster.lua");
    fs::write(&target, fixture(name)).expect("failed to seed target file");
    target
}

fn backup_count(dir: &Path) -> usize {
    fs::read_dir(dir)
        .expect("failed to list dir")
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "bak"))
        .count()
}

#[test]
fn engine_detects_each_dialect() {
    let engine = Engine::new();
    let cases = [
        ("classic.lua", Dialect::Classic),
        ("ascension.lua", Dialect::Ascension),
        ("retail.lua", Dialect::Retail),
        ("retail_empty.lua", Dialect::Retail),
    ];
    for (name, dialect) in cases {
        let session = engine
            .open_text(fixture(name))
            .unwrap_or_else(|e| panic!("failed to open {name}: {e}"));
        assert_eq!(session.dialect(), dialect, "{name}");
        assert_eq!(session.profile(), "Default", "{name}");
    }
}

#[test]
fn untouched_session_round_trips_byte_for_byte() {
    let engine = Engine::new();
    for name in ["classic.lua", "ascension.lua", "retail.lua", "retail_empty.lua"] {
        let text = fixture(name);
        let session = engine.open_text(text.clone()).expect("failed to open fixture");
        assert!(session.render().expect("render").is_empty(), "{name}");
        assert_eq!(session.to_text_modified().expect("render text"), text, "{name}");
    }
}

#[test]
fn classic_groups_and_items_are_loaded() {
    let session = Engine::new()
        .open_text(fixture("classic.lua"))
        .expect("failed to open classic fixture");

    let groups: Vec<String> = session
        .groups()
        .into_iter()
        .map(|g| String::from(g.path))
        .collect();
    assert_eq!(groups, vec!["Armor", "Armor`Cloth", "Weapons"]);

    let cloth = session.items_in(&path("Armor`Cloth")).expect("cloth items");
    assert_eq!(cloth, vec![id(4306), id(14047)]);

    let summary = &session.groups()[1];
    assert_eq!(summary.name, "Cloth");
    assert_eq!(summary.depth, 2);
    assert_eq!(summary.foreign_count, 1);

    assert_eq!(session.existing_item_ids().len(), 3);
}

#[test]
fn ascension_reads_items_from_sibling_container() {
    let session = Engine::new()
        .open_text(fixture("ascension.lua"))
        .expect("failed to open ascension fixture");
    assert_eq!(session.profiles(), ["Default", "Alchemist"]);
    assert_eq!(
        session.items_in(&path("Trade Goods`Herbs")).expect("herbs"),
        vec![id(765), id(2447)]
    );
    assert_eq!(
        session.items_in(&path("Recipes")).expect("recipes"),
        vec![id(6661)]
    );
}

#[test]
fn retail_skips_base_group_and_keeps_pet_entries() {
    let session = Engine::new()
        .open_text(fixture("retail.lua"))
        .expect("failed to open retail fixture");
    let mats = session
        .groups()
        .into_iter()
        .find(|g| g.path == path("Mats"))
        .expect("Mats group");
    assert_eq!(mats.item_count, 1);
    assert_eq!(mats.foreign_count, 1);
    assert_eq!(session.groups().len(), 2);
}

#[test]
fn retail_add_twice_writes_one_entry() {
    let mut session = Engine::new()
        .open_text(fixture("retail_empty.lua"))
        .expect("failed to open empty retail fixture");

    let result = session.merge(&[
        MergeInstruction::add(id(12345), path("Weapons")),
        MergeInstruction::add(id(12345), path("Weapons")),
    ]);
    let stats = result.groups[&path("Weapons")];
    assert_eq!(stats.added, 1);
    assert_eq!(stats.already_present, 1);

    let text = session.to_text_modified().expect("render text");
    assert_eq!(text.matches("\"i:12345\"").count(), 1);
    assert_eq!(
        text,
        "TradeSkillMasterDB = {
\t[\"_version\"] = 88,
\t[\"_scopeKeys\"] = {
\t\t[\"profile\"] = {
\t\t\t\"Default\", -- [1]
\t\t},
\t},
\t[\"p@Default@userData@groups\"] = {
\t\t[\"Weapons\"] = {
\t\t\t[\"items\"] = {
\t\t\t\t\"i:12345\", -- [1]
\t\t\t},
\t\t},
\t},
\t[\"p@Default@internalData@groupTreeCollapsedStatus\"] = {
\t},
}
"
    );
}

#[test]
fn removing_absent_item_changes_nothing() {
    let original = fixture("classic.lua");
    let mut session = Engine::new()
        .open_text(original.clone())
        .expect("failed to open classic fixture");

    let result = session.merge(&[MergeInstruction::remove(id(999), path("Armor"))]);
    assert_eq!(result.groups[&path("Armor")].not_found, 1);
    assert!(result.rejected.is_empty());
    assert_eq!(session.items_in(&path("Armor")).expect("armor"), vec![id(2589)]);
    assert_eq!(session.to_text_modified().expect("render text"), original);
}

#[test]
fn remove_everywhere_clears_every_group() {
    let mut session = Engine::new()
        .open_text(fixture("classic.lua"))
        .expect("failed to open classic fixture");
    session.merge(&[MergeInstruction::add(id(4306), path("Weapons"))]);

    let batch = session.plan_remove_everywhere(&[id(4306)]);
    assert_eq!(batch.len(), 2);
    let result = session.merge(&batch);
    assert_eq!(result.total().removed, 2);
    assert!(!session.existing_item_ids().contains(&id(4306)));

    let text = session.to_text_modified().expect("render text");
    assert!(!text.contains("item:4306:"));
    assert!(text.contains("[\"item:10002:0:0:0:0:0:-54\"] = true,"));
}

#[test]
fn missing_profile_is_reported() {
    let engine = Engine::with_options(EngineOptions {
        profile: Some("Nope".to_string()),
        backup_dir: None,
    });
    let err = engine
        .open_text(fixture("classic.lua"))
        .expect_err("unknown profile should fail");
    assert_eq!(err.code, CoreErrorCode::ProfileNotFound);
    assert!(err.message.contains("Nope"));
}

#[test]
fn explicit_profile_is_selected() {
    let engine = Engine::with_options(EngineOptions {
        profile: Some("Alchemist".to_string()),
        backup_dir: None,
    });
    let session = engine
        .open_text(fixture("ascension.lua"))
        .expect("failed to open ascension fixture");
    assert_eq!(session.profile(), "Alchemist");
    assert!(session.groups().is_empty());
}

#[test]
fn unrecognized_layout_is_reported() {
    let err = Engine::new()
        .open_text("SomeOtherAddonDB = {\n\t[\"profiles\"] = {\n\t},\n}\n")
        .expect_err("foreign addon should fail");
    assert_eq!(err.code, CoreErrorCode::DialectUnrecognized);
}

#[test]
fn truncated_document_fails_before_any_write() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let target = copy_fixture("truncated.lua", dir.path());

    let err = Engine::new()
        .open_path(&target)
        .expect_err("truncated document should fail");
    assert_eq!(err.code, CoreErrorCode::Parse);
    assert!(err.message.contains("TradeSkillMasterDB"));
    assert_eq!(backup_count(dir.path()), 0);
    assert_eq!(
        fs::read_to_string(&target).expect("failed to read target"),
        fixture("truncated.lua")
    );
}

#[test]
fn commit_writes_backup_and_reloads() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let target = copy_fixture("classic.lua", dir.path());

    let mut session = Engine::new()
        .open_path(&target)
        .expect("failed to open classic fixture");
    session.merge(&[MergeInstruction::add(id(3000), path("Weapons"))]);
    let expected = session.to_text_modified().expect("render text");

    let report = session.commit().expect("commit should succeed");
    let backup = report.backup.expect("commit should create a backup");
    assert_eq!(
        fs::read_to_string(&backup).expect("failed to read backup"),
        fixture("classic.lua")
    );
    assert_eq!(fs::read_to_string(&target).expect("failed to read target"), expected);
    assert!(expected.contains(
        "\t\t\t\t[\"Weapons\"] = {\n\t\t\t\t\t[\"items\"] = {\n\t\t\t\t\t\t[\"item:3000:0:0:0:0:0:0\"] = true,\n\t\t\t\t\t},\n\t\t\t\t},\n"
    ));

    assert!(!session.is_modified());
    assert_eq!(session.items_in(&path("Weapons")).expect("weapons"), vec![id(3000)]);
    assert_eq!(backup_count(dir.path()), 1);
}

#[test]
fn commit_with_no_changes_writes_nothing() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let target = copy_fixture("retail.lua", dir.path());

    let mut session = Engine::new().open_path(&target).expect("failed to open");
    let report = session.commit().expect("empty commit should succeed");
    assert!(report.backup.is_none());
    assert_eq!(report.changes_applied, 0);
    assert_eq!(backup_count(dir.path()), 0);
}

#[test]
fn commit_refuses_file_changed_since_load() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let target = copy_fixture("classic.lua", dir.path());

    let mut session = Engine::new().open_path(&target).expect("failed to open");
    session.merge(&[MergeInstruction::add(id(3000), path("Weapons"))]);

    let rewritten = fixture("classic.lua").replace("Icecrown", "Lordaeron");
    fs::write(&target, &rewritten).expect("failed to simulate client write");

    let err = session.commit().expect_err("stale file should be refused");
    assert_eq!(err.code, CoreErrorCode::StaleDocument);
    assert_eq!(fs::read_to_string(&target).expect("failed to read"), rewritten);
    assert_eq!(backup_count(dir.path()), 0);
}

#[test]
fn commit_uses_configured_backup_dir() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let target = copy_fixture("ascension.lua", dir.path());
    let backups = dir.path().join("backups");

    let engine = Engine::with_options(EngineOptions {
        profile: None,
        backup_dir: Some(backups.clone()),
    });
    let mut session = engine.open_path(&target).expect("failed to open");
    session.merge(&[MergeInstruction::add(id(2450), path("Trade Goods"))]);
    session.commit().expect("commit should succeed");

    assert_eq!(backup_count(dir.path()), 0);
    assert_eq!(backup_count(&backups), 1);
}

#[test]
fn session_opened_from_text_cannot_commit_in_place() {
    let mut session = Engine::new()
        .open_text(fixture("classic.lua"))
        .expect("failed to open");
    let err = session.commit().expect_err("no source path");
    assert_eq!(err.code, CoreErrorCode::Io);
}
