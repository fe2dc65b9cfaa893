use assert_cmd::Command;
use predicates::str::contains;

fn cli(wiki: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("scribe-cli").unwrap();
    cmd.arg("--wiki").arg(wiki);
    cmd.env_remove("SCRIBE_VALIDATOR_URL");
    cmd
}

#[test]
fn create_rename_and_search_round_trip_through_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let wiki = dir.path().join("wiki.json");

    cli(&wiki)
        .args(["create", "--title", "Seeds", "--text", "heirloom", "--tag", "garden"])
        .assert()
        .success()
        .stdout(contains("\"created\""));
    cli(&wiki)
        .args(["create", "--title", "Plan", "--text", "order [[Seeds]] early"])
        .assert()
        .success();
    cli(&wiki)
        .args(["create", "--title", "Seeds"])
        .assert()
        .success()
        .stdout(contains("already_exists"));

    cli(&wiki)
        .args(["rename", "--from", "Seeds", "--to", "Seed Catalog"])
        .assert()
        .success()
        .stdout(contains("\"renamed\""));

    let saved = std::fs::read_to_string(&wiki).unwrap();
    assert!(saved.contains("order [[Seed Catalog]] early"));

    cli(&wiki)
        .args(["search", "catalog"])
        .assert()
        .success()
        .stdout(contains("Seed Catalog"));
    cli(&wiki)
        .args(["search", "heirloom", "--exclude-tag", "garden"])
        .assert()
        .success()
        .stdout(contains("\"titles\": []"));
}

#[test]
fn failed_batch_leaves_the_file_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let wiki = dir.path().join("wiki.json");
    cli(&wiki)
        .args(["create", "--title", "Keep", "--text", "original"])
        .assert()
        .success();
    let before = std::fs::read_to_string(&wiki).unwrap();

    let actions = dir.path().join("actions.json");
    std::fs::write(
        &actions,
        r#"[
            {"action": "modify", "title": "Keep", "updates": [{"field": "text", "value": "changed"}]},
            {"action": "rename", "old_title": "Missing", "new_title": "Other"}
        ]"#,
    )
    .unwrap();
    cli(&wiki)
        .arg("apply")
        .arg(&actions)
        .assert()
        .failure()
        .stdout(contains("action_precondition"));

    assert_eq!(std::fs::read_to_string(&wiki).unwrap(), before);
}

#[test]
fn schema_lists_config_sections() {
    let dir = tempfile::tempdir().unwrap();
    cli(&dir.path().join("unused.json"))
        .arg("schema")
        .assert()
        .success()
        .stdout(contains("compression_threshold"));
}

#[test]
fn search_cache_persists_and_is_cleared_by_mutations() {
    let dir = tempfile::tempdir().unwrap();
    let wiki = dir.path().join("wiki.json");
    let cache_dir = dir.path().join("wiki.cache");

    cli(&wiki)
        .args(["create", "--title", "Apple", "--text", "fruit"])
        .assert()
        .success();
    cli(&wiki)
        .args(["search", "fruit"])
        .assert()
        .success()
        .stdout(contains("Apple"));
    assert!(
        std::fs::read_dir(&cache_dir).unwrap().next().is_some(),
        "search wrote a cache image"
    );

    cli(&wiki)
        .args(["create", "--title", "Banana", "--text", "fruit too"])
        .assert()
        .success();
    cli(&wiki)
        .args(["search", "fruit"])
        .assert()
        .success()
        .stdout(contains("Banana"));
}
