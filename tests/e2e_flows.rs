mod common;

use common::{add_extension, extension, manifest, policy, write_file, TestEnv};
use std::path::PathBuf;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

fn entry_paths(data: &Value) -> Vec<String> {
    data["entries"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["path"].as_str().unwrap().to_string())
        .collect()
}

fn rule_count(data: &Value, rule: &str) -> usize {
    data["report"]["findings"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|f| f["rule_id"] == rule)
        .count()
}

fn files_under(root: &Path) -> Vec<String> {
    let mut out: Vec<String> = walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(root).unwrap().display().to_string())
        .collect();
    out.sort();
    out
}

#[test]
fn optional_globs_respect_exclusions_but_required_files_do_not() {
    let env = TestEnv::new();
    env.write_json(
        "config/state_migration_manifest.json",
        &json!({
            "version": 1,
            "package_name": "scenario-a",
            "required_files": ["a.txt", "b.txt"],
            "optional_globs": ["*.log"],
            "exclude_globs": ["*.tmp.log"]
        }),
    );
    fs::remove_dir_all(env.repo.join("logs")).unwrap();
    env.write("c.tmp.log", "temp\n");
    env.write("d.log", "keep\n");

    let pkg = env.scratch("pkg");
    let out = env.export(&pkg);
    assert_eq!(entry_paths(&out["data"]), vec!["a.txt", "b.txt", "d.log"]);
    assert_eq!(out["data"]["payload_files_copied"], 3);
    assert_eq!(
        files_under(&pkg.join("payload")),
        vec!["a.txt", "b.txt", "d.log"]
    );

    let preview = env.scratch("preview");
    let dry = env.run_json(&[
        "state-export",
        "--out",
        preview.to_str().unwrap(),
        "--dry-run",
    ]);
    assert_eq!(entry_paths(&dry["data"]), vec!["a.txt", "b.txt", "d.log"]);
    assert_eq!(dry["data"]["mode"], "dry-run");
    assert_eq!(dry["data"]["payload_files_copied"], 0);
    assert_eq!(dry["data"]["package_checksum"], out["data"]["package_checksum"]);
    assert_eq!(files_under(&preview), vec!["package_manifest.json"]);
}

#[test]
fn shared_capability_is_reported_once_naming_both_extensions() {
    let env = TestEnv::new();
    add_extension(&env.repo, "search", &extension("search", &["index"]));

    let out = env.run_json_code(&["extension-check", "--strict"], 1);
    let dups: Vec<&Value> = out["data"]["report"]["findings"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|f| f["rule_id"] == "extension.duplicate_capability")
        .collect();
    assert_eq!(dups.len(), 1);
    let message = dups[0]["message"].as_str().unwrap();
    assert!(message.contains("indexer") && message.contains("search"));

    // Advisory without --strict.
    let lenient = env.run_json(&["extension-check"]);
    assert_eq!(lenient["ok"], true);
    assert_eq!(lenient["data"]["report"]["warnings"], 1);
}

#[test]
fn export_check_import_round_trip() {
    let env = TestEnv::new();
    let pkg = env.scratch("pkg");
    let export = env.export(&pkg);
    assert_eq!(
        entry_paths(&export["data"]),
        vec!["a.txt", "b.txt", "logs/run.log", "state/settings.json"]
    );
    assert_eq!(export["data"]["by_top_level"]["."], 2);
    assert_eq!(export["data"]["by_top_level"]["logs"], 1);

    let check = env.run_json(&["state-check", "--package", pkg.to_str().unwrap()]);
    assert_eq!(check["data"]["report"]["errors"], 0);
    let again = env.run_json(&["state-check", "--package", pkg.to_str().unwrap()]);
    assert_eq!(check["data"], again["data"]);

    let dest = env.scratch("dest");
    let import = env.run_json(&[
        "state-import",
        "--package",
        pkg.to_str().unwrap(),
        "--target",
        dest.to_str().unwrap(),
    ]);
    assert_eq!(import["data"]["applied"].as_array().unwrap().len(), 4);
    assert_eq!(
        fs::read_to_string(dest.join("state/settings.json")).unwrap(),
        env.read("state/settings.json")
    );

    // Second import is a no-op.
    let repeat = env.run_json(&[
        "state-import",
        "--package",
        pkg.to_str().unwrap(),
        "--target",
        dest.to_str().unwrap(),
    ]);
    assert_eq!(repeat["data"]["applied"].as_array().unwrap().len(), 0);
    assert_eq!(repeat["data"]["skipped_identical"].as_array().unwrap().len(), 4);

    let journal = fs::read_to_string(env.home.join(".config/delta-kit/journal.jsonl")).unwrap();
    assert!(journal.contains("\"state-export\""));
    assert!(journal.contains("\"state-import\""));
}

#[test]
fn tampered_payload_fails_check_and_blocks_import() {
    let env = TestEnv::new();
    let pkg = env.scratch("pkg");
    env.export(&pkg);
    fs::write(pkg.join("payload/b.txt"), "bravO\n").unwrap();

    let check = env.run_json_code(&["state-check", "--package", pkg.to_str().unwrap()], 1);
    assert_eq!(rule_count(&check["data"], "package.checksum_mismatch"), 1);

    let dest = env.scratch("dest");
    write_file(&dest.join("keep.txt"), "mine\n");
    let import = env.run_json_code(
        &[
            "state-import",
            "--package",
            pkg.to_str().unwrap(),
            "--target",
            dest.to_str().unwrap(),
        ],
        1,
    );
    assert_eq!(import["data"]["rolled_back"], true);
    assert_eq!(files_under(&dest), vec!["keep.txt"]);
}

#[test]
fn traversal_entry_is_rejected_everywhere() {
    let env = TestEnv::new();
    let pkg = env.scratch("pkg");
    env.export(&pkg);

    let manifest_path = pkg.join("package_manifest.json");
    let mut doc: Value = serde_json::from_str(&fs::read_to_string(&manifest_path).unwrap()).unwrap();
    doc["entries"][0]["path"] = json!("../../outside.txt");
    fs::write(&manifest_path, doc.to_string()).unwrap();

    let check = env.run_json_code(
        &["state-check", "--package", pkg.to_str().unwrap(), "--dry-run"],
        1,
    );
    assert_eq!(rule_count(&check["data"], "package.unsafe_path"), 1);

    let dest = env.scratch("dest");
    env.run_json_code(
        &[
            "state-import",
            "--package",
            pkg.to_str().unwrap(),
            "--target",
            dest.to_str().unwrap(),
        ],
        1,
    );
    assert!(!env.scratch("outside.txt").exists());
    assert!(files_under(&dest).is_empty());
}

#[test]
fn conflicting_destination_file_needs_allow_overwrite() {
    let env = TestEnv::new();
    let pkg = env.scratch("pkg");
    env.export(&pkg);
    let dest = env.scratch("dest");
    write_file(&dest.join("a.txt"), "local\n");

    let args = [
        "state-import",
        "--package",
        pkg.to_str().unwrap(),
        "--target",
        dest.to_str().unwrap(),
    ];
    let blocked = env.run_json_code(&args, 1);
    assert_eq!(rule_count(&blocked["data"], "import.conflict"), 1);
    assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "local\n");

    let mut forced: Vec<&str> = args.to_vec();
    forced.push("--allow-overwrite");
    env.run_json(&forced);
    assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "alpha\n");
}

#[test]
fn tool_config_can_allow_overwrite() {
    let env = TestEnv::new();
    let pkg = env.scratch("pkg");
    env.export(&pkg);
    let dest = env.scratch("dest");
    write_file(&dest.join("a.txt"), "local\n");
    env.write("config/delta-kit.toml", "[import]\nallow_overwrite = true\n");

    env.run_json(&[
        "state-import",
        "--package",
        pkg.to_str().unwrap(),
        "--target",
        dest.to_str().unwrap(),
    ]);
    assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "alpha\n");
}

#[test]
fn dry_run_import_lists_plan_and_writes_nothing() {
    let env = TestEnv::new();
    let pkg = env.scratch("pkg");
    env.export(&pkg);
    let dest = env.scratch("dest");

    let out = env.run_json(&[
        "state-import",
        "--package",
        pkg.to_str().unwrap(),
        "--target",
        dest.to_str().unwrap(),
        "--dry-run",
    ]);
    assert_eq!(out["data"]["planned"].as_array().unwrap().len(), 4);
    assert!(!dest.exists());
}

#[test]
fn preview_package_cannot_be_imported() {
    let env = TestEnv::new();
    let pkg = env.scratch("pkg");
    env.run_json(&["state-export", "--out", pkg.to_str().unwrap(), "--dry-run"]);

    let out = env.run_json_code(
        &[
            "state-import",
            "--package",
            pkg.to_str().unwrap(),
            "--target",
            env.scratch("dest").to_str().unwrap(),
        ],
        1,
    );
    assert_eq!(rule_count(&out["data"], "import.preview_package"), 1);
}

#[test]
fn export_refuses_non_empty_output_without_force() {
    let env = TestEnv::new();
    let pkg = env.scratch("pkg");
    write_file(&pkg.join("stale.txt"), "old\n");

    let out = env.run_json_code(&["state-export", "--out", pkg.to_str().unwrap()], 1);
    assert_eq!(rule_count(&out["data"], "export.failed"), 1);
    assert!(pkg.join("stale.txt").exists());

    env.run_json(&["state-export", "--out", pkg.to_str().unwrap(), "--force"]);
    assert!(!pkg.join("stale.txt").exists());
    assert!(pkg.join("checksums.sha256").is_file());
}

#[test]
fn missing_required_file_blocks_export() {
    let env = TestEnv::new();
    fs::remove_file(env.repo.join("b.txt")).unwrap();
    let pkg = env.scratch("pkg");

    let out = env.run_json_code(&["state-export", "--out", pkg.to_str().unwrap()], 1);
    assert_eq!(rule_count(&out["data"], "manifest.required_missing"), 1);
    assert!(!pkg.exists());
}

#[test]
fn strict_flag_decides_whether_schema_findings_fail() {
    let env = TestEnv::new();
    let mut doc = policy();
    doc["scorecard"]["clean_foundation_threshold"] = json!(1.4);
    env.write_json("config/migration_sync_policy.json", &doc);

    let lenient = env.run_json(&["contracts-check"]);
    assert_eq!(lenient["ok"], true);
    assert_eq!(lenient["data"]["report"]["warnings"], 1);

    let strict = env.run_json_code(&["contracts-check", "--strict"], 1);
    assert_eq!(strict["data"]["report"]["errors"], 1);
}

#[test]
fn unresolved_capability_is_a_cross_document_finding() {
    let env = TestEnv::new();
    let mut doc = policy();
    doc["required_capabilities"] = json!(["index", "sync"]);
    env.write_json("config/migration_sync_policy.json", &doc);

    let out = env.run_json_code(&["contracts-check", "--strict"], 1);
    assert_eq!(rule_count(&out["data"], "policy.capability_unresolved"), 1);
    assert_eq!(out["data"]["capabilities"], json!(["index"]));
}

#[test]
fn source_root_check_reports_missing_required_files() {
    let env = TestEnv::new();
    let mut doc = manifest();
    doc["required_files"] = json!(["a.txt", "missing.txt"]);
    env.write_json("config/state_migration_manifest.json", &doc);

    let out = env.run_json_code(
        &[
            "contracts-check",
            "--strict",
            "--source-root",
            env.repo.to_str().unwrap(),
        ],
        1,
    );
    assert_eq!(rule_count(&out["data"], "manifest.required_missing"), 1);

    // Without a source root the manifest is checked for shape only.
    env.run_json(&["contracts-check", "--strict"]);
}

#[test]
fn text_output_lists_findings() {
    let env = TestEnv::new();
    add_extension(&env.repo, "search", &extension("search", &["index"]));
    env.cmd()
        .args(["extension-check", "--strict"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("[error] extension.duplicate_capability"))
        .stdout(predicate::str::contains("1 error(s), 0 warning(s)"));
}

#[test]
fn malformed_tool_config_is_an_unhandled_fault() {
    let env = TestEnv::new();
    env.write("config/delta-kit.toml", "[paths\nbroken");
    env.cmd()
        .arg("extension-check")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("ERROR:"));
}

#[test]
fn exporting_into_the_repository_is_repeatable() {
    let env = TestEnv::new();
    let mut doc = manifest();
    doc["optional_globs"] = json!(["**/*.log", "**/*.json"]);
    env.write_json("config/state_migration_manifest.json", &doc);
    let out: PathBuf = env.repo.join("build/pkg");
    let out_arg = out.to_str().unwrap();

    let first = env.run_json(&["state-export", "--out", out_arg, "--force"]);
    let second = env.run_json(&["state-export", "--out", out_arg, "--force"]);
    assert_eq!(first["data"]["package_checksum"], second["data"]["package_checksum"]);
    assert_eq!(entry_paths(&first["data"]), entry_paths(&second["data"]));
    assert!(entry_paths(&second["data"])
        .iter()
        .all(|p| !p.starts_with("build/")));
}

#[test]
fn exporting_over_the_repository_is_refused() {
    let env = TestEnv::new();
    let out = env.run_json_code(
        &["state-export", "--out", env.repo.to_str().unwrap(), "--force"],
        1,
    );
    assert_eq!(rule_count(&out["data"], "export.failed"), 1);
    assert!(env.repo.join("a.txt").is_file());
    assert!(env.repo.join("config/state_migration_manifest.json").is_file());
}

#[test]
fn dry_run_import_of_tampered_package_only_warns() {
    let env = TestEnv::new();
    let pkg = env.scratch("pkg");
    env.export(&pkg);
    fs::write(pkg.join("payload/b.txt"), "bravO\n").unwrap();

    let out = env.run_json(&[
        "state-import",
        "--package",
        pkg.to_str().unwrap(),
        "--target",
        env.scratch("dest").to_str().unwrap(),
        "--dry-run",
    ]);
    assert_eq!(out["ok"], true);
    assert_eq!(rule_count(&out["data"], "package.checksum_mismatch"), 1);
    assert_eq!(out["data"]["report"]["warnings"], 1);
}

#[test]
fn contracts_migrate_namespaces_commands() {
    let env = TestEnv::new();
    let mut doc = extension("Sample Extension", &["sync"]);
    doc["commands"] = json!({"doctor-run": "bin/run.sh"});
    add_extension(&env.repo, "sample", &doc);

    let check = env.run_json_code(&["contracts-check", "--strict"], 1);
    assert_eq!(rule_count(&check["data"], "schema.required"), 1);
    assert_eq!(rule_count(&check["data"], "extension.command_not_namespaced"), 1);

    let dry = env.run_json(&["contracts-migrate"]);
    assert_eq!(dry["data"]["inspected"], 2);
    assert_eq!(dry["data"]["changed"].as_array().unwrap().len(), 1);
    assert!(!env.read("extensions/sample/manifest.json").contains("command_contract"));

    let written = env.run_json(&["contracts-migrate", "--write"]);
    assert_eq!(written["data"]["write"], true);
    let migrated: Value = serde_json::from_str(&env.read("extensions/sample/manifest.json")).unwrap();
    assert_eq!(migrated["command_contract"]["namespace"], "sample-extension");
    assert_eq!(migrated["commands"], json!({"sample-extension/doctor-run": "bin/run.sh"}));

    let check = env.run_json(&["contracts-check", "--strict"]);
    assert_eq!(check["data"]["commands"], json!(["sample-extension/doctor-run"]));
    let journal = fs::read_to_string(env.home.join(".config/delta-kit/journal.jsonl")).unwrap();
    assert!(journal.contains("\"contracts-migrate\""));
}

#[test]
fn command_keys_must_be_unique_across_extensions() {
    let env = TestEnv::new();
    for dir in ["first", "second"] {
        let mut doc = extension("shared", &[dir]);
        doc["commands"] = json!({"shared/run": "bin/run.sh"});
        doc["command_contract"] = json!({"version": 1, "namespace": "shared"});
        add_extension(&env.repo, dir, &doc);
    }

    let out = env.run_json_code(&["extension-check"], 1);
    assert_eq!(rule_count(&out["data"], "extension.duplicate_command"), 1);
    let message = out["data"]["report"]["findings"]
        .as_array()
        .unwrap()
        .iter()
        .find(|f| f["rule_id"] == "extension.duplicate_name")
        .and_then(|f| f["message"].as_str())
        .unwrap()
        .to_string();
    assert!(message.contains("shared (first)") && message.contains("shared (second)"));
}
