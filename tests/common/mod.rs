#![allow(dead_code)]

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct TestEnv {
    tmp: TempDir,
    pub home: PathBuf,
    pub repo: PathBuf,
    cargo_home: PathBuf,
    rustup_home: PathBuf,
}

impl TestEnv {
    /// Isolated HOME plus a repository with a valid policy, manifest, state
    /// files and one extension.
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("create temp dir");
        let home = tmp.path().join("home");
        fs::create_dir_all(&home).expect("create isolated home");
        let repo = tmp.path().join("repo");
        make_fixture_repo(&repo);

        let orig_home = std::env::var("HOME").unwrap_or_default();
        let cargo_home = PathBuf::from(&orig_home).join(".cargo");
        let rustup_home = PathBuf::from(&orig_home).join(".rustup");

        Self {
            tmp,
            home,
            repo,
            cargo_home,
            rustup_home,
        }
    }

    /// A path inside the temp area but outside the repository.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.tmp.path().join(name)
    }

    pub fn cmd(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("delta");
        cmd.env("HOME", &self.home)
            .env("CARGO_HOME", &self.cargo_home)
            .env("RUSTUP_HOME", &self.rustup_home)
            .env_remove("DELTA_LOG")
            .env_remove("RUST_LOG")
            .arg("--repo")
            .arg(&self.repo);
        cmd
    }

    /// Runs with `--json`, asserts the exit code and returns the document.
    pub fn run_json_code(&self, args: &[&str], code: i32) -> Value {
        let out = self
            .cmd()
            .arg("--json")
            .args(args)
            .assert()
            .code(code)
            .get_output()
            .stdout
            .clone();
        serde_json::from_slice(&out).expect("valid json output")
    }

    pub fn run_json(&self, args: &[&str]) -> Value {
        self.run_json_code(args, 0)
    }

    pub fn write(&self, rel: &str, body: &str) {
        write_file(&self.repo.join(rel), body);
    }

    pub fn write_json(&self, rel: &str, doc: &Value) {
        let body = serde_json::to_string_pretty(doc).expect("serialize fixture");
        self.write(rel, &body);
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.repo.join(rel)).expect("read repo file")
    }

    pub fn export(&self, out: &Path) -> Value {
        self.run_json(&["state-export", "--out", out.to_str().expect("utf8 path")])
    }
}

pub fn write_file(path: &Path, body: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dir");
    }
    fs::write(path, body).expect("write fixture file");
}

pub fn policy() -> Value {
    json!({
        "version": 1,
        "origin": {"remote": "origin", "branch": "main"},
        "upstream": {"remote": "upstream", "branch": "main", "url": "https://example.com/up.git"},
        "sync_button_policy": {
            "require_clean_worktree": true,
            "max_origin_only_commits": 0,
            "require_upstream_only_commits": false
        },
        "scorecard": {
            "clean_foundation_threshold": 0.7,
            "weights": {
                "privacy_risk": 0.4,
                "simplicity": 0.2,
                "merge_conflict_risk": 0.2,
                "auditability": 0.2
            },
            "weights_normalized": true
        },
        "schedule": {"timezone": "UTC", "weekly_day": "monday", "cron_utc": "0 6 * * 1"},
        "required_capabilities": ["index"]
    })
}

pub fn manifest() -> Value {
    json!({
        "version": 1,
        "package_name": "fixture-state",
        "required_files": ["a.txt", "b.txt", "state/settings.json"],
        "optional_globs": ["logs/*.log"],
        "exclude_globs": ["*.tmp.log"]
    })
}

pub fn contract_policy() -> Value {
    json!({
        "version": 1,
        "targets": {
            "extension_command_contract": {
                "current_version": 1,
                "migration_script": "delta contracts-migrate",
                "notes": "Commands must use <namespace>/<command>."
            }
        }
    })
}

pub fn extension(name: &str, capabilities: &[&str]) -> Value {
    json!({
        "name": name,
        "version": "0.1.0",
        "description": "fixture extension",
        "capabilities": capabilities,
        "entrypoints": {"run": "bin/run.sh"}
    })
}

pub fn add_extension(repo: &Path, dir: &str, doc: &Value) {
    let root = repo.join("extensions").join(dir);
    write_file(
        &root.join("manifest.json"),
        &serde_json::to_string_pretty(doc).expect("serialize extension"),
    );
    write_file(&root.join("bin/run.sh"), "#!/bin/sh\necho run\n");
}

fn make_fixture_repo(repo: &Path) {
    write_file(
        &repo.join("config/migration_sync_policy.json"),
        &serde_json::to_string_pretty(&policy()).expect("serialize policy"),
    );
    write_file(
        &repo.join("config/state_migration_manifest.json"),
        &serde_json::to_string_pretty(&manifest()).expect("serialize manifest"),
    );
    write_file(
        &repo.join("config/delta_contract_policy.json"),
        &serde_json::to_string_pretty(&contract_policy()).expect("serialize contract policy"),
    );
    write_file(&repo.join("a.txt"), "alpha\n");
    write_file(&repo.join("b.txt"), "bravo\n");
    write_file(&repo.join("state/settings.json"), "{\"theme\": \"dark\"}\n");
    write_file(&repo.join("logs/run.log"), "started\n");
    write_file(&repo.join("logs/scratch.tmp.log"), "noise\n");
    add_extension(repo, "indexer", &extension("indexer", &["index"]));
}
