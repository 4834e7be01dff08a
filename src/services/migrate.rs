//! Rewrites extension descriptors onto the current command contract:
//! every command key becomes `<namespace>/<slug>` and `command_contract`
//! names the namespace. Nothing is written unless asked to.

use crate::domain::constants::{COMMAND_CONTRACT_VERSION, EXTENSION_DESCRIPTOR_FILE};
use crate::domain::models::{MigrateReport, SchemaKind, ValidationReport, ViolationKind};
use crate::services::contracts::{self, ValidateOptions};
use crate::services::storage;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::path::Path;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Default)]
pub struct MigrateOptions {
    pub write: bool,
}

pub fn migrate(contract_policy: &Path, extensions_dir: &Path, opts: &MigrateOptions) -> MigrateReport {
    let mut out = MigrateReport {
        write: opts.write,
        contract_policy: contract_policy.display().to_string(),
        extensions_dir: extensions_dir.display().to_string(),
        inspected: 0,
        changed: Vec::new(),
        report: ValidationReport::new(),
    };

    let Some(policy) =
        contracts::load_for_validation(contract_policy, "contract_policy", &mut out.report)
    else {
        return out;
    };
    let strict = ValidateOptions {
        strict: true,
        source_root: None,
    };
    out.report
        .extend(contracts::validate(&policy, SchemaKind::ContractPolicy, &strict));
    if out.report.has_errors() {
        return out;
    }
    if !extensions_dir.is_dir() {
        out.report.error(
            ViolationKind::InvariantViolation,
            "extensions.root_missing",
            out.extensions_dir.clone(),
            format!("extension root {} does not exist", extensions_dir.display()),
        );
        return out;
    }

    let walk = WalkDir::new(extensions_dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name();
    for entry in walk {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                out.report.error(
                    ViolationKind::TransactionFailure,
                    "extensions.unreadable",
                    e.path().unwrap_or(extensions_dir).display().to_string(),
                    e.to_string(),
                );
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let path = entry.path().join(EXTENSION_DESCRIPTOR_FILE);
        if !path.is_file() {
            continue;
        }
        out.inspected += 1;

        let context = format!(
            "extensions/{}",
            entry.file_name().to_string_lossy()
        );
        let Some(doc) = contracts::load_for_validation(&path, &context, &mut out.report) else {
            continue;
        };
        let migrated = match migrate_descriptor(doc, &context, &mut out.report) {
            Some(migrated) => migrated,
            None => continue,
        };
        out.changed.push(path.display().to_string());
        if opts.write {
            if let Err(e) = storage::replace_json(&path, &migrated) {
                out.report.error(
                    e.kind(),
                    "migrate.write_failed",
                    context,
                    e.to_string(),
                );
            }
        }
    }

    tracing::info!(
        inspected = out.inspected,
        changed = out.changed.len(),
        write = opts.write,
        "contracts migrate finished"
    );
    if opts.write && out.report.is_ok() && !out.changed.is_empty() {
        storage::journal(
            "contracts-migrate",
            json!({
                "extensions_dir": out.extensions_dir,
                "changed": out.changed,
            }),
        );
    }
    out
}

/// The rewritten descriptor, or `None` when it is already current or
/// cannot be migrated (the reason lands in `report`).
fn migrate_descriptor(mut doc: Value, context: &str, report: &mut ValidationReport) -> Option<Value> {
    let Some(descriptor) = doc.as_object_mut() else {
        report.error(
            ViolationKind::SchemaViolation,
            "document.malformed",
            context,
            format!("`{context}` must be a JSON object"),
        );
        return None;
    };
    let commands = match descriptor.get("commands") {
        Some(Value::Object(map)) if !map.is_empty() => map.clone(),
        _ => return None,
    };

    let name = descriptor
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let namespace = contracts::normalize_slug(name);
    if namespace.is_empty() {
        report.error(
            ViolationKind::InvariantViolation,
            "migrate.no_namespace",
            format!("{context}.name"),
            format!("cannot derive a command namespace from name `{name}`"),
        );
        return None;
    }

    let contract_current = contracts::command_contract_of(&Value::Object(descriptor.clone()))
        .is_some_and(|c| c.version == COMMAND_CONTRACT_VERSION && c.namespace == namespace);

    let mut seen = BTreeSet::new();
    let mut migrated = Map::new();
    let mut changed = false;
    for (key, value) in &commands {
        let Some(rel) = value.as_str() else {
            report.error(
                ViolationKind::SchemaViolation,
                "schema.type",
                format!("{context}.commands.{key}"),
                "command paths must be strings",
            );
            return None;
        };
        let key = key.trim();
        let raw = key
            .strip_prefix(namespace.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(key);
        let stable = stable_command_key(&namespace, raw, &mut seen);
        changed |= stable != key;
        migrated.insert(stable, Value::String(rel.to_string()));
    }
    if !changed && contract_current {
        return None;
    }

    descriptor.insert(
        "command_contract".to_string(),
        json!({"version": COMMAND_CONTRACT_VERSION, "namespace": namespace}),
    );
    descriptor.insert("commands".to_string(), Value::Object(migrated));

    let lenient = ValidateOptions::default();
    let check = contracts::validate_at(&doc, SchemaKind::Extension, context, &lenient);
    let failed = check.has_errors();
    report.extend(check);
    if failed {
        return None;
    }
    Some(doc)
}

/// `<namespace>/<slug>`, with `-2`, `-3`, ... appended until unused.
fn stable_command_key(namespace: &str, raw: &str, seen: &mut BTreeSet<String>) -> String {
    let mut slug = contracts::normalize_slug(raw);
    if slug.is_empty() {
        slug = "command".to_string();
    }
    let mut counter = 1;
    loop {
        let key = if counter == 1 {
            format!("{namespace}/{slug}")
        } else {
            format!("{namespace}/{slug}-{counter}")
        };
        if seen.insert(key.clone()) {
            return key;
        }
        counter += 1;
    }
}
