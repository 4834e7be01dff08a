//! Extension registry: discovers descriptor directories under a root and
//! checks them individually and against each other.

use crate::domain::constants::EXTENSION_DESCRIPTOR_FILE;
use crate::domain::models::{ExtensionDescriptor, SchemaKind, ValidationReport, ViolationKind};
use crate::services::contracts::{self, ValidateOptions};
use crate::services::{paths, storage};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use walkdir::WalkDir;

#[derive(Debug, Default)]
pub struct RegistryScan {
    pub descriptors: Vec<ExtensionDescriptor>,
    pub report: ValidationReport,
}

impl RegistryScan {
    pub fn names(&self) -> Vec<String> {
        self.descriptors.iter().map(|d| d.name.clone()).collect()
    }

    /// Every command key across extensions, sorted.
    pub fn commands(&self) -> Vec<String> {
        self.descriptors
            .iter()
            .flat_map(|d| d.commands.iter().map(|c| c.key.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.descriptors
            .iter()
            .flat_map(|d| d.capabilities.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

pub fn scan(root: &Path, strict: bool) -> RegistryScan {
    let mut out = RegistryScan::default();

    if !root.is_dir() {
        out.report.record(
            ViolationKind::InvariantViolation,
            strict,
            "extensions.root_missing",
            root.display().to_string(),
            format!("extension root {} does not exist", root.display()),
        );
        return out;
    }

    let walk = WalkDir::new(root)
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
                    e.path()
                        .unwrap_or(root)
                        .display()
                        .to_string(),
                    e.to_string(),
                );
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().to_string();
        if dir_name.starts_with('.') {
            continue;
        }
        let context = format!("extensions/{dir_name}");
        let loaded = load_descriptor(entry.path(), &dir_name, &context, strict, &mut out.report);
        if let Some(descriptor) = loaded {
            check_entrypoints(&descriptor, &context, strict, &mut out.report);
            check_command_paths(&descriptor, &context, strict, &mut out.report);
            out.descriptors.push(descriptor);
        }
    }

    check_duplicates(&out.descriptors, strict, &mut out.report);
    tracing::debug!(
        root = %root.display(),
        extensions = out.descriptors.len(),
        findings = out.report.findings.len(),
        "scanned extension registry"
    );
    out
}

fn load_descriptor(
    dir: &Path,
    dir_name: &str,
    context: &str,
    strict: bool,
    report: &mut ValidationReport,
) -> Option<ExtensionDescriptor> {
    let path = dir.join(EXTENSION_DESCRIPTOR_FILE);
    if !path.is_file() {
        report.record(
            ViolationKind::SchemaViolation,
            strict,
            "extension.descriptor_missing",
            context,
            format!("missing {EXTENSION_DESCRIPTOR_FILE}"),
        );
        return None;
    }

    let doc = match storage::load_document(&path) {
        Ok(doc) => doc,
        Err(e) => {
            report.error(
                ViolationKind::SchemaViolation,
                "document.malformed",
                context,
                format!("cannot parse {EXTENSION_DESCRIPTOR_FILE}: {e}"),
            );
            return None;
        }
    };

    let opts = ValidateOptions {
        strict,
        source_root: None,
    };
    let shape = contracts::validate_at(&doc, SchemaKind::Extension, context, &opts);
    report.extend(shape);
    if !doc.is_object() {
        return None;
    }

    let text = |key: &str| {
        doc.get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
    };
    let mut capabilities: Vec<String> = Vec::new();
    for cap in doc
        .get("capabilities")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        if !capabilities.iter().any(|c| c == cap) {
            capabilities.push(cap.to_string());
        }
    }

    Some(ExtensionDescriptor {
        name: text("name")
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| dir_name.to_string()),
        version: text("version").unwrap_or_default(),
        description: text("description"),
        capabilities,
        entrypoints: contracts::entrypoints_of(&doc),
        commands: contracts::commands_of(&doc),
        command_contract: contracts::command_contract_of(&doc),
        dir_name: dir_name.to_string(),
        root: dir.to_path_buf(),
    })
}

/// Lexically unsafe entrypoints were already reported by the shape check;
/// here only symlink escapes and missing files are left to find.
fn check_entrypoints(
    descriptor: &ExtensionDescriptor,
    context: &str,
    strict: bool,
    report: &mut ValidationReport,
) {
    for ep in &descriptor.entrypoints {
        if paths::ensure_safe_relative(&ep.path).is_err() {
            continue;
        }
        let path = format!("{context}.entrypoints.{}", ep.key);
        match paths::resolve_safe_child(&descriptor.root, &ep.path) {
            Err(e) => report.error(
                ViolationKind::TraversalViolation,
                "extension.entrypoint_escape",
                path,
                e.to_string(),
            ),
            Ok(resolved) if !resolved.is_file() => report.record(
                ViolationKind::InvariantViolation,
                strict,
                "extension.entrypoint_missing",
                path,
                format!("entrypoint `{}` not found", ep.path),
            ),
            Ok(_) => {}
        }
    }
}

fn check_command_paths(
    descriptor: &ExtensionDescriptor,
    context: &str,
    strict: bool,
    report: &mut ValidationReport,
) {
    for command in &descriptor.commands {
        if paths::ensure_safe_relative(&command.path).is_err() {
            continue;
        }
        let path = format!("{context}.commands.{}", command.key);
        match paths::resolve_safe_child(&descriptor.root, &command.path) {
            Err(e) => report.error(
                ViolationKind::TraversalViolation,
                "extension.command_escape",
                path,
                e.to_string(),
            ),
            Ok(resolved) if !resolved.is_file() => report.record(
                ViolationKind::InvariantViolation,
                strict,
                "extension.command_missing",
                path,
                format!("command `{}` not found", command.path),
            ),
            Ok(_) => {}
        }
    }
}

fn check_duplicates(
    descriptors: &[ExtensionDescriptor],
    strict: bool,
    report: &mut ValidationReport,
) {
    let mut by_name: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    let mut by_capability: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    let mut by_command: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for d in descriptors {
        let owner = format!("{} ({})", d.name, d.dir_name);
        by_name.entry(d.name.as_str()).or_default().push(owner.clone());
        for cap in &d.capabilities {
            by_capability
                .entry(cap.as_str())
                .or_default()
                .push(owner.clone());
        }
        for command in &d.commands {
            by_command
                .entry(command.key.as_str())
                .or_default()
                .push(owner.clone());
        }
    }

    for (name, owners) in by_name.iter().filter(|(_, o)| o.len() > 1) {
        report.record(
            ViolationKind::InvariantViolation,
            strict,
            "extension.duplicate_name",
            format!("extensions.{name}"),
            format!("extension name `{name}` is declared by: {}", owners.join(", ")),
        );
    }
    for (cap, owners) in by_capability.iter().filter(|(_, o)| o.len() > 1) {
        report.record(
            ViolationKind::InvariantViolation,
            strict,
            "extension.duplicate_capability",
            format!("capabilities.{cap}"),
            format!("capability `{cap}` is claimed by: {}", owners.join(", ")),
        );
    }
    for (command, owners) in by_command.iter().filter(|(_, o)| o.len() > 1) {
        report.error(
            ViolationKind::InvariantViolation,
            "extension.duplicate_command",
            format!("commands.{command}"),
            format!("command `{command}` is registered by: {}", owners.join(", ")),
        );
    }
}
