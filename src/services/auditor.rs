//! Read-only package audit. Running it twice on the same package gives the
//! same report.

use crate::domain::constants::{CHECKSUM_SIDECAR_FILE, PACKAGE_MANIFEST_FILE, PAYLOAD_DIR};
use crate::domain::models::{
    CheckReport, Package, PackageEntry, PackageMode, SchemaKind, ValidationReport, ViolationKind,
};
use crate::services::contracts::{self, ValidateOptions};
use crate::services::{digest, paths};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Default)]
pub struct AuditOptions {
    /// Check manifest shape and path safety only; leave payload bytes alone.
    pub dry_run: bool,
}

#[derive(Debug, Default)]
pub struct Audit {
    pub package: Option<Package>,
    pub report: ValidationReport,
}

pub fn audit(package_dir: &Path, opts: &AuditOptions) -> Audit {
    let mut out = Audit::default();
    let manifest_path = package_dir.join(PACKAGE_MANIFEST_FILE);
    let Some(doc) = contracts::load_for_validation(&manifest_path, "package", &mut out.report)
    else {
        return out;
    };

    let strict = ValidateOptions {
        strict: true,
        source_root: None,
    };
    out.report
        .extend(contracts::validate(&doc, SchemaKind::Package, &strict));

    // Shape findings already describe why this fails.
    let Ok(package) = serde_json::from_value::<Package>(doc) else {
        return out;
    };

    match package.mode {
        PackageMode::DryRun => out.report.warning(
            ViolationKind::InvariantViolation,
            "package.preview_only",
            "package.mode",
            "dry-run package: no payload to verify",
        ),
        PackageMode::Full if !opts.dry_run => {
            let payload = package_dir.join(PAYLOAD_DIR);
            verify_payload(&package.entries, &payload, &mut out.report);
            check_sidecar(&package.entries, package_dir, &mut out.report);
            check_unlisted(&package.entries, &payload, &mut out.report);
        }
        PackageMode::Full => {}
    }

    tracing::debug!(
        package = %package_dir.display(),
        errors = out.report.error_count(),
        warnings = out.report.warning_count(),
        "audited package"
    );
    out.package = Some(package);
    out
}

pub fn check(package_dir: &Path, opts: &AuditOptions) -> CheckReport {
    let audit = audit(package_dir, opts);
    CheckReport {
        package_dir: package_dir.display().to_string(),
        mode: audit.package.as_ref().map(|p| p.mode),
        entry_count: audit.package.as_ref().map(|p| p.entries.len()).unwrap_or(0),
        package_checksum: audit.package.map(|p| p.package_checksum),
        report: audit.report,
    }
}

/// Re-derives size and digest of every entry under `payload_root`.
/// Entries whose path is lexically unsafe are skipped here; the shape check
/// reports them.
pub fn verify_payload(entries: &[PackageEntry], payload_root: &Path, report: &mut ValidationReport) {
    for (i, entry) in entries.iter().enumerate() {
        if paths::ensure_safe_relative(&entry.path).is_err() {
            continue;
        }
        let at = format!("package.entries[{i}]");
        let file = match paths::resolve_safe_child(payload_root, &entry.path) {
            Ok(file) => file,
            Err(e) => {
                report.error(
                    ViolationKind::TraversalViolation,
                    "package.payload_escape",
                    at,
                    e.to_string(),
                );
                continue;
            }
        };
        if !file.is_file() {
            report.error(
                ViolationKind::IntegrityViolation,
                "package.payload_missing",
                at,
                format!("payload file `{}` is missing", entry.path),
            );
            continue;
        }

        let actual_size = std::fs::metadata(&file).map(|m| m.len());
        match actual_size {
            Ok(size) if size != entry.size_bytes => report.error(
                ViolationKind::IntegrityViolation,
                "package.size_mismatch",
                at.clone(),
                format!(
                    "`{}` is {size} bytes, manifest records {}",
                    entry.path, entry.size_bytes
                ),
            ),
            Ok(_) => {}
            Err(e) => {
                report.error(
                    ViolationKind::IntegrityViolation,
                    "package.payload_unreadable",
                    at,
                    format!("`{}`: {e}", entry.path),
                );
                continue;
            }
        }

        match digest::sha256_file(&file) {
            Ok(sha) if sha != entry.sha256 => report.error(
                ViolationKind::IntegrityViolation,
                "package.checksum_mismatch",
                at,
                format!("`{}` digest {sha} != recorded {}", entry.path, entry.sha256),
            ),
            Ok(_) => {}
            Err(e) => report.error(
                ViolationKind::IntegrityViolation,
                "package.payload_unreadable",
                at,
                e.to_string(),
            ),
        }
    }
}

fn check_sidecar(entries: &[PackageEntry], package_dir: &Path, report: &mut ValidationReport) {
    let path = package_dir.join(CHECKSUM_SIDECAR_FILE);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(_) => {
            report.error(
                ViolationKind::IntegrityViolation,
                "package.sidecar_missing",
                CHECKSUM_SIDECAR_FILE,
                "full package has no checksum sidecar",
            );
            return;
        }
    };

    let sidecar: BTreeMap<String, String> = digest::parse_sidecar(&raw).into_iter().collect();
    let recorded: BTreeMap<&str, &str> = entries
        .iter()
        .map(|e| (e.path.as_str(), e.sha256.as_str()))
        .collect();

    for (rel, sha) in &recorded {
        match sidecar.get(*rel) {
            Some(listed) if listed == sha => {}
            Some(listed) => report.error(
                ViolationKind::IntegrityViolation,
                "package.sidecar_mismatch",
                format!("{CHECKSUM_SIDECAR_FILE}:{rel}"),
                format!("sidecar digest {listed} != manifest {sha}"),
            ),
            None => report.error(
                ViolationKind::IntegrityViolation,
                "package.sidecar_mismatch",
                format!("{CHECKSUM_SIDECAR_FILE}:{rel}"),
                "entry absent from sidecar",
            ),
        }
    }
    for rel in sidecar.keys().filter(|k| !recorded.contains_key(k.as_str())) {
        report.error(
            ViolationKind::IntegrityViolation,
            "package.sidecar_mismatch",
            format!("{CHECKSUM_SIDECAR_FILE}:{rel}"),
            "sidecar lists a file the manifest does not",
        );
    }
}

fn check_unlisted(entries: &[PackageEntry], payload_root: &Path, report: &mut ValidationReport) {
    if !payload_root.is_dir() {
        return;
    }
    let listed: BTreeSet<&str> = entries.iter().map(|e| e.path.as_str()).collect();
    let walk = WalkDir::new(payload_root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walk {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let at = e
                    .path()
                    .and_then(|p| paths::relative_posix(p, payload_root))
                    .map(|rel| format!("{PAYLOAD_DIR}/{rel}"))
                    .unwrap_or_else(|| PAYLOAD_DIR.to_string());
                report.error(
                    ViolationKind::IntegrityViolation,
                    "package.payload_unreadable",
                    at,
                    e.to_string(),
                );
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        let Some(rel) = paths::relative_posix(entry.path(), payload_root) else {
            continue;
        };
        if !listed.contains(rel.as_str()) {
            report.warning(
                ViolationKind::IntegrityViolation,
                "package.unlisted_payload",
                format!("{PAYLOAD_DIR}/{rel}"),
                "payload file is not listed in the manifest",
            );
        }
    }
}
