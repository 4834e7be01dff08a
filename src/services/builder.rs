//! Package builder: resolves a state manifest against a source tree and
//! writes a migration package.

use crate::domain::constants::{
    CHECKSUM_SIDECAR_FILE, PACKAGE_FORMAT_VERSION, PACKAGE_MANIFEST_FILE, PAYLOAD_DIR,
};
use crate::domain::errors::DeltaError;
use crate::domain::models::{
    ExportReport, Package, PackageEntry, PackageMode, SchemaKind, StateManifest, ValidationReport,
};
use crate::services::contracts::{self, ValidateOptions};
use crate::services::{digest, paths, storage};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy)]
pub struct BuildOptions {
    pub mode: PackageMode,
    /// Replace a non-empty output directory instead of refusing.
    pub force: bool,
}

/// Relative paths that make up the package, sorted.
///
/// Required files are always members. Optional matches are added next and
/// exclusions only ever remove from that optional set. Every member must
/// resolve inside `source_root`, symlinks included. When `out` lies inside
/// the source tree it is left out of the walk.
pub fn resolve_members(
    manifest: &StateManifest,
    source_root: &Path,
    out: Option<&Path>,
) -> Result<BTreeSet<String>, DeltaError> {
    let mut members = BTreeSet::new();
    for rel in &manifest.required_files {
        let rel = paths::normalize_relative(rel)?;
        if !paths::resolve_safe_child(source_root, &rel)?.is_file() {
            return Err(DeltaError::ManifestViolation(rel));
        }
        members.insert(rel);
    }

    if manifest.optional_globs.is_empty() {
        return Ok(members);
    }

    let skip = match out {
        Some(out) => output_within(source_root, out)?,
        None => None,
    };
    let walker = WalkDir::new(source_root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            match (&skip, paths::relative_posix(e.path(), source_root)) {
                (Some(skip), Some(rel)) => {
                    rel != *skip && !rel.starts_with(&format!("{skip}/"))
                }
                _ => true,
            }
        });

    for entry in walker {
        let entry = entry.map_err(|e| DeltaError::walk(source_root, e))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let Some(rel) = paths::relative_posix(entry.path(), source_root) else {
            continue;
        };
        if members.contains(&rel)
            || !paths::tree_glob_matches_any(&rel, &manifest.optional_globs)
            || paths::glob_matches_any(&rel, &manifest.exclude_globs)
        {
            continue;
        }
        if paths::resolve_safe_child(source_root, &rel)?.is_file() {
            members.insert(rel);
        }
    }
    Ok(members)
}

/// Position of `out` relative to `source_root` when it lies inside it.
/// An output that is the source root, or one of its ancestors, is refused.
fn output_within(source_root: &Path, out: &Path) -> Result<Option<String>, DeltaError> {
    let source = paths::absolutize(source_root)?;
    let out_abs = paths::absolutize(out)?;
    if source.starts_with(&out_abs) {
        return Err(DeltaError::InvariantViolation(format!(
            "output path {} must not be or contain the source root {}",
            out.display(),
            source_root.display()
        )));
    }
    Ok(paths::relative_posix(&out_abs, &source))
}

/// Hashes every member. `out` is the package directory the result will be
/// written to, if any.
pub fn build(
    manifest: &StateManifest,
    source_root: &Path,
    mode: PackageMode,
    out: Option<&Path>,
) -> Result<Package, DeltaError> {
    let members = resolve_members(manifest, source_root, out)?;

    let mut entries = Vec::with_capacity(members.len());
    for rel in members {
        let path = source_root.join(&rel);
        let size_bytes = std::fs::metadata(&path)
            .map_err(|source| DeltaError::Read {
                path: path.clone(),
                source,
            })?
            .len();
        entries.push(PackageEntry {
            sha256: digest::sha256_file(&path)?,
            path: rel,
            size_bytes,
        });
    }

    Ok(Package {
        package_version: PACKAGE_FORMAT_VERSION,
        manifest_version: manifest.version,
        package_name: manifest.package_name.clone(),
        created_at: storage::unix_timestamp(),
        source_root: source_root.display().to_string(),
        mode,
        entry_count: entries.len(),
        package_checksum: digest::aggregate_checksum(&entries),
        entries,
        manifest: manifest.clone(),
    })
}

/// Writes `package` to `out`. Returns the number of payload files copied.
pub fn write_package(
    package: &Package,
    source_root: &Path,
    out: &Path,
    force: bool,
) -> Result<usize, DeltaError> {
    output_within(source_root, out)?;
    if out.exists() && !out.is_dir() {
        return Err(DeltaError::InvariantViolation(format!(
            "output path {} exists and is not a directory",
            out.display()
        )));
    }
    if out.is_dir() && !storage::dir_is_empty(out)? {
        if !force {
            return Err(DeltaError::OutputNotEmpty(out.to_path_buf()));
        }
        tracing::info!(out = %out.display(), "replacing existing package directory");
        std::fs::remove_dir_all(out)?;
    }
    std::fs::create_dir_all(out)?;

    let mut copied = 0;
    if package.mode == PackageMode::Full {
        let payload = out.join(PAYLOAD_DIR);
        for entry in &package.entries {
            let dst = paths::resolve_safe_child(&payload, &entry.path)?;
            storage::copy_with_parents(&source_root.join(&entry.path), &dst)?;
            copied += 1;
        }
        std::fs::write(
            out.join(CHECKSUM_SIDECAR_FILE),
            digest::render_sidecar(&package.entries),
        )?;
    }
    storage::dump_json(&out.join(PACKAGE_MANIFEST_FILE), package)?;
    Ok(copied)
}

/// Validates the manifest, builds and writes the package. Every failure is
/// folded into the returned report.
pub fn export(
    manifest_path: &Path,
    source_root: &Path,
    out: &Path,
    opts: &BuildOptions,
) -> ExportReport {
    let mut result = ExportReport {
        package_dir: out.display().to_string(),
        mode: None,
        package_name: None,
        entry_count: 0,
        package_checksum: None,
        payload_files_copied: 0,
        entries: Vec::new(),
        by_top_level: BTreeMap::new(),
        report: ValidationReport::new(),
    };

    let Some(doc) = contracts::load_for_validation(manifest_path, "manifest", &mut result.report)
    else {
        return result;
    };
    let validate_opts = ValidateOptions {
        strict: true,
        source_root: Some(source_root),
    };
    result
        .report
        .extend(contracts::validate(&doc, SchemaKind::Manifest, &validate_opts));
    if result.report.has_errors() {
        return result;
    }

    let outcome = serde_json::from_value::<StateManifest>(doc)
        .map_err(|e| DeltaError::SchemaViolation {
            context: "manifest".to_string(),
            message: e.to_string(),
        })
        .and_then(|manifest| {
            let package = build(&manifest, source_root, opts.mode, Some(out))?;
            let copied = write_package(&package, source_root, out, opts.force)?;
            Ok((package, copied))
        });

    match outcome {
        Ok((package, copied)) => {
            tracing::info!(
                package = %out.display(),
                mode = package.mode.as_str(),
                entries = package.entry_count,
                "exported state package"
            );
            storage::journal(
                "state-export",
                json!({
                    "package_dir": result.package_dir,
                    "mode": package.mode,
                    "entry_count": package.entry_count,
                    "package_checksum": package.package_checksum,
                }),
            );
            result.by_top_level = count_by_top_level(&package.entries);
            result.mode = Some(package.mode);
            result.package_name = Some(package.package_name);
            result.entry_count = package.entry_count;
            result.package_checksum = Some(package.package_checksum);
            result.payload_files_copied = copied;
            result.entries = package.entries;
        }
        Err(e) => {
            result
                .report
                .error(e.kind(), "export.failed", result.package_dir.clone(), e.to_string());
        }
    }
    result
}

fn count_by_top_level(entries: &[PackageEntry]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for e in entries {
        let top = match e.path.split_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => ".".to_string(),
        };
        *counts.entry(top).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::{build, export, resolve_members, write_package, BuildOptions};
    use crate::domain::errors::DeltaError;
    use crate::domain::models::{Package, PackageMode, StateManifest, ViolationKind};
    use crate::services::storage;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn seed(root: &Path, files: &[(&str, &str)]) {
        for (rel, body) in files {
            let p = root.join(rel);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, body).unwrap();
        }
    }

    fn manifest(required: &[&str], optional: &[&str], exclude: &[&str]) -> StateManifest {
        let list = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect();
        StateManifest {
            version: 1,
            package_name: "test-state".to_string(),
            required_files: list(required),
            optional_globs: list(optional),
            exclude_globs: list(exclude),
        }
    }

    #[test]
    fn required_files_survive_exclusions_and_optional_ones_do_not() {
        let tmp = TempDir::new().unwrap();
        seed(
            tmp.path(),
            &[
                ("a.txt", "a"),
                ("b.txt", "b"),
                ("d.log", "d"),
                ("e.tmp.log", "e"),
                ("notes/f.log", "f"),
            ],
        );
        let m = manifest(&["a.txt", "b.txt"], &["*.log"], &["*.tmp.log", "a.txt"]);
        let members: Vec<_> = resolve_members(&m, tmp.path(), None).unwrap().into_iter().collect();
        assert_eq!(members, vec!["a.txt", "b.txt", "d.log"]);

        let m = manifest(&["a.txt"], &["**/*.log"], &["*.tmp.log"]);
        let members: Vec<_> = resolve_members(&m, tmp.path(), None).unwrap().into_iter().collect();
        assert_eq!(members, vec!["a.txt", "d.log", "notes/f.log"]);
    }

    #[test]
    fn missing_required_file_is_a_manifest_violation() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path(), &[("a.txt", "a")]);
        let m = manifest(&["a.txt", "b.txt"], &[], &[]);
        let err = build(&m, tmp.path(), PackageMode::DryRun, None).unwrap_err();
        assert!(matches!(err, DeltaError::ManifestViolation(ref p) if p == "b.txt"));
        assert_eq!(err.kind(), ViolationKind::ManifestViolation);
    }

    #[test]
    fn aggregate_checksum_is_stable_across_builds() {
        let tmp = TempDir::new().unwrap();
        seed(tmp.path(), &[("z/1.txt", "1"), ("a.txt", "a"), ("m/2.log", "2")]);
        let m = manifest(&["a.txt"], &["**/*.txt", "**/*.log"], &[]);
        let first = build(&m, tmp.path(), PackageMode::Full, None).unwrap();
        let second = build(&m, tmp.path(), PackageMode::DryRun, None).unwrap();
        assert_eq!(first.package_checksum, second.package_checksum);
        assert_eq!(first.entry_count, 3);
        let paths: Vec<_> = first.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "m/2.log", "z/1.txt"]);
    }

    #[test]
    fn dry_run_writes_manifest_only() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        seed(src.path(), &[("a.txt", "a")]);
        let pkg = build(&manifest(&["a.txt"], &[], &[]), src.path(), PackageMode::DryRun, None).unwrap();
        let dir = out.path().join("pkg");
        assert_eq!(write_package(&pkg, src.path(), &dir, false).unwrap(), 0);
        assert!(dir.join("package_manifest.json").is_file());
        assert!(!dir.join("payload").exists());
        assert!(!dir.join("checksums.sha256").exists());
    }

    #[test]
    fn full_mode_copies_payload_and_sidecar() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        seed(src.path(), &[("a.txt", "alpha"), ("cfg/b.json", "{}")]);
        let pkg = build(&manifest(&["a.txt", "cfg/b.json"], &[], &[]), src.path(), PackageMode::Full, None)
            .unwrap();
        let dir = out.path().join("pkg");
        assert_eq!(write_package(&pkg, src.path(), &dir, false).unwrap(), 2);
        assert_eq!(fs::read_to_string(dir.join("payload/a.txt")).unwrap(), "alpha");
        let sidecar = fs::read_to_string(dir.join("checksums.sha256")).unwrap();
        assert_eq!(sidecar.lines().count(), 2);

        let raw = fs::read_to_string(dir.join("package_manifest.json")).unwrap();
        let back: Package = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, pkg);
    }

    #[test]
    fn non_empty_output_requires_force() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        seed(src.path(), &[("a.txt", "a")]);
        seed(out.path(), &[("stale.txt", "old")]);
        let pkg = build(&manifest(&["a.txt"], &[], &[]), src.path(), PackageMode::Full, None).unwrap();

        let err = write_package(&pkg, src.path(), out.path(), false).unwrap_err();
        assert!(matches!(err, DeltaError::OutputNotEmpty(_)));
        assert!(out.path().join("stale.txt").exists());

        write_package(&pkg, src.path(), out.path(), true).unwrap();
        assert!(!out.path().join("stale.txt").exists());
        assert!(out.path().join("payload/a.txt").is_file());
    }

    #[test]
    fn export_stops_on_invalid_manifest_without_writing() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        seed(
            src.path(),
            &[(
                "manifest.json",
                r#"{"version": 1, "package_name": "x", "required_files": ["../etc/passwd"]}"#,
            )],
        );
        let dir = out.path().join("pkg");
        let opts = BuildOptions {
            mode: PackageMode::Full,
            force: false,
        };
        let result = export(&src.path().join("manifest.json"), src.path(), &dir, &opts);
        assert!(result.report.has_errors());
        assert_eq!(result.report.with_rule("manifest.unsafe_path").count(), 1);
        assert!(!dir.exists());
    }

    #[test]
    fn export_reports_counts_per_top_level_directory() {
        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        seed(
            src.path(),
            &[
                ("a.txt", "a"),
                ("cfg/1.json", "1"),
                ("cfg/2.json", "2"),
                (
                    "state.json",
                    r#"{"version": 1, "package_name": "x", "required_files": ["a.txt"], "optional_globs": ["cfg/*"]}"#,
                ),
            ],
        );
        let opts = BuildOptions {
            mode: PackageMode::DryRun,
            force: false,
        };
        let result = export(
            &src.path().join("state.json"),
            src.path(),
            &out.path().join("pkg"),
            &opts,
        );
        assert!(result.report.is_ok(), "{:?}", result.report.findings);
        assert_eq!(result.entry_count, 3);
        assert_eq!(result.by_top_level.get("."), Some(&1));
        assert_eq!(result.by_top_level.get("cfg"), Some(&2));
        assert_eq!(result.payload_files_copied, 0);
    }

    fn full() -> BuildOptions {
        BuildOptions {
            mode: PackageMode::Full,
            force: true,
        }
    }

    #[test]
    fn re_export_into_the_source_tree_is_deterministic() {
        let src = TempDir::new().unwrap();
        seed(src.path(), &[("a.txt", "a"), ("d.log", "d")]);
        let m = manifest(&["a.txt"], &["*.log", "**/*.log"], &[]);
        storage::dump_json(&src.path().join("state.json"), &m).unwrap();
        let out = src.path().join("pkg");

        let first = export(&src.path().join("state.json"), src.path(), &out, &full());
        let second = export(&src.path().join("state.json"), src.path(), &out, &full());
        assert!(second.report.is_ok(), "{:?}", second.report.findings);
        let paths: Vec<_> = second.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "d.log"]);
        assert_eq!(first.package_checksum, second.package_checksum);
    }

    #[test]
    fn output_that_is_or_contains_the_source_root_is_refused() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("repo");
        seed(&src, &[("a.txt", "a")]);
        let m = manifest(&["a.txt"], &[], &[]);
        storage::dump_json(&tmp.path().join("state.json"), &m).unwrap();

        for out in [src.clone(), tmp.path().to_path_buf()] {
            let result = export(&tmp.path().join("state.json"), &src, &out, &full());
            let failed: Vec<_> = result.report.with_rule("export.failed").collect();
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].kind, ViolationKind::InvariantViolation);
        }
        assert_eq!(fs::read_to_string(src.join("a.txt")).unwrap(), "a");
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_member_outside_the_source_root_is_a_traversal_violation() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        seed(tmp.path(), &[("secret.txt", "TOP SECRET"), ("src/b.txt", "b")]);
        std::os::unix::fs::symlink(tmp.path().join("secret.txt"), src.join("a.txt")).unwrap();

        let err = build(&manifest(&["a.txt"], &[], &[]), &src, PackageMode::Full, None).unwrap_err();
        assert_eq!(err.kind(), ViolationKind::TraversalViolation);

        let err = build(&manifest(&["b.txt"], &["*.txt"], &[]), &src, PackageMode::Full, None)
            .unwrap_err();
        assert_eq!(err.kind(), ViolationKind::TraversalViolation);

        std::os::unix::fs::symlink(src.join("b.txt"), src.join("c.txt")).unwrap();
        let inside = resolve_members(&manifest(&["c.txt"], &[], &[]), &src, None).unwrap();
        assert!(inside.contains("c.txt"));
    }

    #[cfg(unix)]
    #[test]
    fn unreadable_directory_fails_the_export() {
        use std::os::unix::fs::PermissionsExt;

        let src = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        seed(src.path(), &[("a.txt", "a"), ("locked/x.log", "x")]);
        let locked = src.path().join("locked");
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if fs::read_dir(&locked).is_ok() {
            // Privileged users read through permission bits.
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let m = manifest(&["a.txt"], &["**/*.log"], &[]);
        storage::dump_json(&src.path().join("state.json"), &m).unwrap();
        let result = export(
            &src.path().join("state.json"),
            src.path(),
            &out.path().join("pkg"),
            &full(),
        );
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let failed: Vec<_> = result.report.with_rule("export.failed").collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].kind, ViolationKind::TransactionFailure);
        assert!(!out.path().join("pkg").exists());
    }
}
