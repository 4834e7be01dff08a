//! Package importer.
//!
//! Atomic imports copy the payload into a staging directory next to the
//! destination and verify it there. Files are then moved into place one by
//! one, each move preceded by a synced record in an undo log kept outside the
//! staging directory. A failure replays that log backwards right away; a
//! killed process leaves the log behind and the next import replays it
//! before doing anything else.

use crate::domain::constants::PAYLOAD_DIR;
use crate::domain::errors::DeltaError;
use crate::domain::models::{ImportResult, PackageEntry, PackageMode, ValidationReport, ViolationKind};
use crate::services::auditor::{self, AuditOptions};
use crate::services::undo_log::{self, UndoLog, UndoRecord};
use crate::services::{digest, paths, storage};
use serde_json::json;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

#[derive(Debug, Clone, Copy)]
pub struct ImportOptions {
    pub dry_run: bool,
    pub atomic: bool,
    pub allow_overwrite: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            atomic: true,
            allow_overwrite: false,
        }
    }
}

#[derive(Debug, Clone)]
struct PlannedWrite {
    entry: PackageEntry,
    target: PathBuf,
}

pub fn import(package_dir: &Path, destination: &Path, opts: &ImportOptions) -> ImportResult {
    let mut result = ImportResult {
        package_dir: package_dir.display().to_string(),
        destination: destination.display().to_string(),
        dry_run: opts.dry_run,
        atomic: opts.atomic,
        ..ImportResult::default()
    };

    let shape = auditor::audit(package_dir, &AuditOptions { dry_run: true });
    result.report.extend(shape.report);
    let Some(package) = shape.package else {
        return result;
    };
    if result.report.has_errors() {
        return result;
    }

    if opts.dry_run {
        if undo_log::is_pending(destination) {
            result.report.warning(
                ViolationKind::TransactionFailure,
                "import.recovery_pending",
                result.destination.clone(),
                "an interrupted import will be undone before the next real import",
            );
        }
    } else {
        recover_interrupted(destination, &mut result);
        if result.report.has_errors() {
            return result;
        }
    }

    let writes = plan(&package.entries, destination, opts, &mut result);
    if result.report.has_errors() {
        return result;
    }

    let payload_root = package_dir.join(PAYLOAD_DIR);
    if opts.dry_run {
        result.planned = writes.iter().map(|w| w.entry.path.clone()).collect();
        if package.mode == PackageMode::Full {
            let mut integrity = ValidationReport::new();
            auditor::verify_payload(&entries_of(&writes), &payload_root, &mut integrity);
            result.report.extend_integrity_as_warnings(integrity);
        }
        return result;
    }

    if package.mode == PackageMode::DryRun {
        result.report.error(
            ViolationKind::TransactionFailure,
            "import.preview_package",
            "package.mode",
            "a dry-run package carries no payload; rebuild it in full mode or import with --dry-run",
        );
        return result;
    }

    if opts.atomic {
        apply_atomic(&writes, &payload_root, destination, &mut result);
    } else {
        apply_direct(&writes, &payload_root, &mut result);
    }

    if result.report.is_ok() {
        tracing::info!(
            destination = %destination.display(),
            applied = result.applied.len(),
            skipped = result.skipped_identical.len(),
            "imported state package"
        );
        storage::journal(
            "state-import",
            json!({
                "package_dir": result.package_dir,
                "destination": result.destination,
                "atomic": opts.atomic,
                "applied": result.applied.len(),
                "skipped_identical": result.skipped_identical.len(),
                "package_checksum": package.package_checksum,
            }),
        );
    }
    result
}

fn entries_of(writes: &[PlannedWrite]) -> Vec<PackageEntry> {
    writes.iter().map(|w| w.entry.clone()).collect()
}

fn recover_interrupted(destination: &Path, result: &mut ImportResult) {
    match undo_log::recover(destination) {
        Ok(None) => {}
        Ok(Some(problems)) if problems.is_empty() => result.report.warning(
            ViolationKind::TransactionFailure,
            "import.recovered",
            result.destination.clone(),
            "undid an interrupted import before starting",
        ),
        Ok(Some(problems)) => {
            for problem in problems {
                result.report.error(
                    ViolationKind::TransactionFailure,
                    "import.recovery_incomplete",
                    result.destination.clone(),
                    problem,
                );
            }
        }
        Err(e) => result.report.error(
            ViolationKind::TransactionFailure,
            "import.recovery_incomplete",
            result.destination.clone(),
            e.to_string(),
        ),
    }
}

/// Decides per entry whether it is written, skipped as identical, or in
/// conflict with what the destination already holds.
fn plan(
    entries: &[PackageEntry],
    destination: &Path,
    opts: &ImportOptions,
    result: &mut ImportResult,
) -> Vec<PlannedWrite> {
    let mut writes = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let at = format!("package.entries[{i}]");
        let target = match paths::resolve_safe_child(destination, &entry.path) {
            Ok(target) => target,
            Err(e) => {
                result.report.error(
                    ViolationKind::TraversalViolation,
                    "import.unsafe_target",
                    at,
                    e.to_string(),
                );
                continue;
            }
        };

        if target.is_dir() {
            result.report.error(
                ViolationKind::InvariantViolation,
                "import.conflict",
                at,
                format!("`{}` exists as a directory in the destination", entry.path),
            );
            continue;
        }
        if target.is_file() {
            let same = digest::sha256_file(&target)
                .map(|sha| sha == entry.sha256)
                .unwrap_or(false);
            if same {
                result.skipped_identical.push(entry.path.clone());
                continue;
            }
            if !opts.allow_overwrite {
                result.report.error(
                    ViolationKind::InvariantViolation,
                    "import.conflict",
                    at,
                    format!(
                        "`{}` exists with different content; pass --allow-overwrite to replace it",
                        entry.path
                    ),
                );
                continue;
            }
        }
        writes.push(PlannedWrite {
            entry: entry.clone(),
            target,
        });
    }
    writes
}

fn apply_atomic(
    writes: &[PlannedWrite],
    payload_root: &Path,
    destination: &Path,
    result: &mut ImportResult,
) {
    let mut tx = match ImportTransaction::begin(destination) {
        Ok(tx) => tx,
        Err(e) => {
            result.report.error(
                ViolationKind::TransactionFailure,
                "import.stage_failed",
                result.destination.clone(),
                e.to_string(),
            );
            return;
        }
    };

    if let Err(e) = tx.stage(writes, payload_root) {
        result.report.error(
            e.kind(),
            "import.stage_failed",
            result.package_dir.clone(),
            e.to_string(),
        );
        abort(tx, result);
        return;
    }

    tx.verify(writes, &mut result.report);
    if result.report.has_errors() {
        abort(tx, result);
        return;
    }

    if let Err(e) = tx.commit(writes) {
        result.report.error(
            e.kind(),
            "import.commit_failed",
            result.destination.clone(),
            e.to_string(),
        );
        abort(tx, result);
        return;
    }
    match tx.finish() {
        Ok(()) => result.applied = writes.iter().map(|w| w.entry.path.clone()).collect(),
        Err(e) => {
            result.report.error(
                e.kind(),
                "import.commit_failed",
                result.destination.clone(),
                e.to_string(),
            );
            abort(tx, result);
        }
    }
}

fn abort(tx: ImportTransaction, result: &mut ImportResult) {
    let leftovers = tx.rollback();
    result.rolled_back = true;
    for problem in leftovers {
        result.report.error(
            ViolationKind::TransactionFailure,
            "import.rollback_incomplete",
            result.destination.clone(),
            problem,
        );
    }
    tracing::warn!(destination = %result.destination, "import rolled back");
}

/// Writes straight into the destination and stops at the first failure.
/// The payload is verified up front, so only I/O errors can leave the
/// destination half written.
fn apply_direct(writes: &[PlannedWrite], payload_root: &Path, result: &mut ImportResult) {
    result.report.warning(
        ViolationKind::TransactionFailure,
        "import.non_atomic",
        result.destination.clone(),
        "non-atomic import: a failure can leave the destination partially updated",
    );

    auditor::verify_payload(&entries_of(writes), payload_root, &mut result.report);
    if result.report.has_errors() {
        return;
    }

    for w in writes {
        match write_verified(w, payload_root) {
            Ok(()) => result.applied.push(w.entry.path.clone()),
            Err(e) => {
                result.report.error(
                    e.kind(),
                    "import.apply_failed",
                    w.entry.path.clone(),
                    e.to_string(),
                );
                result.partially_applied = !result.applied.is_empty();
                tracing::warn!(path = %w.entry.path, "non-atomic import stopped midway");
                return;
            }
        }
    }
}

fn write_verified(w: &PlannedWrite, payload_root: &Path) -> Result<(), DeltaError> {
    let src = paths::resolve_safe_child(payload_root, &w.entry.path)?;
    let sha = digest::sha256_file(&src)?;
    if sha != w.entry.sha256 {
        return Err(DeltaError::IntegrityViolation {
            path: w.entry.path.clone(),
            message: format!("payload digest {sha} != recorded {}", w.entry.sha256),
        });
    }
    storage::copy_with_parents(&src, &w.target)?;
    let written = digest::sha256_file(&w.target)?;
    if written != w.entry.sha256 {
        return Err(DeltaError::IntegrityViolation {
            path: w.entry.path.clone(),
            message: format!("written digest {written} != recorded {}", w.entry.sha256),
        });
    }
    Ok(())
}

/// Staging area plus the undo log for one atomic import.
#[derive(Debug)]
struct ImportTransaction {
    staging: TempDir,
    log: UndoLog,
}

impl ImportTransaction {
    fn begin(destination: &Path) -> Result<Self, DeltaError> {
        let created = missing_dirs(destination);
        for dir in &created {
            std::fs::create_dir(dir)?;
        }

        let log_path = undo_log::log_path(destination)?;
        let mut log = match UndoLog::create(&log_path) {
            Ok(log) => log,
            Err(e) => {
                for dir in created.iter().rev() {
                    let _ = std::fs::remove_dir(dir);
                }
                return Err(e);
            }
        };
        for dir in created {
            log.append(UndoRecord::CreatedDir { path: dir })?;
        }

        let parent = log_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(std::env::temp_dir);
        let staging = match tempfile::Builder::new()
            .prefix(".delta-import-")
            .tempdir_in(&parent)
        {
            Ok(staging) => staging,
            Err(e) => {
                let _ = log.rollback();
                return Err(DeltaError::TransactionFailure(format!(
                    "cannot create staging area: {e}"
                )));
            }
        };
        log.append(UndoRecord::Staging {
            path: staging.path().to_path_buf(),
        })?;
        tracing::debug!(staging = %staging.path().display(), "opened import transaction");

        Ok(Self { staging, log })
    }

    fn staged(&self, rel: &str) -> PathBuf {
        self.staging.path().join(PAYLOAD_DIR).join(rel)
    }

    fn stage(&self, writes: &[PlannedWrite], payload_root: &Path) -> Result<(), DeltaError> {
        for w in writes {
            let src = paths::resolve_safe_child(payload_root, &w.entry.path)?;
            if !src.is_file() {
                return Err(DeltaError::IntegrityViolation {
                    path: w.entry.path.clone(),
                    message: "payload file is missing".to_string(),
                });
            }
            storage::copy_with_parents(&src, &self.staged(&w.entry.path))?;
        }
        Ok(())
    }

    fn verify(&self, writes: &[PlannedWrite], report: &mut ValidationReport) {
        auditor::verify_payload(
            &entries_of(writes),
            &self.staging.path().join(PAYLOAD_DIR),
            report,
        );
    }

    fn commit(&mut self, writes: &[PlannedWrite]) -> Result<(), DeltaError> {
        for w in writes {
            if let Some(parent) = w.target.parent() {
                for dir in missing_dirs(parent) {
                    self.log.append(UndoRecord::CreatedDir { path: dir.clone() })?;
                    std::fs::create_dir(&dir)?;
                }
            }
            let staged = self.staged(&w.entry.path);
            if w.target.is_file() {
                let backup = self.staging.path().join("backup").join(&w.entry.path);
                if let Some(parent) = backup.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                self.log.append(UndoRecord::Replaced {
                    target: w.target.clone(),
                    backup: backup.clone(),
                })?;
                storage::move_file(&w.target, &backup)?;
                storage::move_file(&staged, &w.target)?;
            } else {
                self.log.append(UndoRecord::Created {
                    target: w.target.clone(),
                })?;
                storage::move_file(&staged, &w.target)?;
            }
        }
        Ok(())
    }

    /// Drops the undo log. The staging directory and backups go with `self`.
    fn finish(&self) -> Result<(), DeltaError> {
        self.log.commit()
    }

    /// Undoes every logged change. Returns what could not be restored.
    fn rollback(self) -> Vec<String> {
        self.log.rollback()
    }
}

/// Ancestors of `dir` (itself included) that do not exist yet, outermost
/// first.
fn missing_dirs(dir: &Path) -> Vec<PathBuf> {
    let mut missing = Vec::new();
    let mut cur = Some(dir);
    while let Some(p) = cur {
        if p.as_os_str().is_empty() || p.exists() {
            break;
        }
        missing.push(p.to_path_buf());
        cur = p.parent();
    }
    missing.reverse();
    missing
}
