//! Write-ahead undo log for atomic imports.
//!
//! Each change to the destination is appended and synced before it is made.
//! The log sits next to the destination, outside the staging directory, and
//! is deleted once the import commits or finishes rolling back. Finding a log
//! at the start of an import means an earlier one was interrupted; replaying
//! it backwards puts the destination back the way it was.

use crate::domain::errors::DeltaError;
use crate::services::{paths, storage};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum UndoRecord {
    Staging { path: PathBuf },
    CreatedDir { path: PathBuf },
    Created { target: PathBuf },
    Replaced { target: PathBuf, backup: PathBuf },
}

#[derive(Debug)]
pub struct UndoLog {
    path: PathBuf,
    file: File,
    records: Vec<UndoRecord>,
}

/// Where the undo log for `destination` lives.
pub fn log_path(destination: &Path) -> Result<PathBuf, DeltaError> {
    let absolute = paths::absolutize(destination)?;
    let name = absolute
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "root".to_string());
    let parent = absolute
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir);
    Ok(parent.join(format!(".delta-import-{name}.undo.jsonl")))
}

pub fn is_pending(destination: &Path) -> bool {
    log_path(destination).map(|p| p.is_file()).unwrap_or(false)
}

impl UndoLog {
    /// Fails if a log is already there; it has to be recovered first.
    pub fn create(path: &Path) -> Result<Self, DeltaError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                DeltaError::TransactionFailure(format!(
                    "cannot open undo log {}: {e}",
                    path.display()
                ))
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            records: Vec::new(),
        })
    }

    pub fn append(&mut self, record: UndoRecord) -> Result<(), DeltaError> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.sync_data()?;
        self.records.push(record);
        Ok(())
    }

    /// Commit point: once the log is gone the import counts as applied.
    pub fn commit(&self) -> Result<(), DeltaError> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Undoes everything logged so far. The log is kept when something could
    /// not be restored, so a later run can try again.
    pub fn rollback(self) -> Vec<String> {
        let problems = undo(&self.records);
        if problems.is_empty() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                return vec![format!("cannot remove undo log {}: {e}", self.path.display())];
            }
        }
        problems
    }
}

/// Replays a log left behind by an interrupted import. `None` when there
/// was nothing to recover.
pub fn recover(destination: &Path) -> Result<Option<Vec<String>>, DeltaError> {
    let path = log_path(destination)?;
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(DeltaError::Read { path, source }),
    };
    // A torn final line was never acted on.
    let records: Vec<UndoRecord> = raw
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect();
    tracing::warn!(
        log = %path.display(),
        records = records.len(),
        "undoing interrupted import"
    );

    let problems = undo(&records);
    if problems.is_empty() {
        std::fs::remove_file(&path)?;
    }
    Ok(Some(problems))
}

fn undo(records: &[UndoRecord]) -> Vec<String> {
    let mut problems = Vec::new();
    for record in records.iter().rev() {
        let outcome = match record {
            UndoRecord::Created { target } => match std::fs::remove_file(target) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
            UndoRecord::Replaced { target, backup } => {
                if backup.exists() {
                    if target.is_file() {
                        let _ = std::fs::remove_file(target);
                    }
                    storage::move_file(backup, target)
                } else {
                    Ok(())
                }
            }
            UndoRecord::CreatedDir { path } => {
                // Only removed when empty.
                let _ = std::fs::remove_dir(path);
                Ok(())
            }
            UndoRecord::Staging { path } => {
                let _ = std::fs::remove_dir_all(path);
                Ok(())
            }
        };
        if let Err(e) = outcome {
            problems.push(format!("{record:?}: {e}"));
        }
    }
    problems
}
