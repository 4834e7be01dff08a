use crate::domain::models::ViolationKind;
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum DeltaError {
    #[error("{context}: {message}")]
    SchemaViolation { context: String, message: String },
    #[error("{0}")]
    InvariantViolation(String),
    #[error("unsafe path `{path}`: {reason}")]
    TraversalViolation { path: String, reason: String },
    #[error("{path}: {message}")]
    IntegrityViolation { path: String, message: String },
    #[error("required manifest file missing: {0}")]
    ManifestViolation(String),
    #[error("transaction failure: {0}")]
    TransactionFailure(String),
    #[error("output directory already exists and is not empty: {}", .0.display())]
    OutputNotEmpty(PathBuf),
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot walk {}: {source}", path.display())]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DeltaError {
    pub fn traversal(path: &str, reason: impl Into<String>) -> Self {
        DeltaError::TraversalViolation {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub fn walk(root: &std::path::Path, source: walkdir::Error) -> Self {
        let path = source
            .path()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf());
        DeltaError::Walk { path, source }
    }

    /// Finding kind this error maps to when it is folded into a report.
    pub fn kind(&self) -> ViolationKind {
        match self {
            DeltaError::SchemaViolation { .. } | DeltaError::Json(_) => {
                ViolationKind::SchemaViolation
            }
            DeltaError::InvariantViolation(_) | DeltaError::OutputNotEmpty(_) => {
                ViolationKind::InvariantViolation
            }
            DeltaError::TraversalViolation { .. } => ViolationKind::TraversalViolation,
            DeltaError::IntegrityViolation { .. } => ViolationKind::IntegrityViolation,
            DeltaError::ManifestViolation(_) => ViolationKind::ManifestViolation,
            DeltaError::TransactionFailure(_)
            | DeltaError::Read { .. }
            | DeltaError::Walk { .. }
            | DeltaError::Io(_) => ViolationKind::TransactionFailure,
        }
    }
}
