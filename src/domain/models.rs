use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Serialize)]
pub struct JsonOut<T: Serialize> {
    pub ok: bool,
    pub data: T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    SchemaViolation,
    InvariantViolation,
    TraversalViolation,
    IntegrityViolation,
    ManifestViolation,
    TransactionFailure,
}

impl ViolationKind {
    /// Safety violations stay fatal whatever the strict flag says.
    pub fn always_fatal(self) -> bool {
        !matches!(
            self,
            ViolationKind::SchemaViolation | ViolationKind::InvariantViolation
        )
    }

    pub fn severity(self, strict: bool) -> Severity {
        if strict || self.always_fatal() {
            Severity::Error
        } else {
            Severity::Warning
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub kind: ViolationKind,
    pub rule_id: String,
    pub message: String,
    pub path: String,
}

/// Ordered, never-truncated list of findings for one operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationReport {
    pub findings: Vec<Finding>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        severity: Severity,
        kind: ViolationKind,
        rule_id: &str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.findings.push(Finding {
            severity,
            kind,
            rule_id: rule_id.to_string(),
            message: message.into(),
            path: path.into(),
        });
    }

    /// Records a finding whose severity follows the kind and the strict flag.
    pub fn record(
        &mut self,
        kind: ViolationKind,
        strict: bool,
        rule_id: &str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.push(kind.severity(strict), kind, rule_id, path, message);
    }

    pub fn error(
        &mut self,
        kind: ViolationKind,
        rule_id: &str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.push(Severity::Error, kind, rule_id, path, message);
    }

    pub fn warning(
        &mut self,
        kind: ViolationKind,
        rule_id: &str,
        path: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.push(Severity::Warning, kind, rule_id, path, message);
    }

    pub fn extend(&mut self, other: ValidationReport) {
        self.findings.extend(other.findings);
    }

    /// Appends `other` with its integrity findings lowered to warnings.
    pub fn extend_integrity_as_warnings(&mut self, other: ValidationReport) {
        self.findings.extend(other.findings.into_iter().map(|mut f| {
            if f.kind == ViolationKind::IntegrityViolation {
                f.severity = Severity::Warning;
            }
            f
        }));
    }

    pub fn error_count(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .count()
    }

    pub fn warning_count(&self) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == Severity::Warning)
            .count()
    }

    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    pub fn is_ok(&self) -> bool {
        !self.has_errors()
    }

    #[cfg(test)]
    pub fn with_rule<'a>(&'a self, rule_id: &'a str) -> impl Iterator<Item = &'a Finding> + 'a {
        self.findings.iter().filter(move |f| f.rule_id == rule_id)
    }
}

impl Serialize for ValidationReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ValidationReport", 4)?;
        s.serialize_field("ok", &self.is_ok())?;
        s.serialize_field("errors", &self.error_count())?;
        s.serialize_field("warnings", &self.warning_count())?;
        s.serialize_field("findings", &self.findings)?;
        s.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaKind {
    Policy,
    Manifest,
    Extension,
    Package,
    ContractPolicy,
}

impl SchemaKind {
    pub fn label(self) -> &'static str {
        match self {
            SchemaKind::Policy => "policy",
            SchemaKind::Manifest => "manifest",
            SchemaKind::Extension => "extension",
            SchemaKind::Package => "package",
            SchemaKind::ContractPolicy => "contract_policy",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StateManifest {
    pub version: u64,
    pub package_name: String,
    pub required_files: Vec<String>,
    #[serde(default)]
    pub optional_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

/// Named path inside an extension: an entrypoint or a command.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entrypoint {
    pub key: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandContract {
    pub version: i64,
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtensionDescriptor {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub capabilities: Vec<String>,
    pub entrypoints: Vec<Entrypoint>,
    /// Keys are `<namespace>/<slug>` once migrated.
    pub commands: Vec<Entrypoint>,
    pub command_contract: Option<CommandContract>,
    /// Directory name under the extension root.
    pub dir_name: String,
    #[serde(skip)]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageMode {
    DryRun,
    Full,
}

impl PackageMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageMode::DryRun => "dry-run",
            PackageMode::Full => "full",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub path: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Persisted as `package_manifest.json`; field names are a stable contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub package_version: u64,
    pub manifest_version: u64,
    pub package_name: String,
    pub created_at: String,
    pub source_root: String,
    pub mode: PackageMode,
    pub entry_count: usize,
    pub entries: Vec<PackageEntry>,
    pub package_checksum: String,
    pub manifest: StateManifest,
}

#[derive(Debug, Serialize)]
pub struct ContractsCheckReport {
    pub strict: bool,
    pub policy: String,
    pub manifest: String,
    pub contract_policy: String,
    pub extensions_dir: String,
    pub extensions: Vec<String>,
    pub capabilities: Vec<String>,
    pub commands: Vec<String>,
    pub report: ValidationReport,
}

#[derive(Debug, Serialize)]
pub struct MigrateReport {
    pub write: bool,
    pub contract_policy: String,
    pub extensions_dir: String,
    pub inspected: usize,
    /// Descriptor files that need (or received) a rewrite.
    pub changed: Vec<String>,
    pub report: ValidationReport,
}

#[derive(Debug, Serialize)]
pub struct ExtensionCheckReport {
    pub strict: bool,
    pub extensions_dir: String,
    pub extensions: Vec<String>,
    pub report: ValidationReport,
}

#[derive(Debug, Serialize)]
pub struct ExportReport {
    pub package_dir: String,
    pub mode: Option<PackageMode>,
    pub package_name: Option<String>,
    pub entry_count: usize,
    pub package_checksum: Option<String>,
    pub payload_files_copied: usize,
    pub entries: Vec<PackageEntry>,
    pub by_top_level: BTreeMap<String, usize>,
    pub report: ValidationReport,
}

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub package_dir: String,
    pub mode: Option<PackageMode>,
    pub entry_count: usize,
    pub package_checksum: Option<String>,
    pub report: ValidationReport,
}

#[derive(Debug, Default, Serialize)]
pub struct ImportResult {
    pub package_dir: String,
    pub destination: String,
    pub dry_run: bool,
    pub atomic: bool,
    /// Writes an import would perform; filled for dry runs.
    pub planned: Vec<String>,
    pub applied: Vec<String>,
    pub skipped_identical: Vec<String>,
    pub rolled_back: bool,
    /// Only ever true for non-atomic imports that stopped midway.
    pub partially_applied: bool,
    pub report: ValidationReport,
}
