use crate::domain::constants::{
    DEFAULT_CONTRACT_POLICY_PATH, DEFAULT_EXTENSIONS_DIR, DEFAULT_MANIFEST_PATH,
    DEFAULT_POLICY_PATH, TOOL_CONFIG_PATH,
};
use crate::domain::errors::DeltaError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Optional `config/delta-kit.toml`. Read on every invocation; never cached.
#[derive(Debug, Deserialize, Default)]
pub struct ToolConfig {
    #[serde(default)]
    pub paths: ToolPaths,
    #[serde(default)]
    pub import: ImportDefaults,
}

#[derive(Debug, Deserialize)]
pub struct ToolPaths {
    #[serde(default = "default_policy_path")]
    pub policy: PathBuf,
    #[serde(default = "default_manifest_path")]
    pub manifest: PathBuf,
    #[serde(default = "default_extensions_dir")]
    pub extensions_dir: PathBuf,
    #[serde(default = "default_contract_policy_path")]
    pub contract_policy: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            policy: default_policy_path(),
            manifest: default_manifest_path(),
            extensions_dir: default_extensions_dir(),
            contract_policy: default_contract_policy_path(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct ImportDefaults {
    #[serde(default)]
    pub allow_overwrite: bool,
}

fn default_policy_path() -> PathBuf {
    PathBuf::from(DEFAULT_POLICY_PATH)
}

fn default_manifest_path() -> PathBuf {
    PathBuf::from(DEFAULT_MANIFEST_PATH)
}

fn default_extensions_dir() -> PathBuf {
    PathBuf::from(DEFAULT_EXTENSIONS_DIR)
}

fn default_contract_policy_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONTRACT_POLICY_PATH)
}

pub fn load_tool_config(repo: &Path) -> anyhow::Result<ToolConfig> {
    let path = repo.join(TOOL_CONFIG_PATH);
    if !path.exists() {
        return Ok(ToolConfig::default());
    }
    let raw = std::fs::read_to_string(&path)?;
    let config: ToolConfig = toml::from_str(&raw)
        .map_err(|e| anyhow::anyhow!("invalid tool config {}: {e}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded tool config");
    Ok(config)
}

/// Explicit path wins; otherwise the configured default relative to `repo`.
pub fn resolve_under(repo: &Path, explicit: Option<&Path>, default: &Path) -> PathBuf {
    let p = explicit.unwrap_or(default);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        repo.join(p)
    }
}

pub fn load_document(path: &Path) -> Result<serde_json::Value, DeltaError> {
    let raw = std::fs::read_to_string(path).map_err(|source| DeltaError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Pretty JSON with a trailing newline; keys of `Value` maps come out sorted.
pub fn dump_json<T: Serialize>(path: &Path, value: &T) -> Result<(), DeltaError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    std::fs::write(path, body)?;
    Ok(())
}

/// Like [`dump_json`], but readers only ever see the old or the new file.
pub fn replace_json<T: Serialize>(path: &Path, value: &T) -> Result<(), DeltaError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut body = serde_json::to_string_pretty(value)?;
    body.push('\n');
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    std::io::Write::write_all(&mut tmp, body.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn copy_with_parents(src: &Path, dst: &Path) -> Result<u64, DeltaError> {
    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(src, dst).map_err(|source| DeltaError::Read {
        path: src.to_path_buf(),
        source,
    })
}

/// Rename, falling back to copy+remove when staging and target live on
/// different filesystems.
pub fn move_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    match std::fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(src, dst)?;
            std::fs::remove_file(src)
        }
    }
}

pub fn dir_is_empty(path: &Path) -> std::io::Result<bool> {
    Ok(std::fs::read_dir(path)?.next().is_none())
}

/// Appends one line to the operation journal. Best effort: a journal that
/// cannot be written never fails the operation.
pub fn journal(action: &str, data: serde_json::Value) {
    let home = match std::env::var("HOME") {
        Ok(h) => h,
        Err(_) => return,
    };
    let path = PathBuf::from(home).join(".config/delta-kit/journal.jsonl");
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let event = serde_json::json!({
        "ts": unix_timestamp(),
        "action": action,
        "data": data
    });
    let line = format!("{}\n", event);
    let _ = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| std::io::Write::write_all(&mut f, line.as_bytes()));
}

pub fn unix_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    ts.to_string()
}
