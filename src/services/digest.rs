use crate::domain::errors::DeltaError;
use crate::domain::models::PackageEntry;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

pub fn sha256_file(path: &Path) -> Result<String, DeltaError> {
    let mut file = std::fs::File::open(path).map_err(|source| DeltaError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Aggregate package checksum: entries are sorted by path first, so the
/// result never depends on directory-listing order.
pub fn aggregate_checksum(entries: &[PackageEntry]) -> String {
    let mut sorted: Vec<&PackageEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.path.cmp(&b.path));

    let mut hasher = Sha256::new();
    for e in sorted {
        hasher.update(e.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(e.sha256.as_bytes());
        hasher.update([0u8]);
        hasher.update(e.size_bytes.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

pub fn is_sha256_hex(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Renders the `sha256sum`-compatible sidecar.
pub fn render_sidecar(entries: &[PackageEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{}  {}\n", e.sha256, e.path))
        .collect()
}

pub fn parse_sidecar(raw: &str) -> Vec<(String, String)> {
    raw.lines()
        .filter_map(|line| {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (digest, path) = line.split_once("  ")?;
            Some((path.to_string(), digest.to_string()))
        })
        .collect()
}
