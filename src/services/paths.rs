use crate::domain::errors::DeltaError;
use std::path::{Component, Path, PathBuf};
use wildmatch::WildMatch;

/// Validates that `rel` is a package-relative path that cannot climb out of
/// whatever root it is later joined to. Returns the normalized relative path.
pub fn ensure_safe_relative(rel: &str) -> Result<PathBuf, DeltaError> {
    let trimmed = rel.trim();
    if trimmed.is_empty() {
        return Err(DeltaError::traversal(rel, "empty path"));
    }
    if trimmed.starts_with('/') || trimmed.starts_with('\\') || has_drive_prefix(trimmed) {
        return Err(DeltaError::traversal(rel, "absolute paths are not allowed"));
    }
    if trimmed.split(['/', '\\']).any(|seg| seg == "..") {
        return Err(DeltaError::traversal(
            rel,
            "parent-directory segments (`..`) are not allowed",
        ));
    }

    let mut out = PathBuf::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(DeltaError::traversal(
                    rel,
                    "parent-directory segments (`..`) are not allowed",
                ))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(DeltaError::traversal(rel, "absolute paths are not allowed"))
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(DeltaError::traversal(rel, "path does not name a file"));
    }
    Ok(out)
}

fn has_drive_prefix(s: &str) -> bool {
    let b = s.as_bytes();
    b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
}

/// Joins `rel` onto `root` and confirms the result stays inside `root`, also
/// after symlinks in already-existing ancestors are resolved.
pub fn resolve_safe_child(root: &Path, rel: &str) -> Result<PathBuf, DeltaError> {
    let safe = ensure_safe_relative(rel)?;
    let candidate = root.join(&safe);

    let Ok(root_canon) = root.canonicalize() else {
        // Nothing on disk yet, so nothing can redirect the lexical result.
        return Ok(candidate);
    };

    let mut cursor = candidate.as_path();
    loop {
        if cursor.symlink_metadata().is_ok() {
            let resolved = cursor.canonicalize().map_err(|e| {
                DeltaError::traversal(rel, format!("cannot resolve `{}`: {e}", cursor.display()))
            })?;
            if !resolved.starts_with(&root_canon) {
                return Err(DeltaError::traversal(
                    rel,
                    format!("resolves outside root `{}`", root.display()),
                ));
            }
            break;
        }
        match cursor.parent() {
            Some(parent) if parent.starts_with(root) => cursor = parent,
            _ => break,
        }
    }
    Ok(candidate)
}

/// POSIX-style relative path of `path` under `root`.
pub fn relative_posix(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(p) => Some(p.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Normalized `/`-joined form of a relative path already known to be safe.
pub fn normalize_relative(rel: &str) -> Result<String, DeltaError> {
    let safe = ensure_safe_relative(rel)?;
    Ok(safe
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/"))
}

/// Shell-style match against a `/`-separated relative path. `*` also spans
/// directory separators. Used for exclusions.
pub fn glob_matches_any(path: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|p| WildMatch::new(p).matches(path))
}

/// Segment-wise match used to select optional files: `*` and `?` stay inside
/// one path segment and only a `**` segment descends into subdirectories.
pub fn tree_glob_matches_any(path: &str, patterns: &[String]) -> bool {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    patterns.iter().any(|p| {
        let pattern: Vec<&str> = p
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .collect();
        !pattern.is_empty() && match_segments(&pattern, &segments)
    })
}

fn match_segments(pattern: &[&str], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((&"**", rest)) => (0..=path.len()).any(|skip| match_segments(rest, &path[skip..])),
        Some((seg, rest)) => match path.split_first() {
            Some((head, tail)) => WildMatch::new(seg).matches(head) && match_segments(rest, tail),
            None => false,
        },
    }
}

/// Absolute form of `path` with symlinks resolved for the part that exists.
/// Components that do not exist yet are appended unchanged.
pub fn absolutize(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut existing = absolute.as_path();
    let mut rest = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canon) => {
                let mut out = canon;
                for part in rest.iter().rev() {
                    out.push(part);
                }
                return Ok(out);
            }
            Err(e) => {
                let (Some(parent), Some(name)) = (existing.parent(), existing.file_name()) else {
                    return Err(e);
                };
                rest.push(name.to_os_string());
                existing = parent;
            }
        }
    }
}
