use std::path::{Component, Path, PathBuf};

use crate::error::InputsError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelativePathIssue {
    Absolute,
    DrivePrefix,
    ParentSegment,
}

/// Normalizes a manifest target path to forward-slash segments.
///
/// `""` and `"."` both mean the root itself and normalize to `""`.
pub fn normalize_relative(raw: &str) -> Result<String, RelativePathIssue> {
    let unified = raw.replace('\\', "/");
    let trimmed = unified.trim();
    if trimmed.starts_with('/') {
        return Err(RelativePathIssue::Absolute);
    }
    if has_drive_prefix(trimmed) {
        return Err(RelativePathIssue::DrivePrefix);
    }
    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(RelativePathIssue::ParentSegment),
            other => segments.push(other),
        }
    }
    Ok(segments.join("/"))
}

pub(crate) fn has_drive_prefix(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Joins `relative` onto `root`, failing if the lexical result leaves `root`.
pub fn resolve_under(root: &Path, relative: &str) -> Result<PathBuf, InputsError> {
    let escaped = || InputsError::TargetEscaped {
        path: relative.to_string(),
    };
    let normalized = normalize_relative(relative).map_err(|_| escaped())?;
    let mut resolved = root.to_path_buf();
    for segment in normalized.split('/').filter(|segment| !segment.is_empty()) {
        resolved.push(segment);
    }
    if !is_descendant(root, &resolved) {
        return Err(escaped());
    }
    Ok(resolved)
}

/// Lexical containment check; `path == root` counts as contained.
pub fn is_descendant(root: &Path, path: &Path) -> bool {
    let root = lexical_clean(root);
    let path = lexical_clean(path);
    path.starts_with(&root)
}

pub(crate) fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
