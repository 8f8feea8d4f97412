use std::fs;
use std::io::{self, Read};
use std::path::Path;

use crate::error::InputsError;
use crate::paths::{has_drive_prefix, is_descendant};

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZipLimits {
    pub max_entries: usize,
    pub max_file_bytes: u64,
    pub max_total_bytes: u64,
}

impl Default for ZipLimits {
    fn default() -> Self {
        Self {
            max_entries: 5_000,
            max_file_bytes: 20 * 1024 * 1024,
            max_total_bytes: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub entries: usize,
    pub files: usize,
    pub bytes: u64,
}

fn normalize_entry_name(name: &str) -> String {
    name.replace('\\', "/")
}

fn is_disallowed_entry_path(name: &str) -> bool {
    if name.starts_with('/') || has_drive_prefix(name) {
        return true;
    }
    let mut meaningful = 0;
    for segment in name.split('/') {
        match segment {
            ".." => return true,
            "" | "." => {}
            _ => meaningful += 1,
        }
    }
    meaningful == 0
}

/// Extracts `zip_file` into `out_dir`, entry by entry, stopping at the first
/// entry that is unsafe or pushes past `limits`.
///
/// Blocking; run it on a blocking thread from async code.
pub fn extract_zip_safe(
    zip_file: &Path,
    out_dir: &Path,
    limits: ZipLimits,
) -> Result<ExtractStats, InputsError> {
    fs::create_dir_all(out_dir)?;
    let file = fs::File::open(zip_file)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|err| InputsError::Zip(err.to_string()))?;

    let mut stats = ExtractStats::default();
    for index in 0..archive.len() {
        stats.entries += 1;
        if stats.entries > limits.max_entries {
            return Err(InputsError::ZipTooManyEntries {
                max: limits.max_entries,
            });
        }

        let mut entry = archive
            .by_index(index)
            .map_err(|err| InputsError::Zip(err.to_string()))?;
        let name = normalize_entry_name(entry.name());
        if name.is_empty() {
            return Err(InputsError::ZipEmptyName);
        }
        if is_disallowed_entry_path(&name) {
            return Err(InputsError::ZipPathNotAllowed(name));
        }
        if entry
            .unix_mode()
            .is_some_and(|mode| mode & S_IFMT == S_IFLNK)
        {
            return Err(InputsError::ZipSymlink(name));
        }

        let is_dir = name.ends_with('/') || entry.is_dir();
        if !is_dir {
            let size = entry.size();
            if size > limits.max_file_bytes {
                return Err(InputsError::ZipEntryTooLarge {
                    name,
                    size,
                    max: limits.max_file_bytes,
                });
            }
            if stats.bytes + size > limits.max_total_bytes {
                return Err(InputsError::ZipTooLarge {
                    total: stats.bytes + size,
                    max: limits.max_total_bytes,
                });
            }
        }

        let target = name
            .split('/')
            .filter(|segment| !segment.is_empty() && *segment != ".")
            .fold(out_dir.to_path_buf(), |path, segment| path.join(segment));
        if !is_descendant(out_dir, &target) || target == out_dir {
            return Err(InputsError::ZipEscaped(name));
        }

        if is_dir {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)?;
        // Declared sizes can lie; cap what is actually inflated.
        let budget = limits
            .max_file_bytes
            .min(limits.max_total_bytes - stats.bytes);
        let written = io::copy(&mut (&mut entry).take(budget + 1), &mut out)?;
        if written > limits.max_file_bytes {
            return Err(InputsError::ZipEntryTooLarge {
                name,
                size: written,
                max: limits.max_file_bytes,
            });
        }
        if stats.bytes + written > limits.max_total_bytes {
            return Err(InputsError::ZipTooLarge {
                total: stats.bytes + written,
                max: limits.max_total_bytes,
            });
        }
        stats.bytes += written;
        stats.files += 1;
    }

    Ok(stats)
}
