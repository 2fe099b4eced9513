//! Hashing utilities for deterministic task fingerprints.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::UtilError;

/// Compute the SHA-256 hex digest of a byte slice.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Compute the SHA-256 hex digest of a file using streaming reads.
///
/// Uses a 64 KiB buffer so large build outputs (jars, coverage dumps) are never
/// loaded into memory at once.
///
/// # Errors
/// Returns an error if the file cannot be opened or read.
pub fn sha256_file(path: &Path) -> Result<String, UtilError> {
    let mut hasher = Sha256::new();
    feed_file(&mut hasher, path)?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn feed_file(hasher: &mut Sha256, path: &Path) -> Result<(), UtilError> {
    let file = std::fs::File::open(path).map_err(|source| UtilError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = std::io::BufReader::new(file);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = std::io::Read::read(&mut reader, &mut buf).map_err(|source| UtilError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if n == 0 {
            break;
        }
        let Some(chunk) = buf.get(..n) else {
            break;
        };
        hasher.update(chunk);
    }
    Ok(())
}

/// Expand `patterns` relative to `base` into a sorted, de-duplicated file list.
///
/// A pattern that matches a directory contributes every file below it.
///
/// # Errors
/// Returns an error if a pattern is invalid or a matched directory cannot be read.
pub fn expand_patterns(base: &Path, patterns: &[String]) -> Result<Vec<PathBuf>, UtilError> {
    let mut files = Vec::new();
    for pattern in patterns {
        let full_pattern = base.join(pattern).display().to_string();
        let matches = glob::glob(&full_pattern).map_err(|e| UtilError::GlobPattern {
            pattern: full_pattern.clone(),
            message: e.to_string(),
        })?;
        for path in matches.filter_map(Result::ok) {
            if path.is_dir() {
                files.extend(crate::fs::walk_files(&path)?);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

/// Hash every file matched by `patterns` under `base`, sorted by path.
///
/// Relative paths are part of the digest so renames are detected. An empty
/// match set still produces a valid digest.
///
/// # Errors
/// Returns an error if a pattern is invalid or any matched file cannot be read.
pub fn sha256_patterns(base: &Path, patterns: &[String]) -> Result<String, UtilError> {
    let files = expand_patterns(base, patterns)?;
    let mut hasher = Sha256::new();
    for path in &files {
        let relative = path.strip_prefix(base).unwrap_or(path);
        let name = relative.display().to_string();
        hasher.update(name.len().to_le_bytes());
        hasher.update(name.as_bytes());
        feed_file(&mut hasher, path)?;
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash a file or a whole directory tree. Returns `None` when `path` is absent.
///
/// # Errors
/// Returns an error if the path exists but cannot be read.
pub fn sha256_path(path: &Path) -> Result<Option<String>, UtilError> {
    if path.is_file() {
        return sha256_file(path).map(Some);
    }
    if !path.is_dir() {
        return Ok(None);
    }
    let mut hasher = Sha256::new();
    for file in crate::fs::walk_files(path)? {
        let name = file.strip_prefix(path).unwrap_or(&file).display().to_string();
        hasher.update(name.len().to_le_bytes());
        hasher.update(name.as_bytes());
        feed_file(&mut hasher, &file)?;
    }
    Ok(Some(format!("{:x}", hasher.finalize())))
}

/// Combine multiple string parts into a single composite SHA-256 hash.
///
/// Each part is hashed in order with a length prefix to prevent ambiguity.
pub fn sha256_multi(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        // Length-prefix each part to avoid collisions like ["ab","c"] vs ["a","bc"].
        hasher.update(part.len().to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}
