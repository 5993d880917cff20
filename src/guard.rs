//! Trust boundary for artifacts a plan executes or installs.
//!
//! - Artifact paths must resolve inside one of the configured allowed roots
//! - An empty allow-list admits nothing
//! - Existing paths are canonicalized so symlinks cannot escape a root;
//!   missing paths are normalized lexically
//! - Declared SHA-256 digests are compared before anything is dispatched

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::{Error, Result};

#[derive(Debug, Error)]
pub enum GuardError {
    /// Path is not within any allowed root.
    #[error("Path not allowed: {path} (allowed: {allowed:?})")]
    NotAllowed { path: PathBuf, allowed: Vec<PathBuf> },
}

/// Allow-list of roots that guarded steps may touch.
#[derive(Debug, Clone, Default)]
pub struct PathGuard {
    allowed_roots: Vec<PathBuf>,
}

impl PathGuard {
    pub fn new(allowed_roots: Vec<PathBuf>) -> Self {
        Self { allowed_roots }
    }

    /// Returns the resolved path when it lies inside an allowed root.
    pub fn check(&self, path: &Path) -> std::result::Result<PathBuf, GuardError> {
        let resolved = resolve(path);
        let allowed = self
            .allowed_roots
            .iter()
            .any(|root| starts_with(&resolved, &resolve(root)));

        if allowed {
            Ok(resolved)
        } else {
            Err(GuardError::NotAllowed {
                path: resolved,
                allowed: self.allowed_roots.clone(),
            })
        }
    }
}

fn resolve(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    // Canonicalize the deepest existing ancestor and keep the rest as written.
    let normalized = normalize(path);
    for ancestor in normalized.ancestors().skip(1) {
        if ancestor.as_os_str().is_empty() {
            break;
        }
        if let Ok(base) = ancestor.canonicalize() {
            if let Ok(rest) = normalized.strip_prefix(ancestor) {
                return base.join(rest);
            }
        }
    }
    normalized
}

/// Lexically collapse `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
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

#[cfg(windows)]
fn starts_with(path: &Path, root: &Path) -> bool {
    let path: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
        .collect();
    let root: Vec<String> = root
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
        .collect();
    path.len() >= root.len() && path.iter().zip(&root).all(|(a, b)| a == b)
}

#[cfg(not(windows))]
fn starts_with(path: &Path, root: &Path) -> bool {
    path.starts_with(root)
}

/// Lowercase hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(|e| Error::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare a file against an expected digest, ignoring case and whitespace.
pub fn hash_matches(path: &Path, expected: &str) -> Result<bool> {
    let actual = sha256_file(path)?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}
