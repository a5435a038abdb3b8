//! Path normalization utilities.
//!
//! Every path used as a lock identity must be normalized through these
//! functions so that two syntactically different spellings of the same
//! location resolve to the same canonical form.

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Normalize a path to its canonical lock identity.
///
/// Resolves symlinks and returns an absolute path. The target is allowed to
/// not exist yet (lock targets are commonly created by the operation that
/// locks them): the nearest existing ancestor is canonicalized and the
/// remaining components are appended after lexical `.`/`..` cleanup.
///
/// # Example
/// ```ignore
/// let id = canonical_lock_path("cache/objects/ab/new-blob.bin")?;
/// assert!(id.is_absolute());
/// ```
pub fn canonical_lock_path(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        let cwd = std::env::current_dir().context("Failed to get current directory")?;
        cwd.join(path)
    };

    if let Ok(canonical) = absolute.canonicalize() {
        return Ok(canonical);
    }

    // Walk up to the nearest existing ancestor, then re-append what's missing.
    let mut missing: Vec<OsString> = Vec::new();
    let mut cursor = absolute.as_path();
    loop {
        if let Ok(canonical) = cursor.canonicalize() {
            let mut out = canonical;
            for component in missing.iter().rev() {
                out.push(component);
            }
            return Ok(lexical_cleanup(&out));
        }
        match (cursor.parent(), cursor.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                cursor = parent;
            }
            // No existing ancestor at all; fall back to the lexical form.
            _ => return Ok(lexical_cleanup(&absolute)),
        }
    }
}

/// Normalize path, falling back to the original if canonicalization fails.
///
/// This is useful for diagnostics where a best-effort identity is acceptable.
pub fn normalize_or_original(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    canonical_lock_path(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Resolve `.` and `..` components lexically (no filesystem access).
fn lexical_cleanup(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Check if a path is within a directory, by canonical lock identity.
///
/// Returns false if either identity cannot be computed.
pub fn is_within_directory(path: impl AsRef<Path>, dir: impl AsRef<Path>) -> bool {
    match (
        canonical_lock_path(path.as_ref()),
        canonical_lock_path(dir.as_ref()),
    ) {
        (Ok(canonical_path), Ok(canonical_dir)) => canonical_path.starts_with(&canonical_dir),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_canonical_existing_path() {
        let temp = tempdir().unwrap();
        let file_path = temp.path().join("test.txt");
        fs::write(&file_path, "test").unwrap();

        let normalized = canonical_lock_path(&file_path).unwrap();
        assert!(normalized.is_absolute());
        assert!(normalized.exists());
    }

    #[test]
    fn test_canonical_relative_path() {
        let normalized = canonical_lock_path(".").unwrap();
        assert!(normalized.is_absolute());
    }

    #[test]
    fn test_canonical_nonexistent_file_under_existing_dir() {
        let temp = tempdir().unwrap();
        let new_file = temp.path().join("new-blob.bin");

        let normalized = canonical_lock_path(&new_file).unwrap();
        assert!(normalized.is_absolute());
        assert_eq!(normalized.file_name().unwrap(), "new-blob.bin");
        assert_eq!(
            normalized.parent().unwrap(),
            temp.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn test_canonical_deep_nonexistent_suffix() {
        let temp = tempdir().unwrap();
        let deep = temp.path().join("a/b/c/file.txt");

        let normalized = canonical_lock_path(&deep).unwrap();
        assert!(normalized.starts_with(temp.path().canonicalize().unwrap()));
        assert!(normalized.ends_with("a/b/c/file.txt"));
    }

    #[test]
    fn test_two_spellings_same_identity() {
        let temp = tempdir().unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();
        let spelled = temp.path().join("sub/../sub/file.txt");
        let direct = temp.path().join("sub/file.txt");

        assert_eq!(
            canonical_lock_path(&spelled).unwrap(),
            canonical_lock_path(&direct).unwrap()
        );
    }

    #[test]
    fn test_normalize_or_original_never_fails() {
        let weird = Path::new("/nonexistent/root/../x/file.txt");
        let result = normalize_or_original(weird);
        assert!(result.is_absolute());
    }

    #[test]
    fn test_is_within_directory() {
        let temp = tempdir().unwrap();
        let subdir = temp.path().join("subdir");
        fs::create_dir(&subdir).unwrap();
        let file = subdir.join("file.txt");
        fs::write(&file, "test").unwrap();

        assert!(is_within_directory(&file, temp.path()));
        assert!(is_within_directory(&file, &subdir));
        assert!(!is_within_directory(temp.path(), &subdir));
    }
}
