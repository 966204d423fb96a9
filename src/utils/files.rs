#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Compute the SHA-256 hash encoded as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write via a temp file and rename so readers never observe partial content.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            AppError::new(
                ErrorCategory::IoError,
                format!("failed to create directory {}: {}", parent.display(), err),
            )
        })?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, data).map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!("failed to write {}: {}", tmp_path.display(), err),
        )
    })?;
    fs::rename(&tmp_path, path).map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!(
                "failed to rename {} -> {}: {}",
                tmp_path.display(),
                path.display(),
                err
            ),
        )
    })?;
    Ok(())
}

/// Resolve a file name inside `base`, rejecting anything that would escape
/// the directory. The rejection is logged by callers.
pub fn confine_to_dir(base: &Path, name: &str) -> Result<PathBuf, AppError> {
    let candidate = Path::new(name);
    let mut components = candidate.components();
    let escape = candidate.is_absolute()
        || components.any(|c| !matches!(c, Component::Normal(_)))
        || name.contains("..");
    if escape || name.is_empty() {
        return Err(AppError::new(
            ErrorCategory::ValidationError,
            format!("path {:?} escapes the upload directory", name),
        )
        .with_code("FS-CONFINE-001"));
    }
    Ok(base.join(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn atomic_write_creates_parents() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("nested/deep/file.json");
        atomic_write(&target, b"{}").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"{}");
    }

    #[test]
    fn confine_rejects_traversal() {
        let base = Path::new("/srv/uploads");
        assert!(confine_to_dir(base, "../etc/passwd").is_err());
        assert!(confine_to_dir(base, "/etc/passwd").is_err());
        assert!(confine_to_dir(base, "a/../../b").is_err());
        assert!(confine_to_dir(base, "").is_err());
    }

    #[test]
    fn confine_allows_plain_names() {
        let base = Path::new("/srv/uploads");
        let resolved = confine_to_dir(base, "report.pdf").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/uploads/report.pdf"));
    }
}
