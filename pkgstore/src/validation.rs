//! # Input Validation
//!
//! Names reaching the storage layer become directory and file names, so they
//! are checked before any path is built from them.

use crate::error::{StorageError, StorageResult};
use tracing::warn;

/// Maximum allowed package name length (npm rule)
pub const MAX_PACKAGE_NAME_LENGTH: usize = 214;

/// Maximum allowed version string length
pub const MAX_VERSION_LENGTH: usize = 64;

/// Maximum allowed filename length
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Validate an npm package name, plain (`lodash`) or scoped (`@babel/core`).
pub fn validate_package_name(name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::Validation(
            "package name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_PACKAGE_NAME_LENGTH {
        return Err(StorageError::Validation(format!(
            "package name too long: {} characters (max: {})",
            name.len(),
            MAX_PACKAGE_NAME_LENGTH
        )));
    }

    if name.chars().any(|c| c.is_control()) {
        warn!(package = %name, "Control character detected in package name");
        return Err(StorageError::Validation(
            "package name contains control characters".to_string(),
        ));
    }

    if name.to_lowercase() != name {
        return Err(StorageError::Validation(format!(
            "package name must be lowercase: {name}"
        )));
    }

    let (scope, bare) = match name.strip_prefix('@') {
        Some(scoped) => match scoped.split_once('/') {
            Some((scope, bare)) if !scope.is_empty() => (Some(scope), bare),
            _ => {
                return Err(StorageError::Validation(format!(
                    "scoped package name must look like @scope/name: {name}"
                )))
            }
        },
        None => (None, name),
    };

    for part in scope.into_iter().chain(std::iter::once(bare)) {
        if part.is_empty() || part.starts_with('.') || part.starts_with('_') {
            return Err(StorageError::Validation(format!(
                "package name segments cannot be empty or start with . or _: {name}"
            )));
        }
        if part == "node_modules" || part == "favicon.ico" {
            return Err(StorageError::Validation(format!(
                "package name is reserved: {name}"
            )));
        }
        if part
            .chars()
            .any(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')))
        {
            warn!(package = %name, "URL-unsafe characters in package name");
            return Err(StorageError::Validation(format!(
                "package name contains invalid characters: {name}"
            )));
        }
    }

    Ok(())
}

/// Validate a version string used as a manifest key.
pub fn validate_version(version: &str) -> StorageResult<()> {
    if version.is_empty() || version.len() > MAX_VERSION_LENGTH {
        return Err(StorageError::Validation(format!(
            "version must be 1..={MAX_VERSION_LENGTH} characters: {version:?}"
        )));
    }
    if version
        .chars()
        .any(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '\\'))
    {
        return Err(StorageError::Validation(format!(
            "version contains invalid characters: {version:?}"
        )));
    }
    Ok(())
}

/// Validates a tarball filename to prevent path traversal.
///
/// Rejects empty names, `..`, path separators, null bytes, control
/// characters, drive letters and names longer than 255 characters.
pub fn validate_filename(filename: &str) -> StorageResult<()> {
    if filename.is_empty() {
        return Err(StorageError::Validation(
            "filename cannot be empty".to_string(),
        ));
    }

    if filename.len() > MAX_FILENAME_LENGTH {
        warn!(filename = %filename, length = %filename.len(), "Filename too long");
        return Err(StorageError::Validation(format!(
            "filename too long: {} characters (max: {})",
            filename.len(),
            MAX_FILENAME_LENGTH
        )));
    }

    if filename.chars().any(|c| c.is_control()) {
        warn!(filename = %filename, "Control character detected in filename");
        return Err(StorageError::Validation(
            "filename contains control characters".to_string(),
        ));
    }

    if filename.contains("..") {
        warn!(filename = %filename, "Path traversal attempt detected (..)");
        return Err(StorageError::Validation(
            "filename contains parent directory reference (..)".to_string(),
        ));
    }

    if filename.contains('/') || filename.contains('\\') {
        warn!(filename = %filename, "Path separator detected in filename");
        return Err(StorageError::Validation(
            "filename cannot contain path separators".to_string(),
        ));
    }

    if filename.len() >= 2 && filename.as_bytes()[1] == b':' {
        return Err(StorageError::Validation(
            "filename cannot contain drive letter".to_string(),
        ));
    }

    // Reserved for the manifest and staging files of the package directory.
    if filename == crate::backend::MANIFEST_FILE || filename.starts_with(".tmp") {
        return Err(StorageError::Validation(format!(
            "filename is reserved: {filename}"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_package_names() {
        for name in ["lodash", "@babel/core", "left-pad", "a.b_c~d", "@my-org/pkg.js"] {
            assert!(validate_package_name(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_invalid_package_names() {
        for name in [
            "",
            "Uppercase",
            ".hidden",
            "_private",
            "@scope",
            "@/name",
            "@scope/",
            "with space",
            "../etc/passwd",
            "a/b",
            "node_modules",
        ] {
            assert!(validate_package_name(name).is_err(), "{name:?} should be invalid");
        }
        assert!(validate_package_name(&"a".repeat(215)).is_err());
    }

    #[test]
    fn test_validate_version() {
        assert!(validate_version("1.0.0").is_ok());
        assert!(validate_version("2.0.0-beta.1+build.5").is_ok());
        assert!(validate_version("").is_err());
        assert!(validate_version("1.0 .0").is_err());
        assert!(validate_version("../1.0.0").is_err());
    }

    #[test]
    fn test_validate_filename() {
        assert!(validate_filename("foo-1.0.0.tgz").is_ok());
        assert!(validate_filename("../etc/passwd").is_err());
        assert!(validate_filename("/absolute").is_err());
        assert!(validate_filename("dir\\file.tgz").is_err());
        assert!(validate_filename("file\0name").is_err());
        assert!(validate_filename("C:file.tgz").is_err());
        assert!(validate_filename("package.json").is_err());
        assert!(validate_filename(".tmp.1234").is_err());
        assert!(validate_filename(&"a".repeat(256)).is_err());
    }
}
