//! Filesystem path validation
//!
//! Checks the served root and the compression root before the server starts.

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;

/// Validate root directories and index names
pub fn validate_paths(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let sf = &config.static_files;

    if !sf.root.is_dir() {
        result.add_error(ValidationError::new(
            ErrorCategory::Path,
            format!("Root directory not found: {:?}", sf.root),
        ));
    }

    if let Some(ref compress_root) = sf.compress_root {
        if !sf.compress {
            result.add_warning(ValidationWarning::new(format!(
                "compress_root {:?} is set but compression is disabled",
                compress_root
            )));
        } else if compress_root.exists() && !compress_root.is_dir() {
            result.add_error(ValidationError::new(
                ErrorCategory::Path,
                format!("Compression root is not a directory: {:?}", compress_root),
            ));
        }
    }

    for name in &sf.index_names {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            result.add_error(ValidationError::new(
                ErrorCategory::Path,
                format!("Invalid index name '{}': must be a plain file name", name),
            ));
        }
    }

    for suffix in sf.compressed_suffixes.iter() {
        if suffix.contains('/') {
            result.add_error(ValidationError::new(
                ErrorCategory::Compression,
                format!("Compressed suffix '{}' must not contain '/'", suffix),
            ));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_root() {
        let mut config = Config::default();
        config.static_files.root = "/nonexistent/www".into();

        let result = validate_paths(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("Root directory not found")));
    }

    #[test]
    fn test_bad_index_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.static_files.root = dir.path().to_path_buf();
        config.static_files.index_names = vec!["index.html".into(), "sub/index.html".into()];

        let result = validate_paths(&config);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].message.contains("sub/index.html"));
    }

    #[test]
    fn test_compress_root_is_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let mut config = Config::default();
        config.static_files.root = dir.path().to_path_buf();
        config.static_files.compress = true;
        config.static_files.compress_root = Some(file);

        let result = validate_paths(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.message.contains("not a directory")));
    }
}
