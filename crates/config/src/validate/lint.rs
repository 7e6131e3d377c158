//! Configuration linting
//!
//! Flags combinations of settings that are legal but likely mistakes.

use super::{ValidationResult, ValidationWarning};
use crate::Config;

/// Lint configuration for likely mistakes
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let sf = &config.static_files;

    if sf.compress && !sf.compress_gzip && !sf.compress_brotli && !sf.compress_zstd {
        result.add_warning(ValidationWarning::new(
            "Compression is enabled but every codec is disabled".to_string(),
        ));
    }

    if !sf.compress && (sf.compress_brotli || sf.compress_zstd) {
        result.add_warning(ValidationWarning::new(
            "Brotli or zstd is enabled but compress = false, no codec will be used".to_string(),
        ));
    }

    if sf.compress && sf.compress_root.is_none() {
        result.add_warning(ValidationWarning::new(format!(
            "Compressed files will be written next to the originals under {:?}",
            sf.root
        )));
    }

    if !sf.compressed_suffixes.is_valid() {
        result.add_warning(ValidationWarning::new(
            "Compressed suffixes are empty or duplicated, defaults will be used".to_string(),
        ));
    }

    if sf.index_names.is_empty() && !sf.generate_index_pages {
        result.add_warning(ValidationWarning::new(
            "No index names and no generated index pages, directory requests return 403"
                .to_string(),
        ));
    }

    if sf.skip_cache {
        result.add_warning(ValidationWarning::new(
            "File cache is disabled, every request opens the file".to_string(),
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lint_all_codecs_disabled() {
        let mut config = Config::default();
        config.static_files.compress = true;
        config.static_files.compress_gzip = false;

        let result = lint_config(&config);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.message.contains("every codec is disabled")));
    }

    #[test]
    fn test_lint_directory_forbidden() {
        let config = Config::default();

        let result = lint_config(&config);
        assert!(result.warnings.iter().any(|w| w.message.contains("403")));
    }

    #[test]
    fn test_lint_clean_config() {
        let mut config = Config::default();
        config.static_files.index_names = vec!["index.html".to_string()];

        let result = lint_config(&config);
        assert!(result.warnings.is_empty());
    }
}
