//! Configuration loading and validation for fileserve.
//!
//! Configuration is read from a TOML file:
//!
//! ```toml
//! [listener]
//! address = "0.0.0.0:8080"
//!
//! [static_files]
//! root = "/var/www"
//! index_names = ["index.html"]
//! compress = true
//! compress_brotli = true
//! accept_byte_range = true
//! ```
//!
//! Options that only make sense in code (path rewriting, not-found handlers,
//! alternative filesystems) live on the server builder, not here.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, trace};

mod static_files;
pub mod validate;

pub use static_files::{CompressedSuffixes, StaticFileConfig, DEFAULT_CACHE_DURATION_SECS};
pub use validate::{
    lint_config, validate_config, ErrorCategory, ValidationError, ValidationResult,
    ValidationWarning,
};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Top-level Configuration
// ============================================================================

/// Complete server configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listening socket
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Static file handler settings
    #[serde(default)]
    pub static_files: StaticFileConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Socket address to bind, e.g. `0.0.0.0:8080`
    #[serde(default = "default_address")]
    pub address: String,
}

fn default_address() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading configuration file");

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }

    /// Validate the configuration, returning the first hard error
    pub fn validate(&self) -> Result<(), ConfigError> {
        let result = validate_config(self);
        match result.errors.first() {
            Some(error) => Err(ConfigError::Invalid(error.to_string())),
            None => Ok(()),
        }
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(content)?;
        trace!(
            address = %config.listener.address,
            root = %config.static_files.root.display(),
            compress = config.static_files.compress,
            "Parsed configuration"
        );
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_minimal() {
        let config: Config = "".parse().unwrap();
        assert_eq!(config.listener.address, "127.0.0.1:8080");
        assert_eq!(config.static_files.root, PathBuf::from("."));
    }

    #[test]
    fn test_parse_full() {
        let config: Config = r#"
            [listener]
            address = "0.0.0.0:9000"

            [static_files]
            root = "/srv/www"
            compress_root = "/var/cache/www"
            index_names = ["index.html", "index.htm"]
            cache_duration_secs = 30
            compress = true
            compress_brotli = true
            compress_zstd = true
            accept_byte_range = true
            generate_index_pages = true
            strip_slashes = 1

            [static_files.compressed_suffixes]
            gzip = ".gz"
        "#
        .parse()
        .unwrap();

        let sf = &config.static_files;
        assert_eq!(config.listener.address, "0.0.0.0:9000");
        assert_eq!(sf.root, PathBuf::from("/srv/www"));
        assert_eq!(sf.effective_compress_root(), &PathBuf::from("/var/cache/www"));
        assert_eq!(sf.index_names, vec!["index.html", "index.htm"]);
        assert_eq!(sf.cache_duration_secs, 30);
        assert!(sf.compress && sf.compress_brotli && sf.compress_zstd && sf.compress_gzip);
        assert!(sf.accept_byte_range);
        assert!(sf.generate_index_pages);
        assert_eq!(sf.strip_slashes, 1);
        assert_eq!(sf.compressed_suffixes.gzip, ".gz");
        assert_eq!(sf.compressed_suffixes.br, ".fasthttp.br");
    }

    #[test]
    fn test_parse_error() {
        let result: Result<Config, _> = "[static_files]\ncompress = \"yes\"".parse();
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fileserve.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[static_files]\nroot = {:?}", dir.path().display().to_string()).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.static_files.root, dir.path());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_missing_file() {
        let result = Config::from_file("/nonexistent/fileserve.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
