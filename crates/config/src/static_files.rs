//! Static file serving configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Default expiration for inactive cached file entries.
pub const DEFAULT_CACHE_DURATION_SECS: u64 = 10;

// ============================================================================
// Static File Configuration
// ============================================================================

/// Settings for the static file handler.
///
/// Every flag defaults to the conservative choice: no transparent
/// compression, no byte ranges and no generated index pages. Gzip is the
/// fallback codec whenever `compress` is on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticFileConfig {
    /// Directory to serve files from. Relative paths are resolved against
    /// the working directory when the server starts.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Directory where compressed siblings are written. Defaults to `root`,
    /// which requires write access to the served tree.
    #[serde(default)]
    pub compress_root: Option<PathBuf>,

    /// Index file names tried, in order, when a directory is requested
    #[serde(default)]
    pub index_names: Vec<String>,

    /// File name suffixes of persisted compressed artifacts
    #[serde(default)]
    pub compressed_suffixes: CompressedSuffixes,

    /// Seconds an inactive entry stays in the cache (0 means the default)
    #[serde(default = "default_cache_duration_secs")]
    pub cache_duration_secs: u64,

    /// Transparently compress responses
    #[serde(default)]
    pub compress: bool,

    /// Offer gzip when compression is on
    #[serde(default = "default_true")]
    pub compress_gzip: bool,

    /// Offer brotli when compression is on (preferred over zstd and gzip)
    #[serde(default)]
    pub compress_brotli: bool,

    /// Offer zstd when compression is on (preferred over gzip)
    #[serde(default)]
    pub compress_zstd: bool,

    /// Honor `Range: bytes=...` requests
    #[serde(default)]
    pub accept_byte_range: bool,

    /// Render an HTML listing for directories without an index file
    #[serde(default)]
    pub generate_index_pages: bool,

    /// Disable the file entry cache entirely
    #[serde(default)]
    pub skip_cache: bool,

    /// Number of leading path segments stripped before lookup
    #[serde(default)]
    pub strip_slashes: usize,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_cache_duration_secs() -> u64 {
    DEFAULT_CACHE_DURATION_SECS
}

fn default_true() -> bool {
    true
}

impl Default for StaticFileConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            compress_root: None,
            index_names: Vec::new(),
            compressed_suffixes: CompressedSuffixes::default(),
            cache_duration_secs: DEFAULT_CACHE_DURATION_SECS,
            compress: false,
            compress_gzip: true,
            compress_brotli: false,
            compress_zstd: false,
            accept_byte_range: false,
            generate_index_pages: false,
            skip_cache: false,
            strip_slashes: 0,
        }
    }
}

impl StaticFileConfig {
    /// Create a configuration serving `root` with default settings
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Effective cache duration
    pub fn cache_duration(&self) -> Duration {
        if self.cache_duration_secs == 0 {
            Duration::from_secs(DEFAULT_CACHE_DURATION_SECS)
        } else {
            Duration::from_secs(self.cache_duration_secs)
        }
    }

    /// Effective compression output root
    pub fn effective_compress_root(&self) -> &PathBuf {
        self.compress_root.as_ref().unwrap_or(&self.root)
    }
}

// ============================================================================
// Compressed File Suffixes
// ============================================================================

/// Suffixes appended to a file name when storing its compressed variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressedSuffixes {
    #[serde(default = "default_gzip_suffix")]
    pub gzip: String,
    #[serde(default = "default_brotli_suffix")]
    pub br: String,
    #[serde(default = "default_zstd_suffix")]
    pub zstd: String,
}

fn default_gzip_suffix() -> String {
    ".fasthttp.gz".to_string()
}

fn default_brotli_suffix() -> String {
    ".fasthttp.br".to_string()
}

fn default_zstd_suffix() -> String {
    ".fasthttp.zst".to_string()
}

impl Default for CompressedSuffixes {
    fn default() -> Self {
        Self {
            gzip: default_gzip_suffix(),
            br: default_brotli_suffix(),
            zstd: default_zstd_suffix(),
        }
    }
}

impl CompressedSuffixes {
    /// Whether every suffix is non-empty and distinct from the others
    pub fn is_valid(&self) -> bool {
        !self.gzip.is_empty()
            && !self.br.is_empty()
            && !self.zstd.is_empty()
            && self.gzip != self.br
            && self.gzip != self.zstd
            && self.br != self.zstd
    }

    /// Return these suffixes, or the defaults if any is empty or duplicated
    pub fn normalized(&self) -> Self {
        if self.is_valid() {
            return self.clone();
        }
        warn!(
            gzip = %self.gzip,
            br = %self.br,
            zstd = %self.zstd,
            "Invalid compressed file suffixes, falling back to defaults"
        );
        Self::default()
    }

    /// Iterate over all configured suffixes
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        [self.gzip.as_str(), self.br.as_str(), self.zstd.as_str()].into_iter()
    }
}
