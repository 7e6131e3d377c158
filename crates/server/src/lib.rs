//! fileserve library
//!
//! Static file serving over HTTP with:
//!
//! - **Entry cache**: open files are shared between concurrent requests and
//!   expire after a period without readers
//! - **Transparent compression**: brotli, zstd and gzip variants are
//!   persisted next to their sources (or under a separate root) and rebuilt
//!   when the source changes
//! - **Byte ranges** and `If-Modified-Since` handling
//! - **Directory handling**: index files or generated HTML listings
//! - **Virtual filesystems** through the [`FileSystem`] trait
//!
//! # Example
//!
//! ```ignore
//! use fileserve::StaticFileServer;
//! use fileserve_config::StaticFileConfig;
//!
//! let mut config = StaticFileConfig::new("/var/www");
//! config.compress = true;
//! config.index_names = vec!["index.html".to_string()];
//!
//! let server = StaticFileServer::new(config);
//! let response = server.serve(&request).await;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod error;
pub mod static_files;

// ============================================================================
// Public API Re-exports
// ============================================================================

pub use error::ServeError;

pub use static_files::body::FileBody;
pub use static_files::cache::{CacheManager, CacheStats, InMemoryCache, NoopCache};
pub use static_files::compression::{ContentEncoding, EnabledCodecs};
pub use static_files::entry::{file_last_modified, FileEntry};
pub use static_files::path::{
    path_prefix_stripper, path_slashes_stripper, vhost_path_rewriter, PathRewrite, RequestHead,
};
pub use static_files::pipeline::LockTable;
pub use static_files::range::{parse_byte_range, RangeError, RangeSpec};
pub use static_files::reader::EntryReader;
pub use static_files::vfs::{DirEntry, FileMeta, FileSystem, MemoryFs, OsFs};
pub use static_files::{
    fs_handler, serve_file, serve_file_uncompressed, NotFoundHandler, StaticFileServer,
    StaticFileServerBuilder,
};
