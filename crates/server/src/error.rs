//! Error types for static file serving

use http::StatusCode;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::static_files::range::RangeError;

/// Errors produced while resolving, opening or streaming a file
#[derive(Error, Debug)]
pub enum ServeError {
    #[error("cannot serve path with nul byte at position {0}")]
    NulByte(usize),

    #[error("request path is not valid UTF-8 after percent-decoding")]
    InvalidUtf8,

    #[error("rewritten path contains '..' at position {0}")]
    Traversal(usize),

    #[error("directory index required")]
    DirIndexRequired,

    #[error("no permission to create compressed file {0:?}")]
    NoCreatePermission(PathBuf),

    #[error("cannot access directory without index page: {0:?}")]
    IndexForbidden(PathBuf),

    #[error("directory with unexpected compressed suffix found: {0:?}")]
    UnexpectedDirectory(PathBuf),

    #[error("file too big to serve from memory: {0} bytes")]
    TooLarge(u64),

    #[error("entry for {0} was released while readers were outstanding")]
    EntryReleased(String),

    #[error("cannot open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot compress {path:?}: {source}")]
    Compress {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot seek in {path}: {source}")]
    Seek {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ServeError {
    pub(crate) fn open(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ServeError::Open {
            path: path.into(),
            source,
        }
    }

    /// HTTP status this error maps to when it reaches the client
    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::NulByte(_) | ServeError::InvalidUtf8 => StatusCode::BAD_REQUEST,
            ServeError::IndexForbidden(_) => StatusCode::FORBIDDEN,
            ServeError::Open { .. } | ServeError::UnexpectedDirectory(_) => StatusCode::NOT_FOUND,
            ServeError::Range(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short message sent as the response body
    pub fn public_message(&self) -> &'static str {
        match self.status() {
            StatusCode::BAD_REQUEST => "Bad Request",
            StatusCode::FORBIDDEN => "Directory index is forbidden",
            StatusCode::NOT_FOUND => "Cannot open requested path",
            StatusCode::RANGE_NOT_SATISFIABLE => "Range Not Satisfiable",
            _ => "Internal Server Error",
        }
    }

    /// Whether the underlying cause is a missing file
    pub fn is_not_found(&self) -> bool {
        match self {
            ServeError::Open { source, .. } | ServeError::Io(source) => {
                source.kind() == io::ErrorKind::NotFound
            }
            _ => false,
        }
    }

    /// Whether this is a client-side fault
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error()
    }
}
