//! Request path normalization, rewriting and mapping onto the served tree

use http::{header, HeaderMap, Method, Uri};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{trace, warn};

use crate::error::ServeError;

/// Host used by [`vhost_path_rewriter`] when the request has no usable host
pub const INVALID_HOST: &str = "invalid-host";

/// The parts of a request a rewriter or not-found handler may look at
#[derive(Debug, Clone, Copy)]
pub struct RequestHead<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    /// Normalized request path
    pub path: &'a str,
}

impl RequestHead<'_> {
    /// Host from the absolute URI, or else the `Host` header
    pub fn host(&self) -> Option<&str> {
        self.uri.host().or_else(|| {
            self.headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
        })
    }
}

/// Maps a request to the path used for cache lookup and file resolution
pub type PathRewrite = Arc<dyn Fn(&RequestHead<'_>) -> String + Send + Sync>;

// ============================================================================
// Normalization
// ============================================================================

/// Percent-decode a raw request path and collapse it into canonical form.
///
/// Repeated slashes collapse, `.` segments vanish and `..` segments pop the
/// previous segment without ever climbing above the root. A trailing slash
/// on the input survives.
pub fn normalize_request_path(raw: &str) -> Result<String, ServeError> {
    let decoded = urlencoding::decode_binary(raw.as_bytes());
    if let Some(pos) = decoded.iter().position(|&b| b == 0) {
        return Err(ServeError::NulByte(pos));
    }
    let decoded = String::from_utf8(decoded.into_owned()).map_err(|_| ServeError::InvalidUtf8)?;

    let mut segments: Vec<&str> = Vec::new();
    for segment in decoded.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut normalized = String::with_capacity(decoded.len() + 1);
    for segment in &segments {
        normalized.push('/');
        normalized.push_str(segment);
    }

    let trailing = decoded.ends_with('/')
        || decoded.ends_with("/.")
        || decoded.ends_with("/..")
        || decoded == "."
        || decoded == "..";
    if normalized.is_empty() || trailing {
        normalized.push('/');
    }

    Ok(normalized)
}

fn find_traversal(path: &str) -> Option<usize> {
    if path == ".." || path.starts_with("../") {
        return Some(0);
    }
    if let Some(pos) = path.find("/../") {
        return Some(pos);
    }
    if path.ends_with("/..") {
        return Some(path.len() - 3);
    }
    None
}

// ============================================================================
// Rewriters
// ============================================================================

fn strip_leading_slashes(path: &str, slashes: usize) -> &str {
    let mut path = path;
    for _ in 0..slashes {
        if !path.starts_with('/') {
            break;
        }
        match path[1..].find('/') {
            Some(pos) => path = &path[pos + 1..],
            None => return "",
        }
    }
    path
}

/// Rewriter dropping the first `slashes` path segments.
///
/// `/foo/bar` becomes `/bar` with one slash and the empty path with two.
pub fn path_slashes_stripper(slashes: usize) -> PathRewrite {
    Arc::new(move |head: &RequestHead<'_>| strip_leading_slashes(head.path, slashes).to_string())
}

/// Rewriter dropping the first `prefix_len` bytes of the path.
///
/// Paths shorter than the prefix pass through unchanged.
pub fn path_prefix_stripper(prefix_len: usize) -> PathRewrite {
    Arc::new(move |head: &RequestHead<'_>| {
        let bytes = head.path.as_bytes();
        if bytes.len() < prefix_len {
            return head.path.to_string();
        }
        String::from_utf8_lossy(&bytes[prefix_len..]).into_owned()
    })
}

/// Rewriter serving each virtual host from its own subdirectory.
///
/// The path becomes `/<host>` followed by the path with `slashes` leading
/// segments stripped. Requests without a host, or with a `/` in it, map to
/// [`INVALID_HOST`].
pub fn vhost_path_rewriter(slashes: usize) -> PathRewrite {
    Arc::new(move |head: &RequestHead<'_>| {
        let host = match head.host() {
            Some(host) if !host.is_empty() && !host.contains('/') => host,
            _ => INVALID_HOST,
        };
        format!("/{}{}", host, strip_leading_slashes(head.path, slashes))
    })
}

// ============================================================================
// Path Resolver
// ============================================================================

/// Outcome of [`PathResolver::resolve`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    /// Normalized request path, before rewriting
    pub normalized: String,
    /// Path used as cache key and for file lookup
    pub path: String,
}

/// Turns request URIs into cache keys and backend paths
#[derive(Clone)]
pub struct PathResolver {
    root: PathBuf,
    compress_root: PathBuf,
    is_os: bool,
    rewrite: Option<PathRewrite>,
}

impl PathResolver {
    pub fn new(root: PathBuf, compress_root: PathBuf, is_os: bool) -> Self {
        Self {
            root,
            compress_root,
            is_os,
            rewrite: None,
        }
    }

    pub fn with_rewrite(mut self, rewrite: Option<PathRewrite>) -> Self {
        self.rewrite = rewrite;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn compress_root(&self) -> &Path {
        &self.compress_root
    }

    /// Normalize the request path and apply the rewriter, if any.
    ///
    /// Rewriter output is trusted only as far as it contains no NUL byte
    /// and no `..` segment.
    pub fn resolve(
        &self,
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
    ) -> Result<ResolvedPath, ServeError> {
        let normalized = normalize_request_path(uri.path())?;

        let Some(rewrite) = &self.rewrite else {
            return Ok(ResolvedPath {
                path: normalized.clone(),
                normalized,
            });
        };

        let head = RequestHead {
            method,
            uri,
            headers,
            path: &normalized,
        };
        let path = rewrite(&head);

        if let Some(pos) = path.find('\0') {
            warn!(path = %path.escape_debug(), "Rewritten path contains a nul byte");
            return Err(ServeError::NulByte(pos));
        }
        if let Some(pos) = find_traversal(&path) {
            warn!(path = %path, "Rewritten path escapes the root");
            return Err(ServeError::Traversal(pos));
        }

        trace!(from = %normalized, to = %path, "Rewrote request path");
        Ok(ResolvedPath { normalized, path })
    }

    /// Backend path for a lookup path without trailing slash
    pub fn to_file_path(&self, path: &str) -> PathBuf {
        let relative = path.trim_start_matches('/');
        if !self.is_os {
            return PathBuf::from(relative);
        }
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    /// Location of the compressed sibling of `file_path`, before the suffix
    /// is appended
    pub fn to_compressed_path(&self, file_path: &Path) -> PathBuf {
        if !self.is_os || self.root == self.compress_root {
            return file_path.to_path_buf();
        }
        match file_path.strip_prefix(&self.root) {
            Ok(relative) if relative.as_os_str().is_empty() => self.compress_root.clone(),
            Ok(relative) => self.compress_root.join(relative),
            Err(_) => file_path.to_path_buf(),
        }
    }
}

impl fmt::Debug for PathResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathResolver")
            .field("root", &self.root)
            .field("compress_root", &self.compress_root)
            .field("is_os", &self.is_os)
            .field("rewrite", &self.rewrite.is_some())
            .finish()
    }
}

/// Make a root absolute and drop trailing separators.
///
/// Falls back to the path as given when the working directory is
/// unavailable.
pub fn normalize_root(root: &Path) -> PathBuf {
    let absolute = if root.is_absolute() {
        root.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(root),
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Cannot resolve working directory");
                root.to_path_buf()
            }
        }
    };
    absolute.components().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rewrite_with(rewrite: &PathRewrite, uri: &str, host: Option<&str>) -> String {
        let uri: Uri = uri.parse().unwrap();
        let mut headers = HeaderMap::new();
        if let Some(host) = host {
            headers.insert(header::HOST, host.parse().unwrap());
        }
        let path = normalize_request_path(uri.path()).unwrap();
        let head = RequestHead {
            method: &Method::GET,
            uri: &uri,
            headers: &headers,
            path: &path,
        };
        rewrite(&head)
    }

    #[test]
    fn test_normalize_collapses_segments() {
        assert_eq!(normalize_request_path("/").unwrap(), "/");
        assert_eq!(normalize_request_path("").unwrap(), "/");
        assert_eq!(normalize_request_path("//a///b").unwrap(), "/a/b");
        assert_eq!(normalize_request_path("/a/./b/").unwrap(), "/a/b/");
        assert_eq!(normalize_request_path("/a/b/../c").unwrap(), "/a/c");
        assert_eq!(normalize_request_path("/../../etc/passwd").unwrap(), "/etc/passwd");
        assert_eq!(normalize_request_path("/a/..").unwrap(), "/");
        assert_eq!(normalize_request_path("/a/b/.").unwrap(), "/a/b/");
    }

    #[test]
    fn test_normalize_decodes_percent_escapes() {
        assert_eq!(normalize_request_path("/hello%20world.txt").unwrap(), "/hello world.txt");
        assert_eq!(normalize_request_path("/a/%2e%2e/b").unwrap(), "/b");
        assert_eq!(normalize_request_path("/caf%C3%A9").unwrap(), "/café");
    }

    #[test]
    fn test_normalize_rejects_nul_and_invalid_utf8() {
        assert!(matches!(
            normalize_request_path("/a%00b"),
            Err(ServeError::NulByte(2))
        ));
        assert!(matches!(
            normalize_request_path("/%ff%fe"),
            Err(ServeError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_slashes_stripper() {
        let one = path_slashes_stripper(1);
        let two = path_slashes_stripper(2);
        assert_eq!(rewrite_with(&one, "/foo/bar", None), "/bar");
        assert_eq!(rewrite_with(&two, "/foo/bar", None), "");
        assert_eq!(rewrite_with(&one, "/foo", None), "");
        assert_eq!(rewrite_with(&one, "/foo/bar/", None), "/bar/");
    }

    #[test]
    fn test_prefix_stripper() {
        let strip = path_prefix_stripper(4);
        assert_eq!(rewrite_with(&strip, "/foo/bar", None), "/bar");
        assert_eq!(rewrite_with(&strip, "/fo", None), "/fo");
    }

    #[test]
    fn test_vhost_rewriter() {
        let vhost = vhost_path_rewriter(0);
        assert_eq!(
            rewrite_with(&vhost, "/a/b.txt", Some("example.com")),
            "/example.com/a/b.txt"
        );
        assert_eq!(rewrite_with(&vhost, "/a", None), "/invalid-host/a");
        assert_eq!(
            rewrite_with(&vhost, "http://other.org/x", None),
            "/other.org/x"
        );

        let stripped = vhost_path_rewriter(1);
        assert_eq!(
            rewrite_with(&stripped, "/static/a.css", Some("example.com")),
            "/example.com/a.css"
        );
    }

    #[test]
    fn test_resolve_rejects_unsafe_rewrites() {
        let uri: Uri = "/x".parse().unwrap();
        let headers = HeaderMap::new();

        let escaping: PathRewrite = Arc::new(|_: &RequestHead<'_>| "/a/../../secret".to_string());
        let resolver = PathResolver::new(PathBuf::from("/srv"), PathBuf::from("/srv"), true)
            .with_rewrite(Some(escaping));
        assert!(matches!(
            resolver.resolve(&Method::GET, &uri, &headers),
            Err(ServeError::Traversal(2))
        ));

        let trailing: PathRewrite = Arc::new(|_: &RequestHead<'_>| "/a/..".to_string());
        let resolver = resolver.with_rewrite(Some(trailing));
        assert!(matches!(
            resolver.resolve(&Method::GET, &uri, &headers),
            Err(ServeError::Traversal(2))
        ));

        let nul: PathRewrite = Arc::new(|_: &RequestHead<'_>| "/a\0b".to_string());
        let resolver = resolver.with_rewrite(Some(nul));
        assert!(matches!(
            resolver.resolve(&Method::GET, &uri, &headers),
            Err(ServeError::NulByte(2))
        ));
    }

    #[test]
    fn test_file_and_compressed_paths() {
        let resolver =
            PathResolver::new(PathBuf::from("/srv/www"), PathBuf::from("/var/cache/www"), true);
        assert_eq!(resolver.to_file_path(""), PathBuf::from("/srv/www"));
        assert_eq!(resolver.to_file_path("/a/b.txt"), PathBuf::from("/srv/www/a/b.txt"));
        assert_eq!(
            resolver.to_compressed_path(Path::new("/srv/www/a/b.txt")),
            PathBuf::from("/var/cache/www/a/b.txt")
        );

        let virtual_fs = PathResolver::new(PathBuf::from("/ignored"), PathBuf::from("/ignored"), false);
        assert_eq!(virtual_fs.to_file_path("/a/b.txt"), PathBuf::from("a/b.txt"));
        assert_eq!(virtual_fs.to_file_path(""), PathBuf::from(""));
        assert_eq!(
            virtual_fs.to_compressed_path(Path::new("a/b.txt")),
            PathBuf::from("a/b.txt")
        );
    }

    #[test]
    fn test_normalize_root() {
        assert_eq!(normalize_root(Path::new("/srv/www/")), PathBuf::from("/srv/www"));
        assert!(normalize_root(Path::new("public")).is_absolute());
    }

    proptest! {
        #[test]
        fn normalized_paths_never_climb(segments in proptest::collection::vec("(\\.\\.|\\.|[a-z]{1,4})", 0..12)) {
            let raw = format!("/{}", segments.join("/"));
            let normalized = normalize_request_path(&raw).unwrap();
            prop_assert!(normalized.starts_with('/'));
            prop_assert!(!normalized.contains("//"));
            prop_assert!(find_traversal(&normalized).is_none());
            prop_assert!(!normalized.split('/').any(|s| s == "." || s == ".."));
        }
    }
}
