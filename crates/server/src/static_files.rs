//! Static file serving
//!
//! [`StaticFileServer`] ties the pieces together: it resolves the request
//! path, negotiates a content encoding, looks the file up in the entry
//! cache (opening and possibly compressing it on a miss) and answers with
//! the full file, a byte range, a `304 Not Modified` or an error page.
//!
//! Directory requests without a trailing slash are redirected. With a
//! slash they are served from the first existing index file, or from a
//! generated listing when that is enabled.

pub mod body;
pub mod cache;
pub mod compression;
pub mod entry;
pub mod listing;
pub mod path;
pub mod pipeline;
pub mod range;
pub mod reader;
pub mod sniff;
pub mod vfs;

use fileserve_config::{CompressedSuffixes, StaticFileConfig};
use http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode, Uri};
use once_cell::sync::Lazy;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::ServeError;
use body::FileBody;
use cache::{CacheManager, CacheStats, InMemoryCache, NoopCache};
use compression::{negotiate_encoding, ContentEncoding, EnabledCodecs};
use entry::{truncate_to_secs, FileEntry};
use listing::{render_directory_index, LISTING_CONTENT_TYPE};
use path::{normalize_root, path_slashes_stripper, PathResolver, PathRewrite, RequestHead};
use pipeline::{compress_in_memory, CompressionPipeline, LockTable};
use range::{parse_byte_range, RangeError};
use reader::EntryReader;
use vfs::{FileSystem, OsFs};

/// Produces the response for files that cannot be found
pub type NotFoundHandler = Arc<dyn Fn(&RequestHead<'_>) -> Response<FileBody> + Send + Sync>;

const PLAIN_TEXT: &str = "text/plain; charset=utf-8";

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`StaticFileServer`]
pub struct StaticFileServerBuilder {
    config: StaticFileConfig,
    path_rewrite: Option<PathRewrite>,
    not_found: Option<NotFoundHandler>,
    clean_stop: Option<CancellationToken>,
    filesystem: Option<Arc<dyn FileSystem>>,
    lock_table: Option<Arc<LockTable>>,
}

impl StaticFileServerBuilder {
    pub fn new(config: StaticFileConfig) -> Self {
        Self {
            config,
            path_rewrite: None,
            not_found: None,
            clean_stop: None,
            filesystem: None,
            lock_table: None,
        }
    }

    /// Rewrite request paths before lookup. Overrides `strip_slashes`.
    pub fn path_rewrite(mut self, rewrite: PathRewrite) -> Self {
        self.path_rewrite = Some(rewrite);
        self
    }

    /// Custom response for missing files
    pub fn not_found_handler(mut self, handler: NotFoundHandler) -> Self {
        self.not_found = Some(handler);
        self
    }

    /// Stop the cache sweeper when `token` is cancelled
    pub fn clean_stop(mut self, token: CancellationToken) -> Self {
        self.clean_stop = Some(token);
        self
    }

    /// Serve from `fs` instead of the OS filesystem
    pub fn filesystem(mut self, fs: Arc<dyn FileSystem>) -> Self {
        self.filesystem = Some(fs);
        self
    }

    /// Share compression locks with other servers writing to the same tree
    pub fn lock_table(mut self, locks: Arc<LockTable>) -> Self {
        self.lock_table = Some(locks);
        self
    }

    pub fn build(self) -> StaticFileServer {
        let config = self.config;
        let fs = self.filesystem.unwrap_or_else(|| Arc::new(OsFs));

        let (root, compress_root) = if fs.is_os() {
            (
                normalize_root(&config.root),
                normalize_root(config.effective_compress_root()),
            )
        } else {
            (PathBuf::new(), PathBuf::new())
        };

        let rewrite = self.path_rewrite.or_else(|| {
            (config.strip_slashes > 0).then(|| path_slashes_stripper(config.strip_slashes))
        });
        let resolver = PathResolver::new(root, compress_root, fs.is_os()).with_rewrite(rewrite);

        let suffixes = config.compressed_suffixes.normalized();
        let pipeline = CompressionPipeline::new(
            Arc::clone(&fs),
            resolver.clone(),
            suffixes.clone(),
            self.lock_table.unwrap_or_default(),
        );

        let mut sweeper = None;
        let cache: Arc<dyn CacheManager> = if config.skip_cache {
            Arc::new(NoopCache::new())
        } else {
            let cache = Arc::new(InMemoryCache::new(config.cache_duration()));
            sweeper = cache.spawn_sweeper(self.clean_stop);
            cache as Arc<dyn CacheManager>
        };

        let codecs = EnabledCodecs {
            brotli: config.compress_brotli,
            zstd: config.compress_zstd,
            gzip: config.compress_gzip,
        };

        info!(
            root = %resolver.root().display(),
            compress = config.compress,
            byte_range = config.accept_byte_range,
            index_pages = config.generate_index_pages,
            cache = if config.skip_cache { "disabled" } else { "memory" },
            "Static file server configured"
        );

        StaticFileServer {
            config,
            resolver,
            pipeline,
            cache,
            fs,
            not_found: self.not_found,
            codecs,
            suffixes,
            sweeper,
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Serves files from a root directory
pub struct StaticFileServer {
    config: StaticFileConfig,
    resolver: PathResolver,
    pipeline: CompressionPipeline,
    cache: Arc<dyn CacheManager>,
    fs: Arc<dyn FileSystem>,
    not_found: Option<NotFoundHandler>,
    codecs: EnabledCodecs,
    suffixes: CompressedSuffixes,
    sweeper: Option<JoinHandle<()>>,
}

impl StaticFileServer {
    pub fn builder(config: StaticFileConfig) -> StaticFileServerBuilder {
        StaticFileServerBuilder::new(config)
    }

    pub fn new(config: StaticFileConfig) -> Self {
        Self::builder(config).build()
    }

    /// Server serving `root` with index.html pages, generated listings and
    /// byte ranges, stripping `strip_slashes` leading path segments
    pub fn fs_handler(root: impl Into<PathBuf>, strip_slashes: usize) -> Self {
        let config = StaticFileConfig {
            index_names: vec!["index.html".to_string()],
            generate_index_pages: true,
            accept_byte_range: true,
            strip_slashes,
            ..StaticFileConfig::new(root)
        };
        Self::new(config)
    }

    /// Server rooted at `/` with compression on every codec, byte ranges
    /// and generated listings. Backs [`serve_file`].
    pub fn root_fs() -> Self {
        let config = StaticFileConfig {
            compress: true,
            compress_gzip: true,
            compress_brotli: true,
            compress_zstd: true,
            accept_byte_range: true,
            generate_index_pages: true,
            ..StaticFileConfig::new("/")
        };
        Self::new(config)
    }

    pub fn config(&self) -> &StaticFileConfig {
        &self.config
    }

    /// Absolute root for the OS filesystem, empty for virtual ones
    pub fn root(&self) -> &Path {
        self.resolver.root()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn lock_table(&self) -> &Arc<LockTable> {
        self.pipeline.locks()
    }

    /// Serve a request
    pub async fn serve<B>(&self, req: &Request<B>) -> Response<FileBody> {
        self.serve_with_headers(req, HeaderMap::new()).await
    }

    /// Serve a request on top of caller-supplied response headers.
    ///
    /// A `Content-Type` already present in `headers` wins over the
    /// detected one.
    pub async fn serve_with_headers<B>(
        &self,
        req: &Request<B>,
        mut headers: HeaderMap,
    ) -> Response<FileBody> {
        let resolved = match self.resolver.resolve(req.method(), req.uri(), req.headers()) {
            Ok(resolved) => resolved,
            Err(e) => return self.fault(&e, req.uri().path()),
        };
        let head = RequestHead {
            method: req.method(),
            uri: req.uri(),
            headers: req.headers(),
            path: &resolved.normalized,
        };
        let path = resolved.path.as_str();

        let range_header = req.headers().get(header::RANGE);
        let encoding = if self.config.compress && range_header.is_none() {
            negotiate_encoding(req.headers(), self.codecs)
        } else {
            ContentEncoding::Identity
        };

        let entry = match self.cache.get(encoding, path) {
            Some(entry) => {
                debug!(path = %path, encoding = encoding.as_str(), "Cache hit");
                entry
            }
            None => {
                debug!(path = %path, encoding = encoding.as_str(), "Cache miss");
                let lookup = path.strip_suffix('/').unwrap_or(path);
                let file_path = self.resolver.to_file_path(lookup);
                let has_trailing_slash = path.ends_with('/');
                match self
                    .open_entry(&head, &file_path, encoding, has_trailing_slash)
                    .await
                {
                    Ok(candidate) => self.cache.put(encoding, path, candidate),
                    Err(response) => return response,
                }
            }
        };

        if !is_modified_since(req.headers(), entry.last_modified()) {
            self.cache.release_reader(&entry);
            debug!(path = %path, "Not modified");
            headers.insert(header::LAST_MODIFIED, last_modified_value(&entry));
            let mut response = Response::new(FileBody::empty());
            *response.status_mut() = StatusCode::NOT_MODIFIED;
            *response.headers_mut() = headers;
            return response;
        }

        let mut reader = match EntryReader::open(Arc::clone(&entry), Arc::clone(&self.cache)).await
        {
            Ok(reader) => reader,
            Err(e) => {
                error!(path = %path, error = %e, "Cannot open file reader");
                return plain_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal Server Error",
                );
            }
        };

        if entry.is_compressed() {
            headers.insert(
                header::CONTENT_ENCODING,
                HeaderValue::from_static(entry.encoding().as_str()),
            );
            headers.append(header::VARY, HeaderValue::from_static("Accept-Encoding"));
        }

        let total = entry.content_length();
        let mut content_length = total;
        let mut status = StatusCode::OK;

        if self.config.accept_byte_range {
            headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        }
        if let Some(value) = range_header.filter(|_| self.config.accept_byte_range) {
            let parsed = value
                .to_str()
                .map_err(|_| RangeError::Units(String::from_utf8_lossy(value.as_bytes()).into_owned()))
                .and_then(|value| parse_byte_range(value, total));

            match parsed {
                Ok(range) => {
                    if let Err(e) = reader.set_range(range.start, range.end).await {
                        error!(path = %path, error = %e, "Cannot seek to requested range");
                        if let Err(e) = reader.close() {
                            debug!(path = %path, error = %e, "Failed to close reader");
                        }
                        return plain_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "Internal Server Error",
                        );
                    }
                    if let Ok(value) = HeaderValue::from_str(&range.content_range(total)) {
                        headers.insert(header::CONTENT_RANGE, value);
                    }
                    content_length = range.content_length();
                    status = StatusCode::PARTIAL_CONTENT;
                }
                Err(e) => {
                    debug!(path = %path, error = %e, "Unsatisfiable byte range");
                    if let Err(e) = reader.close() {
                        debug!(path = %path, error = %e, "Failed to close reader");
                    }
                    return range_not_satisfiable(total);
                }
            }
        }

        headers.insert(header::LAST_MODIFIED, last_modified_value(&entry));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(content_length));
        if !headers.contains_key(header::CONTENT_TYPE) {
            if let Ok(value) = HeaderValue::from_str(entry.content_type()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
        }

        let body = if req.method() == Method::HEAD {
            if let Err(e) = reader.close() {
                error!(path = %path, error = %e, "Cannot close file reader");
                return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
            FileBody::empty()
        } else {
            FileBody::from_reader(reader, content_length)
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }

    /// Open a cache candidate, turning failures into the response to send
    async fn open_entry(
        &self,
        head: &RequestHead<'_>,
        file_path: &Path,
        encoding: ContentEncoding,
        has_trailing_slash: bool,
    ) -> Result<FileEntry, Response<FileBody>> {
        let mut result = self.pipeline.open(file_path, encoding).await;
        if let Err(ServeError::NoCreatePermission(target)) = &result {
            warn!(
                path = %file_path.display(),
                target = %target.display(),
                "Insufficient permissions for saving compressed file, serving uncompressed"
            );
            result = self.pipeline.open_plain(file_path, encoding).await;
        }

        match result {
            Ok(entry) => Ok(entry),
            Err(ServeError::DirIndexRequired) if !has_trailing_slash => Err(redirect_with_slash(head)),
            Err(ServeError::DirIndexRequired) => {
                self.open_index(head, file_path, encoding)
                    .await
                    .map_err(|e| {
                        debug!(path = %file_path.display(), error = %e, "Cannot serve directory");
                        plain_response(StatusCode::FORBIDDEN, "Directory index is forbidden")
                    })
            }
            Err(e) => {
                debug!(path = %file_path.display(), error = %e, "Cannot open requested path");
                Err(self.not_found_response(head))
            }
        }
    }

    /// Serve a directory from its first index file, or a generated listing
    async fn open_index(
        &self,
        head: &RequestHead<'_>,
        dir: &Path,
        encoding: ContentEncoding,
    ) -> Result<FileEntry, ServeError> {
        for name in &self.config.index_names {
            let index_path = dir.join(name);
            match self.pipeline.open(&index_path, encoding).await {
                Ok(entry) => return Ok(entry),
                Err(ServeError::NoCreatePermission(target)) => {
                    warn!(
                        path = %index_path.display(),
                        target = %target.display(),
                        "Insufficient permissions for saving compressed file, serving uncompressed"
                    );
                    return self.pipeline.open_plain(&index_path, encoding).await;
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }

        if !self.config.generate_index_pages {
            return Err(ServeError::IndexForbidden(dir.to_path_buf()));
        }

        let html = render_directory_index(self.fs.as_ref(), dir, head.path, &self.suffixes).await?;
        let (body, compressed) = if encoding.is_identity() {
            (html, false)
        } else {
            (compress_in_memory(html, encoding).await?, true)
        };

        trace!(dir = %dir.display(), size = body.len(), "Generated directory listing");
        Ok(FileEntry::in_memory(
            format!("{}/", dir.display()),
            body,
            LISTING_CONTENT_TYPE,
            SystemTime::now(),
            encoding,
            compressed,
        ))
    }

    fn not_found_response(&self, head: &RequestHead<'_>) -> Response<FileBody> {
        match &self.not_found {
            Some(handler) => handler(head),
            None => plain_response(StatusCode::NOT_FOUND, "Cannot open requested path"),
        }
    }

    fn fault(&self, err: &ServeError, path: &str) -> Response<FileBody> {
        if err.is_client_error() {
            debug!(path = %path, error = %err, "Rejected request path");
        } else {
            error!(path = %path, error = %err, "Failed to resolve request path");
        }
        plain_response(err.status(), err.public_message())
    }
}

impl fmt::Debug for StaticFileServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticFileServer")
            .field("resolver", &self.resolver)
            .field("cache", &self.cache)
            .field("codecs", &self.codecs)
            .field("not_found", &self.not_found.is_some())
            .finish()
    }
}

impl Drop for StaticFileServer {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// Shorthand for [`StaticFileServer::fs_handler`]
pub fn fs_handler(root: impl Into<PathBuf>, strip_slashes: usize) -> StaticFileServer {
    StaticFileServer::fs_handler(root, strip_slashes)
}

// ============================================================================
// Single file helpers
// ============================================================================

/// Shared server behind [`serve_file`]. Its cache sweeper runs on the
/// runtime of the first call.
static ROOT_FS: Lazy<StaticFileServer> = Lazy::new(StaticFileServer::root_fs);

/// Serve the file or directory at `path`, compressed when the client
/// accepts it.
///
/// Relative paths are resolved against the working directory. Never pass
/// user supplied paths: any file on the host can be served this way.
pub async fn serve_file<B>(req: &Request<B>, path: impl AsRef<Path>) -> Response<FileBody> {
    let path = path.as_ref();
    let uri = match file_request_uri(path) {
        Ok(uri) => uri,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Cannot resolve path to an absolute file path");
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };

    let mut forwarded = Request::new(());
    *forwarded.method_mut() = req.method().clone();
    *forwarded.uri_mut() = uri;
    *forwarded.headers_mut() = req.headers().clone();
    ROOT_FS.serve(&forwarded).await
}

/// [`serve_file`] without compression
pub async fn serve_file_uncompressed<B>(
    req: &Request<B>,
    path: impl AsRef<Path>,
) -> Response<FileBody> {
    let mut stripped = Request::new(());
    *stripped.method_mut() = req.method().clone();
    *stripped.uri_mut() = req.uri().clone();
    *stripped.headers_mut() = req.headers().clone();
    stripped.headers_mut().remove(header::ACCEPT_ENCODING);
    serve_file(&stripped, path).await
}

/// Percent-encoded absolute request URI for `path`, keeping a trailing slash
fn file_request_uri(path: &Path) -> io::Result<Uri> {
    let raw = path.to_string_lossy();
    let trailing_slash = raw.ends_with('/') || raw.ends_with('\\');
    let absolute = if raw.is_empty() {
        std::env::current_dir()?
    } else {
        std::path::absolute(path)?
    };

    let mut uri = String::with_capacity(raw.len() + 16);
    for component in absolute.components() {
        match component {
            Component::Normal(name) => {
                uri.push('/');
                uri.push_str(&urlencoding::encode(&name.to_string_lossy()));
            }
            Component::ParentDir => uri.push_str("/.."),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    if uri.is_empty() || (trailing_slash && !uri.ends_with('/')) {
        uri.push('/');
    }

    uri.parse::<Uri>()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

// ============================================================================
// Responses
// ============================================================================

fn plain_response(status: StatusCode, message: &'static str) -> Response<FileBody> {
    let mut response = Response::new(FileBody::full(message));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(PLAIN_TEXT));
    response
}

fn range_not_satisfiable(total: u64) -> Response<FileBody> {
    let mut response = plain_response(StatusCode::RANGE_NOT_SATISFIABLE, "Range Not Satisfiable");
    if let Ok(value) = HeaderValue::from_str(&format!("bytes */{}", total)) {
        response.headers_mut().insert(header::CONTENT_RANGE, value);
    }
    response
}

/// 302 to the request path with a trailing slash, keeping the query
fn redirect_with_slash(head: &RequestHead<'_>) -> Response<FileBody> {
    let mut location = format!("{}/", head.uri.path());
    if let Some(query) = head.uri.query() {
        location.push('?');
        location.push_str(query);
    }

    let mut response = Response::new(FileBody::empty());
    *response.status_mut() = StatusCode::FOUND;
    match HeaderValue::from_str(&location) {
        Ok(value) => {
            response.headers_mut().insert(header::LOCATION, value);
        }
        Err(e) => {
            error!(location = %location, error = %e, "Invalid redirect location");
            return plain_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    }
    trace!(location = %location, "Redirecting directory request");
    response
}

fn last_modified_value(entry: &FileEntry) -> HeaderValue {
    HeaderValue::from_str(entry.last_modified_str())
        .unwrap_or_else(|_| HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"))
}

/// Whether the file changed after the request's `If-Modified-Since` date.
/// Missing or unparseable dates count as modified.
fn is_modified_since(headers: &HeaderMap, last_modified: SystemTime) -> bool {
    let Some(since) = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
    else {
        return true;
    };
    since < truncate_to_secs(last_modified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_is_modified_since() {
        let modified = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_500);
        let mut headers = HeaderMap::new();
        assert!(is_modified_since(&headers, modified));

        let same_second = httpdate::fmt_http_date(SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        headers.insert(header::IF_MODIFIED_SINCE, same_second.parse().unwrap());
        assert!(!is_modified_since(&headers, modified));

        let earlier = httpdate::fmt_http_date(SystemTime::UNIX_EPOCH + Duration::from_secs(1_699_999_999));
        headers.insert(header::IF_MODIFIED_SINCE, earlier.parse().unwrap());
        assert!(is_modified_since(&headers, modified));

        headers.insert(header::IF_MODIFIED_SINCE, HeaderValue::from_static("yesterday"));
        assert!(is_modified_since(&headers, modified));
    }

    #[test]
    fn test_file_request_uri() {
        let uri = file_request_uri(Path::new("/srv/my files/a.txt")).unwrap();
        assert_eq!(uri.path(), "/srv/my%20files/a.txt");

        let uri = file_request_uri(Path::new("/srv/docs/")).unwrap();
        assert_eq!(uri.path(), "/srv/docs/");

        let cwd = std::env::current_dir().unwrap();
        let expected = file_request_uri(&cwd.join("notes.txt")).unwrap();
        let uri = file_request_uri(Path::new("notes.txt")).unwrap();
        assert_eq!(uri, expected);

        let uri = file_request_uri(Path::new("")).unwrap();
        assert_eq!(uri, file_request_uri(&cwd).unwrap());
    }

    #[test]
    fn test_redirect_keeps_query() {
        let req = Request::get("/docs?lang=en").body(()).unwrap();
        let head = RequestHead {
            method: req.method(),
            uri: req.uri(),
            headers: req.headers(),
            path: "/docs",
        };
        let response = redirect_with_slash(&head);
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[header::LOCATION], "/docs/?lang=en");
    }

    #[test]
    fn test_range_not_satisfiable_response() {
        let response = range_not_satisfiable(42);
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */42");
    }
}
