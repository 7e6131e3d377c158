//! Compression pipeline
//!
//! Turns a resolved file path and a negotiated encoding into a fresh
//! [`FileEntry`]. Compressed siblings are reused while they are not older
//! than their source, and produced at most once at a time per target path.

use bytes::Bytes;
use dashmap::DashMap;
use fileserve_config::CompressedSuffixes;
use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace};

use super::compression::{
    compress_content, compress_into, is_compressible, ContentEncoding, MAX_COMPRESSIBLE_FILE_SIZE,
    MIN_COMPRESS_RATIO,
};
use super::entry::{resolve_content_type, FileEntry};
use super::path::PathResolver;
use super::vfs::{FileMeta, FileSystem};
use crate::error::ServeError;

/// A compressed sibling this much older than its source is rebuilt
pub const STALE_THRESHOLD: Duration = Duration::from_secs(1);

// ============================================================================
// Lock Table
// ============================================================================

/// Per-target locks serializing creation of compressed files.
///
/// Locks are keyed by absolute target path and never evicted, so servers
/// sharing a table never compress the same file twice concurrently.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: DashMap<PathBuf, Arc<AsyncMutex<()>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock guarding `target`, created on first use
    pub fn lock_for(&self, target: &Path) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry(target.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn contains(&self, target: &Path) -> bool {
        self.locks.contains_key(target)
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Opens plain files and their compressed variants
#[derive(Debug)]
pub struct CompressionPipeline {
    fs: Arc<dyn FileSystem>,
    resolver: PathResolver,
    suffixes: CompressedSuffixes,
    locks: Arc<LockTable>,
}

impl CompressionPipeline {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        resolver: PathResolver,
        suffixes: CompressedSuffixes,
        locks: Arc<LockTable>,
    ) -> Self {
        Self {
            fs,
            resolver,
            suffixes,
            locks,
        }
    }

    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    pub fn suffixes(&self) -> &CompressedSuffixes {
        &self.suffixes
    }

    /// File name suffix of artifacts compressed with `encoding`
    pub fn suffix(&self, encoding: ContentEncoding) -> &str {
        match encoding {
            ContentEncoding::Identity => "",
            ContentEncoding::Brotli => &self.suffixes.br,
            ContentEncoding::Gzip => &self.suffixes.gzip,
            ContentEncoding::Zstd => &self.suffixes.zstd,
        }
    }

    /// Open `file_path` for the given encoding.
    ///
    /// Falls back to the plain file, still in the `encoding` partition,
    /// whenever compressing is pointless or impossible.
    pub async fn open(
        &self,
        file_path: &Path,
        encoding: ContentEncoding,
    ) -> Result<FileEntry, ServeError> {
        if encoding.is_identity() {
            return self.open_plain(file_path, encoding).await;
        }

        let artifact = append_suffix(
            &self.resolver.to_compressed_path(file_path),
            self.suffix(encoding),
        );

        match self.fs.metadata(&artifact).await {
            Ok(meta) if meta.is_dir => Err(ServeError::UnexpectedDirectory(artifact)),
            Ok(meta) => {
                let source = self
                    .fs
                    .metadata(file_path)
                    .await
                    .map_err(|e| ServeError::open(file_path, e))?;

                if !is_stale(source.modified, meta.modified) {
                    return self.open_artifact(&artifact, encoding).await;
                }

                debug!(
                    path = %file_path.display(),
                    artifact = %artifact.display(),
                    "Compressed file is stale, recompressing"
                );
                if self.fs.is_os() {
                    if let Err(e) = tokio::fs::remove_file(&artifact).await {
                        debug!(artifact = %artifact.display(), error = %e, "Cannot remove stale compressed file");
                    }
                }
                self.compress_and_open(file_path, encoding).await
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.compress_and_open(file_path, encoding).await
            }
            Err(e) => Err(ServeError::open(artifact, e)),
        }
    }

    /// Open `file_path` uncompressed, filed under `partition`
    pub async fn open_plain(
        &self,
        file_path: &Path,
        partition: ContentEncoding,
    ) -> Result<FileEntry, ServeError> {
        if self.fs.is_os() {
            return FileEntry::open_os(file_path.to_path_buf(), partition, false, String::new())
                .await;
        }

        let meta = match self.fs.metadata(file_path).await {
            Ok(meta) => meta,
            Err(_) if file_path.as_os_str().is_empty() => return Err(ServeError::DirIndexRequired),
            Err(e) => return Err(ServeError::open(file_path, e)),
        };
        if meta.is_dir {
            return Err(ServeError::DirIndexRequired);
        }

        let data = self
            .fs
            .read(file_path)
            .await
            .map_err(|e| ServeError::open(file_path, e))?;
        self.virtual_entry(file_path, data, meta.modified, partition, false)
    }

    async fn open_artifact(
        &self,
        artifact: &Path,
        encoding: ContentEncoding,
    ) -> Result<FileEntry, ServeError> {
        if self.fs.is_os() {
            return FileEntry::open_os(
                artifact.to_path_buf(),
                encoding,
                true,
                self.suffix(encoding).to_string(),
            )
            .await;
        }

        let meta = self
            .fs
            .metadata(artifact)
            .await
            .map_err(|e| ServeError::open(artifact, e))?;
        let data = self
            .fs
            .read(artifact)
            .await
            .map_err(|e| ServeError::open(artifact, e))?;
        self.virtual_entry(artifact, data, meta.modified, encoding, true)
    }

    async fn compress_and_open(
        &self,
        file_path: &Path,
        encoding: ContentEncoding,
    ) -> Result<FileEntry, ServeError> {
        let meta = self
            .fs
            .metadata(file_path)
            .await
            .map_err(|e| ServeError::open(file_path, e))?;
        if meta.is_dir {
            return Err(ServeError::DirIndexRequired);
        }

        let suffix = self.suffix(encoding);
        if file_path.to_string_lossy().ends_with(suffix) || meta.len > MAX_COMPRESSIBLE_FILE_SIZE {
            trace!(path = %file_path.display(), size = meta.len, "Serving file uncompressed");
            return self.open_plain(file_path, encoding).await;
        }

        if !self.fs.is_os() {
            return self.compress_virtual(file_path, meta, encoding).await;
        }

        let probe_path = file_path.to_path_buf();
        let compressible = tokio::task::spawn_blocking(move || {
            File::open(&probe_path).and_then(|file| is_compressible(file, MIN_COMPRESS_RATIO))
        })
        .await?
        .map_err(|e| ServeError::open(file_path, e))?;
        if !compressible {
            trace!(path = %file_path.display(), "File does not compress well");
            return self.open_plain(file_path, encoding).await;
        }

        let compressed_path = self.resolver.to_compressed_path(file_path);
        if compressed_path != file_path {
            if let Some(parent) = compressed_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| creation_error(parent, e))?;
            }
        }

        let target = append_suffix(&compressed_path, suffix);
        let lock_key = std::path::absolute(&target).map_err(|e| ServeError::Compress {
            path: target.clone(),
            source: e,
        })?;
        let lock = self.locks.lock_for(&lock_key);
        let _guard = lock.lock().await;

        // Another request may have finished while we waited
        if tokio::fs::metadata(&target).await.is_ok() {
            trace!(artifact = %target.display(), "Compressed file created concurrently");
            return self.open_artifact(&target, encoding).await;
        }

        let (source, destination) = (file_path.to_path_buf(), target.clone());
        let written = tokio::task::spawn_blocking(move || {
            write_compressed(&source, &destination, encoding, meta.modified)
        })
        .await??;

        debug!(
            path = %file_path.display(),
            artifact = %target.display(),
            encoding = encoding.as_str(),
            original_size = meta.len,
            compressed_size = written,
            "Created compressed file"
        );
        self.open_artifact(&target, encoding).await
    }

    async fn compress_virtual(
        &self,
        file_path: &Path,
        meta: FileMeta,
        encoding: ContentEncoding,
    ) -> Result<FileEntry, ServeError> {
        let data = self
            .fs
            .read(file_path)
            .await
            .map_err(|e| ServeError::open(file_path, e))?;

        if !is_compressible(&data[..], MIN_COMPRESS_RATIO)? {
            trace!(path = %file_path.display(), "File does not compress well");
            return self.virtual_entry(file_path, data, meta.modified, encoding, false);
        }

        let content_type = resolve_content_type(file_path, ContentEncoding::Identity, "", &data[..])
            .map_err(|e| ServeError::open(file_path, e))?;
        let compressed = compress_in_memory(data, encoding).await?;

        Ok(FileEntry::in_memory(
            display_path(file_path),
            compressed,
            content_type,
            meta.modified,
            encoding,
            true,
        ))
    }

    fn virtual_entry(
        &self,
        path: &Path,
        data: Bytes,
        modified: SystemTime,
        encoding: ContentEncoding,
        compressed: bool,
    ) -> Result<FileEntry, ServeError> {
        let decoder = if compressed {
            encoding
        } else {
            ContentEncoding::Identity
        };
        let content_type = resolve_content_type(path, decoder, self.suffix(encoding), &data[..])
            .map_err(|e| ServeError::open(path, e))?;

        Ok(FileEntry::in_memory(
            display_path(path),
            data,
            content_type,
            modified,
            encoding,
            compressed,
        ))
    }
}

/// Compress a buffer on the blocking pool
pub async fn compress_in_memory(
    data: Bytes,
    encoding: ContentEncoding,
) -> Result<Bytes, ServeError> {
    let compressed =
        tokio::task::spawn_blocking(move || compress_content(&data, encoding)).await??;
    Ok(compressed)
}

/// Whether a source modified at `source` outdates an artifact from `artifact`
pub fn is_stale(source: SystemTime, artifact: SystemTime) -> bool {
    source
        .duration_since(artifact)
        .map(|delta| delta >= STALE_THRESHOLD)
        .unwrap_or(false)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

fn display_path(path: &Path) -> String {
    format!("/{}", path.display())
}

fn creation_error(path: &Path, error: io::Error) -> ServeError {
    if error.kind() == io::ErrorKind::PermissionDenied {
        ServeError::NoCreatePermission(path.to_path_buf())
    } else {
        ServeError::Compress {
            path: path.to_path_buf(),
            source: error,
        }
    }
}

/// Compress `source` into `target` through a temporary file in the same
/// directory, carrying over the source modification time.
fn write_compressed(
    source: &Path,
    target: &Path,
    encoding: ContentEncoding,
    modified: SystemTime,
) -> Result<u64, ServeError> {
    let dir = match target.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut temp = tempfile::Builder::new()
        .prefix(".fileserve")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| creation_error(target, e))?;

    let compress_error = |e: io::Error| ServeError::Compress {
        path: target.to_path_buf(),
        source: e,
    };

    let mut input = File::open(source).map_err(|e| ServeError::open(source, e))?;
    compress_into(encoding, &mut input, temp.as_file_mut()).map_err(compress_error)?;
    temp.as_file().set_modified(modified).map_err(compress_error)?;
    let written = temp.as_file().metadata().map_err(compress_error)?.len();

    temp.persist(target).map_err(|e| compress_error(e.error))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::static_files::entry::EntryBody;
    use crate::static_files::vfs::{MemoryFs, OsFs};
    use tempfile::TempDir;

    fn compressible_text() -> String {
        "static files compress nicely when they repeat themselves. ".repeat(100)
    }

    fn os_pipeline(root: &Path, compress_root: &Path) -> CompressionPipeline {
        let resolver = PathResolver::new(root.to_path_buf(), compress_root.to_path_buf(), true);
        CompressionPipeline::new(
            Arc::new(OsFs),
            resolver,
            CompressedSuffixes::default(),
            Arc::new(LockTable::new()),
        )
    }

    fn set_mtime(path: &Path, time: SystemTime) {
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    #[test]
    fn test_is_stale() {
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        assert!(is_stale(base + Duration::from_secs(1), base));
        assert!(!is_stale(base + Duration::from_millis(999), base));
        assert!(!is_stale(base, base + Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_creates_and_reuses_compressed_sibling() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("page.html");
        std::fs::write(&source, compressible_text()).unwrap();
        let pipeline = os_pipeline(dir.path(), dir.path());

        let entry = pipeline.open(&source, ContentEncoding::Gzip).await.unwrap();
        assert!(entry.is_compressed());
        assert_eq!(entry.encoding(), ContentEncoding::Gzip);
        assert_eq!(entry.content_type(), "text/html; charset=utf-8");

        let artifact = dir.path().join("page.html.fasthttp.gz");
        let artifact_meta = std::fs::metadata(&artifact).unwrap();
        assert!(artifact_meta.len() < compressible_text().len() as u64);
        assert_eq!(
            artifact_meta.modified().unwrap(),
            std::fs::metadata(&source).unwrap().modified().unwrap()
        );

        let again = pipeline.open(&source, ContentEncoding::Gzip).await.unwrap();
        assert!(again.is_compressed());
        assert_eq!(again.content_length(), artifact_meta.len());
        assert_eq!(pipeline.locks().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_sibling_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("app.js");
        std::fs::write(&source, compressible_text()).unwrap();
        let pipeline = os_pipeline(dir.path(), dir.path());
        pipeline.open(&source, ContentEncoding::Gzip).await.unwrap();

        let artifact = dir.path().join("app.js.fasthttp.gz");
        let old = SystemTime::now() - Duration::from_secs(3600);
        set_mtime(&artifact, old);

        pipeline.open(&source, ContentEncoding::Gzip).await.unwrap();
        let rebuilt = std::fs::metadata(&artifact).unwrap().modified().unwrap();
        assert_eq!(rebuilt, std::fs::metadata(&source).unwrap().modified().unwrap());
    }

    #[tokio::test]
    async fn test_recent_sibling_within_a_second_is_kept() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("app.css");
        std::fs::write(&source, compressible_text()).unwrap();
        let artifact = dir.path().join("app.css.fasthttp.gz");
        std::fs::write(&artifact, b"not really gzip").unwrap();

        let base = SystemTime::now() - Duration::from_secs(60);
        set_mtime(&artifact, base);
        set_mtime(&source, base + Duration::from_millis(500));

        let pipeline = os_pipeline(dir.path(), dir.path());
        let entry = pipeline.open(&source, ContentEncoding::Gzip).await.unwrap();
        assert_eq!(entry.content_length(), b"not really gzip".len() as u64);
    }

    #[tokio::test]
    async fn test_incompressible_file_served_plain_in_partition() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("noise.bin");
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let noise: Vec<u8> = (0..8192)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect();
        std::fs::write(&source, &noise).unwrap();

        let pipeline = os_pipeline(dir.path(), dir.path());
        let entry = pipeline.open(&source, ContentEncoding::Brotli).await.unwrap();
        assert!(!entry.is_compressed());
        assert_eq!(entry.encoding(), ContentEncoding::Brotli);
        assert!(!dir.path().join("noise.bin.fasthttp.br").exists());
    }

    #[tokio::test]
    async fn test_separate_compress_root() {
        let served = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        std::fs::create_dir(served.path().join("css")).unwrap();
        let source = served.path().join("css/site.css");
        std::fs::write(&source, compressible_text()).unwrap();

        let pipeline = os_pipeline(served.path(), cache.path());
        let entry = pipeline.open(&source, ContentEncoding::Zstd).await.unwrap();
        assert!(entry.is_compressed());
        assert!(cache.path().join("css/site.css.fasthttp.zst").exists());
        assert!(!served.path().join("css/site.css.fasthttp.zst").exists());
    }

    #[tokio::test]
    async fn test_directories_need_an_index() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let pipeline = os_pipeline(dir.path(), dir.path());

        assert!(matches!(
            pipeline.open(&dir.path().join("sub"), ContentEncoding::Gzip).await,
            Err(ServeError::DirIndexRequired)
        ));
        assert!(matches!(
            pipeline.open(&dir.path().join("sub"), ContentEncoding::Identity).await,
            Err(ServeError::DirIndexRequired)
        ));

        std::fs::create_dir(dir.path().join("weird.txt.fasthttp.gz")).unwrap();
        std::fs::write(dir.path().join("weird.txt"), compressible_text()).unwrap();
        assert!(matches!(
            pipeline.open(&dir.path().join("weird.txt"), ContentEncoding::Gzip).await,
            Err(ServeError::UnexpectedDirectory(_))
        ));
    }

    #[tokio::test]
    async fn test_virtual_fs_compresses_in_memory() {
        let fs = Arc::new(MemoryFs::new());
        fs.insert("docs/readme.txt", compressible_text());
        let resolver = PathResolver::new(PathBuf::new(), PathBuf::new(), false);
        let pipeline = CompressionPipeline::new(
            fs,
            resolver,
            CompressedSuffixes::default(),
            Arc::new(LockTable::new()),
        );

        let entry = pipeline
            .open(Path::new("docs/readme.txt"), ContentEncoding::Gzip)
            .await
            .unwrap();
        assert!(entry.is_compressed());
        assert_eq!(entry.content_type(), "text/plain; charset=utf-8");
        assert!(matches!(entry.body(), EntryBody::Memory(_)));
        assert!(entry.content_length() < compressible_text().len() as u64);
        assert!(pipeline.locks().is_empty());

        assert!(matches!(
            pipeline.open(Path::new(""), ContentEncoding::Gzip).await,
            Err(ServeError::DirIndexRequired)
        ));
        assert!(matches!(
            pipeline.open(Path::new("docs"), ContentEncoding::Identity).await,
            Err(ServeError::DirIndexRequired)
        ));
    }
}
