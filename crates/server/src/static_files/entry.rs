//! Cached file entries
//!
//! A [`FileEntry`] describes one servable artifact: a plain file, a
//! compressed sibling, an in-memory compressed copy or a rendered directory
//! listing. Everything except the reader count is fixed at construction.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::trace;

use super::compression::{decode_prefix, ContentEncoding};
use super::sniff::{content_type_by_extension, detect_content_type, SNIFF_LEN};
use crate::error::ServeError;

/// OS files up to this size are read into memory; larger ones are streamed
pub const SMALL_FILE_THRESHOLD: u64 = 2 * 4096;

/// Where an entry's bytes come from
#[derive(Debug)]
pub enum EntryBody {
    /// Whole content held in memory
    Memory(Bytes),
    /// Big file on disk with a pool of idle open handles
    Disk {
        path: PathBuf,
        idle: Mutex<Vec<File>>,
    },
}

/// Descriptor of one servable artifact
#[derive(Debug)]
pub struct FileEntry {
    source: String,
    body: EntryBody,
    content_type: String,
    content_length: u64,
    last_modified: SystemTime,
    last_modified_str: String,
    encoding: ContentEncoding,
    compressed: bool,
    created_at: Instant,
    readers: AtomicUsize,
    released: AtomicBool,
}

impl FileEntry {
    /// Entry whose content is already in memory
    pub fn in_memory(
        source: impl Into<String>,
        data: Bytes,
        content_type: impl Into<String>,
        last_modified: SystemTime,
        encoding: ContentEncoding,
        compressed: bool,
    ) -> Self {
        let content_length = data.len() as u64;
        Self::new(
            source.into(),
            EntryBody::Memory(data),
            content_type.into(),
            content_length,
            last_modified,
            encoding,
            compressed,
        )
    }

    fn new(
        source: String,
        body: EntryBody,
        content_type: String,
        content_length: u64,
        last_modified: SystemTime,
        encoding: ContentEncoding,
        compressed: bool,
    ) -> Self {
        Self {
            source,
            body,
            content_type,
            content_length,
            last_modified,
            last_modified_str: httpdate::fmt_http_date(last_modified),
            encoding,
            compressed,
            created_at: Instant::now(),
            readers: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        }
    }

    /// Open a file on the OS filesystem.
    ///
    /// `encoding` is the cache partition the entry belongs to. When
    /// `compressed` is set the file holds `encoding`-compressed bytes and
    /// `suffix` is stripped from its name before the extension lookup.
    pub async fn open_os(
        path: PathBuf,
        encoding: ContentEncoding,
        compressed: bool,
        suffix: String,
    ) -> Result<Self, ServeError> {
        tokio::task::spawn_blocking(move || open_os_blocking(path, encoding, compressed, &suffix))
            .await?
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Display path of the artifact
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn body(&self) -> &EntryBody {
        &self.body
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    /// Pre-formatted `Last-Modified` header value
    pub fn last_modified_str(&self) -> &str {
        &self.last_modified_str
    }

    /// Cache partition this entry belongs to
    pub fn encoding(&self) -> ContentEncoding {
        self.encoding
    }

    /// Whether the bytes are encoded with [`Self::encoding`]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    // ========================================================================
    // Reader Accounting
    // ========================================================================

    /// Outstanding readers
    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    /// Count one more reader. Callers hold the owning partition lock.
    pub(crate) fn acquire(&self) {
        self.readers.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reader without going below zero, returning the new count.
    /// Callers hold the owning partition lock.
    pub(crate) fn release_one(&self) -> usize {
        let previous = self
            .readers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(1))
            })
            .unwrap_or_else(|n| n);
        previous.saturating_sub(1)
    }

    /// Close pooled handles. Must only be called once no reader remains.
    pub fn release(&self) {
        match &self.body {
            EntryBody::Disk { idle, .. } => {
                let mut idle = idle.lock();
                self.released.store(true, Ordering::Release);
                let closed = idle.len();
                idle.clear();
                trace!(source = %self.source, closed_handles = closed, "Released file entry");
            }
            EntryBody::Memory(_) => {
                self.released.store(true, Ordering::Release);
            }
        }
    }

    /// Take an idle handle from the pool
    pub(crate) fn take_handle(&self) -> Option<File> {
        match &self.body {
            EntryBody::Disk { idle, .. } => idle.lock().pop(),
            EntryBody::Memory(_) => None,
        }
    }

    /// Return a rewound handle to the pool. Dropped if the entry was released.
    pub(crate) fn return_handle(&self, file: File) -> bool {
        match &self.body {
            EntryBody::Disk { idle, .. } => {
                let mut idle = idle.lock();
                if self.released.load(Ordering::Acquire) {
                    return false;
                }
                idle.push(file);
                true
            }
            EntryBody::Memory(_) => false,
        }
    }

    /// Idle handles currently pooled
    pub fn idle_handles(&self) -> usize {
        match &self.body {
            EntryBody::Disk { idle, .. } => idle.lock().len(),
            EntryBody::Memory(_) => 0,
        }
    }
}

// ============================================================================
// Opening
// ============================================================================

fn open_os_blocking(
    path: PathBuf,
    encoding: ContentEncoding,
    compressed: bool,
    suffix: &str,
) -> Result<FileEntry, ServeError> {
    let mut file = File::open(&path).map_err(|e| ServeError::open(&path, e))?;
    let metadata = file.metadata().map_err(|e| ServeError::open(&path, e))?;

    if metadata.is_dir() {
        return Err(if compressed {
            ServeError::UnexpectedDirectory(path)
        } else {
            ServeError::DirIndexRequired
        });
    }

    let len = metadata.len();
    if usize::try_from(len).is_err() {
        return Err(ServeError::TooLarge(len));
    }
    let last_modified = metadata.modified()?;

    let decoder = if compressed { encoding } else { ContentEncoding::Identity };
    let content_type = resolve_content_type(&path, decoder, suffix, &mut file)?;
    file.seek(SeekFrom::Start(0))?;

    let source = path.display().to_string();
    if len <= SMALL_FILE_THRESHOLD {
        let mut data = Vec::with_capacity(len as usize);
        file.read_to_end(&mut data)?;
        return Ok(FileEntry::in_memory(
            source,
            Bytes::from(data),
            content_type,
            last_modified,
            encoding,
            compressed,
        ));
    }

    Ok(FileEntry::new(
        source,
        EntryBody::Disk {
            path,
            idle: Mutex::new(vec![file]),
        },
        content_type,
        len,
        last_modified,
        encoding,
        compressed,
    ))
}

/// Detect the content type of a file.
///
/// The extension is looked up after stripping `suffix` from compressed
/// files; unknown extensions fall back to sniffing the first bytes, decoded
/// with `decoder`.
pub fn resolve_content_type<R: Read>(
    path: &Path,
    decoder: ContentEncoding,
    suffix: &str,
    reader: R,
) -> io::Result<String> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = if decoder.is_identity() {
        name.as_str()
    } else {
        name.strip_suffix(suffix).unwrap_or(&name)
    };

    if let Some(content_type) = content_type_by_extension(Path::new(name)) {
        return Ok(content_type);
    }

    let header = decode_prefix(decoder, reader, SNIFF_LEN)?;
    Ok(detect_content_type(&header).to_string())
}

/// Modification time of a file, truncated to whole seconds
pub fn file_last_modified(path: impl AsRef<Path>) -> io::Result<SystemTime> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(truncate_to_secs(modified))
}

/// Drop sub-second precision, as HTTP dates carry none
pub fn truncate_to_secs(time: SystemTime) -> SystemTime {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => UNIX_EPOCH + Duration::from_secs(since.as_secs()),
        Err(_) => time,
    }
}
