//! Per-request readers over cached entries
//!
//! A reader borrows one counted reference to its entry and gives it back
//! exactly once, on [`EntryReader::close`] or on drop. Big-file readers
//! return their rewound handle to the entry's idle pool.

use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::io::{self, Seek, SeekFrom};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf, Take};
use tracing::{debug, trace};

use super::cache::CacheManager;
use super::entry::{EntryBody, FileEntry};
use crate::error::ServeError;

enum ReaderKind {
    /// Serves `data[pos..end]`
    Small { data: Bytes, pos: usize, end: usize },
    /// Streams from a pooled handle, limited to the remaining range
    Big(Take<tokio::fs::File>),
    /// Holds the entry's count while the file is being opened
    Opening,
    Closed,
}

/// Byte stream over one [`FileEntry`]
pub struct EntryReader {
    entry: Arc<FileEntry>,
    cache: Arc<dyn CacheManager>,
    kind: ReaderKind,
}

impl EntryReader {
    /// Create a reader for an entry the caller already counted as a reader.
    ///
    /// The count moves into the reader when this is called, so it is given
    /// back on failure and when the returned future is dropped, even while
    /// a file is being reopened.
    pub fn open(
        entry: Arc<FileEntry>,
        cache: Arc<dyn CacheManager>,
    ) -> impl Future<Output = Result<Self, ServeError>> {
        let reader = Self {
            entry,
            cache,
            kind: ReaderKind::Opening,
        };
        reader.start()
    }

    async fn start(mut self) -> Result<Self, ServeError> {
        let entry = Arc::clone(&self.entry);
        self.kind = match entry.body() {
            EntryBody::Memory(data) => ReaderKind::Small {
                data: data.clone(),
                pos: 0,
                end: data.len(),
            },
            EntryBody::Disk { path, .. } => {
                let file = match entry.take_handle() {
                    Some(file) => tokio::fs::File::from_std(file),
                    None if entry.is_released() => {
                        return Err(ServeError::EntryReleased(entry.source().to_string()));
                    }
                    None => {
                        trace!(path = %path.display(), "Idle pool empty, reopening file");
                        tokio::fs::File::open(path)
                            .await
                            .map_err(|e| ServeError::open(path, e))?
                    }
                };
                ReaderKind::Big(file.take(entry.content_length()))
            }
        };

        Ok(self)
    }

    pub fn entry(&self) -> &FileEntry {
        &self.entry
    }

    /// Bytes left to read
    pub fn remaining(&self) -> u64 {
        match &self.kind {
            ReaderKind::Small { pos, end, .. } => (end - pos) as u64,
            ReaderKind::Big(take) => take.limit(),
            ReaderKind::Opening | ReaderKind::Closed => 0,
        }
    }

    /// Restrict the reader to the inclusive range `[start, end]`
    pub async fn set_range(&mut self, start: u64, end: u64) -> Result<(), ServeError> {
        let source = self.entry.source().to_string();
        if start > end || end >= self.entry.content_length() {
            return Err(invalid_range(source, "range outside of content"));
        }

        match &mut self.kind {
            ReaderKind::Small { pos, end: stop, .. } => {
                *pos = start as usize;
                *stop = end as usize + 1;
            }
            ReaderKind::Big(take) => {
                take.get_mut()
                    .seek(SeekFrom::Start(start))
                    .await
                    .map_err(|e| ServeError::Seek { path: source, source: e })?;
                take.set_limit(end - start + 1);
            }
            ReaderKind::Opening | ReaderKind::Closed => {
                return Err(invalid_range(source, "reader is closed"))
            }
        }
        Ok(())
    }

    /// Copy everything that remains into `writer`.
    ///
    /// Response bodies stream through the [`AsyncRead`] impl. This is the
    /// bulk path for callers that own a sink, such as a socket or a file.
    pub async fn write_to<W>(&mut self, writer: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        match &mut self.kind {
            ReaderKind::Small { data, pos, end } => {
                let chunk = data.slice(*pos..*end);
                writer.write_all(&chunk).await?;
                *pos = *end;
                Ok(chunk.len() as u64)
            }
            ReaderKind::Big(take) => tokio::io::copy(take, writer).await,
            ReaderKind::Opening | ReaderKind::Closed => Ok(0),
        }
    }

    /// Give the entry back, surfacing handle recycling errors
    pub fn close(mut self) -> Result<(), ServeError> {
        self.finish().map_err(ServeError::from)
    }

    fn finish(&mut self) -> io::Result<()> {
        let result = match std::mem::replace(&mut self.kind, ReaderKind::Closed) {
            ReaderKind::Closed => return Ok(()),
            ReaderKind::Small { .. } | ReaderKind::Opening => Ok(()),
            ReaderKind::Big(take) => self.recycle(take.into_inner()),
        };
        self.cache.release_reader(&self.entry);
        result
    }

    fn recycle(&self, file: tokio::fs::File) -> io::Result<()> {
        match file.try_into_std() {
            Ok(mut file) => {
                file.seek(SeekFrom::Start(0))?;
                if !self.entry.return_handle(file) {
                    trace!(source = %self.entry.source(), "Dropped handle of released entry");
                }
                Ok(())
            }
            Err(_) => {
                debug!(source = %self.entry.source(), "Discarding handle with an operation in flight");
                Ok(())
            }
        }
    }
}

impl fmt::Debug for EntryReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryReader")
            .field("source", &self.entry.source())
            .field("remaining", &self.remaining())
            .finish()
    }
}

fn invalid_range(path: String, reason: &str) -> ServeError {
    ServeError::Seek {
        path,
        source: io::Error::new(io::ErrorKind::InvalidInput, reason.to_string()),
    }
}

impl AsyncRead for EntryReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().kind {
            ReaderKind::Small { data, pos, end } => {
                let n = (*end - *pos).min(buf.remaining());
                buf.put_slice(&data[*pos..*pos + n]);
                *pos += n;
                Poll::Ready(Ok(()))
            }
            ReaderKind::Big(take) => Pin::new(take).poll_read(cx, buf),
            ReaderKind::Opening | ReaderKind::Closed => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for EntryReader {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            debug!(source = %self.entry.source(), error = %e, "Failed to recycle file handle");
        }
    }
}
