//! Response body for static files

use bytes::Bytes;
use futures::Stream;
use http_body::{Body, Frame, SizeHint};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::io::ReaderStream;

use super::reader::EntryReader;

/// Chunk size used when streaming big files
const CHUNK_SIZE: usize = 64 * 1024;

/// Body of a static file response.
///
/// Dropping a streaming body before it is drained still closes the
/// underlying reader.
#[derive(Debug)]
pub enum FileBody {
    Empty,
    Full(Option<Bytes>),
    Stream {
        stream: ReaderStream<EntryReader>,
        remaining: u64,
    },
}

impl FileBody {
    pub fn empty() -> Self {
        FileBody::Empty
    }

    pub fn full(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        if data.is_empty() {
            FileBody::Empty
        } else {
            FileBody::Full(Some(data))
        }
    }

    /// Stream `length` bytes from `reader`
    pub fn from_reader(reader: EntryReader, length: u64) -> Self {
        FileBody::Stream {
            stream: ReaderStream::with_capacity(reader, CHUNK_SIZE),
            remaining: length,
        }
    }
}

impl Default for FileBody {
    fn default() -> Self {
        FileBody::Empty
    }
}

impl Body for FileBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut() {
            FileBody::Empty => Poll::Ready(None),
            FileBody::Full(data) => Poll::Ready(data.take().map(|d| Ok(Frame::data(d)))),
            FileBody::Stream { stream, remaining } => {
                match Pin::new(stream).poll_next(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(Some(Ok(chunk))) => {
                        *remaining = remaining.saturating_sub(chunk.len() as u64);
                        Poll::Ready(Some(Ok(Frame::data(chunk))))
                    }
                    Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
                    Poll::Ready(None) if *remaining > 0 => {
                        let missing = *remaining;
                        *remaining = 0;
                        Poll::Ready(Some(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("file ended {} bytes early", missing),
                        ))))
                    }
                    Poll::Ready(None) => Poll::Ready(None),
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            FileBody::Empty => true,
            FileBody::Full(data) => data.is_none(),
            FileBody::Stream { remaining, .. } => *remaining == 0,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            FileBody::Empty => SizeHint::with_exact(0),
            FileBody::Full(data) => {
                SizeHint::with_exact(data.as_ref().map_or(0, |d| d.len() as u64))
            }
            FileBody::Stream { remaining, .. } => SizeHint::with_exact(*remaining),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_full_body() {
        let body = FileBody::full("hello");
        assert_eq!(body.size_hint().exact(), Some(5));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello");
    }

    #[tokio::test]
    async fn test_empty_body() {
        let body = FileBody::empty();
        assert!(body.is_end_stream());
        let collected = body.collect().await.unwrap().to_bytes();
        assert!(collected.is_empty());
    }
}
