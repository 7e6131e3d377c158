//! Content compression for static file serving
//!
//! Encoders persist compressed siblings and compress in-memory artifacts;
//! decoders are only used to sniff the content type of an already
//! compressed file.

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use http::{header, HeaderMap};
use std::io::{self, Read, Write};
use tracing::trace;

/// Bytes sampled by the compressibility probe
pub const PROBE_SIZE: u64 = 4096;

/// Compressed sample must be smaller than this share of the original
pub const MIN_COMPRESS_RATIO: f64 = 0.8;

/// Files above this size are always served uncompressed
pub const MAX_COMPRESSIBLE_FILE_SIZE: u64 = 8 * 1024 * 1024;

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 4;
const BROTLI_LG_WINDOW: u32 = 22;
const ZSTD_LEVEL: i32 = 3;

// ============================================================================
// Content Encoding
// ============================================================================

/// Negotiated content encoding, also the cache partition an entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentEncoding {
    Identity,
    Brotli,
    Gzip,
    Zstd,
}

impl ContentEncoding {
    /// Every encoding, in partition order
    pub const ALL: [ContentEncoding; 4] = [
        ContentEncoding::Identity,
        ContentEncoding::Brotli,
        ContentEncoding::Gzip,
        ContentEncoding::Zstd,
    ];

    /// Get the HTTP header value for this encoding
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncoding::Identity => "identity",
            ContentEncoding::Brotli => "br",
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Zstd => "zstd",
        }
    }

    /// Partition index of this encoding
    pub fn index(&self) -> usize {
        match self {
            ContentEncoding::Identity => 0,
            ContentEncoding::Brotli => 1,
            ContentEncoding::Gzip => 2,
            ContentEncoding::Zstd => 3,
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, ContentEncoding::Identity)
    }
}

/// Codecs the server is willing to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnabledCodecs {
    pub brotli: bool,
    pub zstd: bool,
    pub gzip: bool,
}

// ============================================================================
// Negotiation
// ============================================================================

/// Pick an encoding from the request's `Accept-Encoding` header.
///
/// Preference is brotli, then zstd, then gzip, regardless of the client's
/// q-values. A q-value of zero means the coding is not accepted.
pub fn negotiate_encoding(headers: &HeaderMap, enabled: EnabledCodecs) -> ContentEncoding {
    let Some(accept_str) = headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
    else {
        trace!(selected = "identity", "No Accept-Encoding header");
        return ContentEncoding::Identity;
    };

    let accepted: Vec<String> = parse_accept_encoding(accept_str)
        .into_iter()
        .filter(|(_, quality)| *quality > 0.0)
        .map(|(encoding, _)| encoding)
        .collect();
    let accepts = |name: &str| accepted.iter().any(|e| e == name);

    let selected = if enabled.brotli && accepts("br") {
        ContentEncoding::Brotli
    } else if enabled.zstd && accepts("zstd") {
        ContentEncoding::Zstd
    } else if enabled.gzip && accepts("gzip") {
        ContentEncoding::Gzip
    } else {
        ContentEncoding::Identity
    };

    trace!(
        accept_encoding = %accept_str,
        selected = selected.as_str(),
        "Negotiated content encoding"
    );
    selected
}

/// Parse Accept-Encoding header with quality values
pub fn parse_accept_encoding(header: &str) -> Vec<(String, f32)> {
    let mut encodings: Vec<(String, f32)> = header
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            if part.is_empty() {
                return None;
            }

            let mut parts = part.split(';');
            let encoding = parts.next()?.trim().to_lowercase();

            let quality = parts
                .find_map(|p| p.trim().strip_prefix("q=").and_then(|q| q.parse::<f32>().ok()))
                .unwrap_or(1.0);

            Some((encoding, quality))
        })
        .collect();

    // Sort by quality descending
    encodings.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    encodings
}

// ============================================================================
// Compression Functions
// ============================================================================

/// Stream `reader` through the encoder for `encoding` into `writer`
pub fn compress_into<R: Read, W: Write>(
    encoding: ContentEncoding,
    reader: &mut R,
    writer: W,
) -> io::Result<u64> {
    match encoding {
        ContentEncoding::Gzip => {
            let mut encoder = GzEncoder::new(writer, Compression::default());
            let copied = io::copy(reader, &mut encoder)?;
            encoder.finish()?;
            Ok(copied)
        }
        ContentEncoding::Brotli => {
            let mut encoder = brotli::CompressorWriter::new(
                writer,
                BROTLI_BUFFER_SIZE,
                BROTLI_QUALITY,
                BROTLI_LG_WINDOW,
            );
            let copied = io::copy(reader, &mut encoder)?;
            encoder.flush()?;
            let _ = encoder.into_inner();
            Ok(copied)
        }
        ContentEncoding::Zstd => {
            let mut encoder = zstd::stream::write::Encoder::new(writer, ZSTD_LEVEL)?;
            let copied = io::copy(reader, &mut encoder)?;
            encoder.finish()?;
            Ok(copied)
        }
        ContentEncoding::Identity => {
            let mut writer = writer;
            io::copy(reader, &mut writer)
        }
    }
}

/// Compress content using the specified encoding
pub fn compress_content(content: &[u8], encoding: ContentEncoding) -> io::Result<Bytes> {
    let original_size = content.len();
    if encoding.is_identity() {
        trace!(encoding = "identity", size = original_size, "No compression applied");
        return Ok(Bytes::copy_from_slice(content));
    }

    let mut compressed = Vec::with_capacity(original_size / 2);
    compress_into(encoding, &mut &content[..], &mut compressed)?;
    let compressed_size = compressed.len();

    trace!(
        encoding = encoding.as_str(),
        original_size = original_size,
        compressed_size = compressed_size,
        ratio = format!("{:.1}%", (compressed_size as f64 / original_size.max(1) as f64) * 100.0),
        "Compressed content"
    );

    Ok(Bytes::from(compressed))
}

/// Decode at most `limit` bytes from the start of a compressed stream
pub fn decode_prefix<R: Read>(
    encoding: ContentEncoding,
    reader: R,
    limit: u64,
) -> io::Result<Vec<u8>> {
    let mut data = Vec::new();
    match encoding {
        ContentEncoding::Gzip => {
            GzDecoder::new(reader).take(limit).read_to_end(&mut data)?;
        }
        ContentEncoding::Brotli => {
            brotli::Decompressor::new(reader, BROTLI_BUFFER_SIZE)
                .take(limit)
                .read_to_end(&mut data)?;
        }
        ContentEncoding::Zstd => {
            zstd::stream::read::Decoder::new(reader)?
                .take(limit)
                .read_to_end(&mut data)?;
        }
        ContentEncoding::Identity => {
            reader.take(limit).read_to_end(&mut data)?;
        }
    }
    Ok(data)
}

/// Probe whether a file is worth compressing.
///
/// Gzips the first [`PROBE_SIZE`] bytes and requires the result to be
/// smaller than `min_ratio` of the sample. Consumes up to
/// [`PROBE_SIZE`] bytes from `reader`.
pub fn is_compressible<R: Read>(reader: R, min_ratio: f64) -> io::Result<bool> {
    let mut sample = Vec::with_capacity(PROBE_SIZE as usize);
    reader.take(PROBE_SIZE).read_to_end(&mut sample)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&sample)?;
    let compressed = encoder.finish()?;

    let compressible = (compressed.len() as f64) < (sample.len() as f64) * min_ratio;
    trace!(
        sample_size = sample.len(),
        compressed_size = compressed.len(),
        compressible = compressible,
        "Compressibility probe"
    );
    Ok(compressible)
}
