//! HTTP Range header parsing for static file serving
//!
//! Single `bytes=` ranges only, following RFC 2616 section 14.35:
//! - `bytes=0-499` - first 500 bytes
//! - `bytes=-500` - last 500 bytes
//! - `bytes=500-` - from byte 500 to the end

use thiserror::Error;

// ============================================================================
// Range Types
// ============================================================================

/// Inclusive byte range within a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    /// Start byte (inclusive)
    pub start: u64,
    /// End byte (inclusive)
    pub end: u64,
}

impl RangeSpec {
    /// Create a new range specification
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered by this range
    pub fn content_length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` header value for this range
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

/// Why a Range header could not be satisfied
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("cannot take a byte range of empty content")]
    Empty,

    #[error("unsupported range units in {0:?}, expecting \"bytes\"")]
    Units(String),

    #[error("missing byte range in {0:?}")]
    MissingRange(String),

    #[error("missing the end position of byte range in {0:?}")]
    MissingDash(String),

    #[error("invalid number in byte range {0:?}")]
    InvalidNumber(String),

    #[error("start position of byte range {0:?} exceeds {1}")]
    StartOutOfBounds(String, u64),

    #[error("start position exceeds end position in byte range {0:?}")]
    Inverted(String),

    #[error("suffix length of byte range {0:?} is zero")]
    ZeroSuffix(String),
}

// ============================================================================
// Range Parsing
// ============================================================================

/// Parse a `Range` header value against a resource of `content_length` bytes
pub fn parse_byte_range(value: &str, content_length: u64) -> Result<RangeSpec, RangeError> {
    let rest = value
        .strip_prefix("bytes")
        .ok_or_else(|| RangeError::Units(value.to_string()))?;
    let rest = rest
        .strip_prefix('=')
        .ok_or_else(|| RangeError::MissingRange(value.to_string()))?;
    let (start_str, end_str) = rest
        .split_once('-')
        .ok_or_else(|| RangeError::MissingDash(value.to_string()))?;

    if content_length == 0 {
        return Err(RangeError::Empty);
    }
    let last = content_length - 1;

    if start_str.is_empty() {
        // Suffix range: last N bytes
        let suffix = parse_position(end_str, value)?;
        if suffix == 0 {
            return Err(RangeError::ZeroSuffix(value.to_string()));
        }
        return Ok(RangeSpec::new(content_length.saturating_sub(suffix), last));
    }

    let start = parse_position(start_str, value)?;
    if start >= content_length {
        return Err(RangeError::StartOutOfBounds(value.to_string(), last));
    }

    if end_str.is_empty() {
        return Ok(RangeSpec::new(start, last));
    }

    let end = parse_position(end_str, value)?.min(last);
    if end < start {
        return Err(RangeError::Inverted(value.to_string()));
    }
    Ok(RangeSpec::new(start, end))
}

fn parse_position(digits: &str, value: &str) -> Result<u64, RangeError> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::InvalidNumber(value.to_string()));
    }
    digits
        .parse()
        .map_err(|_| RangeError::InvalidNumber(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_range_full() {
        assert_eq!(
            parse_byte_range("bytes=0-499", 1000),
            Ok(RangeSpec::new(0, 499))
        );
    }

    #[test]
    fn test_parse_range_open_ended() {
        assert_eq!(
            parse_byte_range("bytes=500-", 1000),
            Ok(RangeSpec::new(500, 999))
        );
    }

    #[test]
    fn test_parse_range_suffix() {
        assert_eq!(
            parse_byte_range("bytes=-100", 1000),
            Ok(RangeSpec::new(900, 999))
        );
        // Suffix longer than the content covers everything
        assert_eq!(
            parse_byte_range("bytes=-5000", 1000),
            Ok(RangeSpec::new(0, 999))
        );
    }

    #[test]
    fn test_parse_range_start_past_end() {
        assert!(matches!(
            parse_byte_range("bytes=1000-1001", 1000),
            Err(RangeError::StartOutOfBounds(_, 999))
        ));
    }

    #[test]
    fn test_parse_range_inverted() {
        assert!(matches!(
            parse_byte_range("bytes=500-100", 1000),
            Err(RangeError::Inverted(_))
        ));
    }

    #[test]
    fn test_parse_range_clamp_to_file_size() {
        assert_eq!(
            parse_byte_range("bytes=0-2000", 1000),
            Ok(RangeSpec::new(0, 999))
        );
    }

    #[test]
    fn test_parse_range_malformed() {
        assert!(matches!(
            parse_byte_range("items=0-1", 10),
            Err(RangeError::Units(_))
        ));
        assert!(matches!(
            parse_byte_range("bytes0-1", 10),
            Err(RangeError::MissingRange(_))
        ));
        assert!(matches!(
            parse_byte_range("bytes=5", 10),
            Err(RangeError::MissingDash(_))
        ));
        assert!(matches!(
            parse_byte_range("bytes=a-3", 10),
            Err(RangeError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_byte_range("bytes=-0", 10),
            Err(RangeError::ZeroSuffix(_))
        ));
        assert_eq!(parse_byte_range("bytes=0-1", 0), Err(RangeError::Empty));
    }

    #[test]
    fn test_range_spec_content_range() {
        let range = RangeSpec::new(0, 4);
        assert_eq!(range.content_length(), 5);
        assert_eq!(range.content_range(20), "bytes 0-4/20");
    }

    proptest! {
        #[test]
        fn prop_parsed_range_within_bounds(start in 0u64..2000, end in 0u64..2000, len in 1u64..1500) {
            let value = format!("bytes={}-{}", start, end);
            if let Ok(range) = parse_byte_range(&value, len) {
                prop_assert!(range.start <= range.end);
                prop_assert!(range.end < len);
                prop_assert_eq!(range.start, start);
            }
        }

        #[test]
        fn prop_suffix_range_ends_at_last_byte(suffix in 1u64..5000, len in 1u64..5000) {
            let range = parse_byte_range(&format!("bytes=-{}", suffix), len).unwrap();
            prop_assert_eq!(range.end, len - 1);
            prop_assert_eq!(range.content_length(), suffix.min(len));
        }
    }
}
