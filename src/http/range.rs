//! `Range` header parsing
//!
//! Single byte ranges only: `bytes=a-b`, `bytes=a-` and `bytes=-n`.
//! Players scrubbing video never ask for more than one window at a time.

/// Inclusive byte window inside a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a file of `size` bytes
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("Requested range is not satisfiable")]
    Unsatisfiable,

    #[error("Malformed Range header")]
    Malformed,
}

/// Parse a `Range` header against a file of `size` bytes
///
/// # Arguments
/// * `header` - Raw header value, e.g. `bytes=0-1023`
/// * `size` - Size of the cached file in bytes
///
/// # Returns
/// The clamped window, or `None` when the header does not use the `bytes`
/// unit and the whole file should be served
pub fn parse_range(header: &str, size: u64) -> Result<Option<ByteRange>, RangeError> {
    let header = header.trim();
    let Some((unit, ranges)) = header.split_once('=') else {
        return Ok(None);
    };
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return Ok(None);
    }

    let ranges = ranges.trim();
    if ranges.contains(',') {
        return Err(RangeError::Unsatisfiable);
    }
    let (first, last) = ranges.split_once('-').ok_or(RangeError::Malformed)?;
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        // Suffix form: the final `n` bytes
        let suffix: u64 = last.parse().map_err(|_| RangeError::Malformed)?;
        if suffix == 0 || size == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        return Ok(Some(ByteRange {
            start: size.saturating_sub(suffix),
            end: size - 1,
        }));
    }

    let start: u64 = first.parse().map_err(|_| RangeError::Malformed)?;
    let end = if last.is_empty() {
        None
    } else {
        Some(last.parse::<u64>().map_err(|_| RangeError::Malformed)?)
    };

    if matches!(end, Some(end) if end < start) || start >= size {
        return Err(RangeError::Unsatisfiable);
    }

    Ok(Some(ByteRange {
        start,
        end: end.map_or(size - 1, |end| end.min(size - 1)),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: u64, end: u64) -> Option<ByteRange> {
        Some(ByteRange { start, end })
    }

    #[test]
    fn test_closed_range() {
        let parsed = parse_range("bytes=0-1023", 10_000).unwrap();
        assert_eq!(parsed, range(0, 1023));
        let parsed = parsed.unwrap();
        assert_eq!(parsed.len(), 1024);
        assert_eq!(parsed.content_range(10_000), "bytes 0-1023/10000");
    }

    #[test]
    fn test_open_ended_range() {
        let parsed = parse_range("bytes=9000-", 10_000).unwrap().unwrap();
        assert_eq!(parsed, ByteRange { start: 9000, end: 9999 });
        assert_eq!(parsed.len(), 1000);
        assert_eq!(parsed.content_range(10_000), "bytes 9000-9999/10000");
    }

    #[test]
    fn test_end_is_clamped() {
        assert_eq!(parse_range("bytes=9500-20000", 10_000).unwrap(), range(9500, 9999));
        assert_eq!(parse_range("bytes=0-0", 1).unwrap(), range(0, 0));
    }

    #[test]
    fn test_start_past_end_of_file() {
        assert_eq!(parse_range("bytes=20000-", 10_000), Err(RangeError::Unsatisfiable));
        assert_eq!(parse_range("bytes=10000-10001", 10_000), Err(RangeError::Unsatisfiable));
        assert_eq!(parse_range("bytes=0-", 0), Err(RangeError::Unsatisfiable));
    }

    #[test]
    fn test_suffix_range() {
        assert_eq!(parse_range("bytes=-500", 10_000).unwrap(), range(9500, 9999));
        assert_eq!(parse_range("bytes=-50000", 10_000).unwrap(), range(0, 9999));
        assert_eq!(parse_range("bytes=-0", 10_000), Err(RangeError::Unsatisfiable));
    }

    #[test]
    fn test_multi_range_rejected() {
        assert_eq!(
            parse_range("bytes=0-99,200-299", 10_000),
            Err(RangeError::Unsatisfiable)
        );
    }

    #[test]
    fn test_reversed_range_rejected() {
        assert_eq!(parse_range("bytes=500-100", 10_000), Err(RangeError::Unsatisfiable));
    }

    #[test]
    fn test_malformed() {
        assert_eq!(parse_range("bytes=abc-", 10_000), Err(RangeError::Malformed));
        assert_eq!(parse_range("bytes=100", 10_000), Err(RangeError::Malformed));
        assert_eq!(parse_range("bytes=-x", 10_000), Err(RangeError::Malformed));
    }

    #[test]
    fn test_other_units_ignored() {
        assert_eq!(parse_range("items=0-5", 10_000), Ok(None));
        assert_eq!(parse_range("garbage", 10_000), Ok(None));
        assert_eq!(parse_range(" Bytes = 5-9 ", 10_000).unwrap(), range(5, 9));
    }
}
