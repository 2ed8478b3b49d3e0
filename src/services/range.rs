//! `Range: bytes=...` parsing and resolution.

use super::{
    bucket::ByteRange,
    error::{BlobError, BlobResult},
};

/// A single byte-range request as sent by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=start-end`
    Bounded { start: u64, end: u64 },
    /// `bytes=start-`
    From { start: u64 },
    /// `bytes=-len`
    Suffix { len: u64 },
}

impl RangeSpec {
    /// Parse a `Range` header value. Multi-range and non-byte units yield `None`,
    /// which callers treat as a request for the full object.
    pub fn parse(header: &str) -> Option<Self> {
        let spec = header.trim().strip_prefix("bytes=")?.trim();
        if spec.contains(',') {
            return None;
        }
        let (start, end) = spec.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());
        match (start.is_empty(), end.is_empty()) {
            (true, true) => None,
            (true, false) => Some(RangeSpec::Suffix {
                len: end.parse().ok()?,
            }),
            (false, true) => Some(RangeSpec::From {
                start: start.parse().ok()?,
            }),
            (false, false) => {
                let start: u64 = start.parse().ok()?;
                let end: u64 = end.parse().ok()?;
                (start <= end).then_some(RangeSpec::Bounded { start, end })
            }
        }
    }

    /// Clamp against an object of `size` bytes.
    pub fn resolve(self, size: u64) -> BlobResult<ByteRange> {
        let unsatisfiable = || BlobError::RangeNotSatisfiable { size };
        if size == 0 {
            return Err(unsatisfiable());
        }
        let last = size - 1;
        let range = match self {
            RangeSpec::Bounded { start, end } if start <= last => ByteRange {
                start,
                end: end.min(last),
            },
            RangeSpec::From { start } if start <= last => ByteRange { start, end: last },
            RangeSpec::Suffix { len } if len > 0 => ByteRange {
                start: size.saturating_sub(len),
                end: last,
            },
            _ => return Err(unsatisfiable()),
        };
        Ok(range)
    }
}

/// `Content-Range` value for a served range.
pub fn content_range(range: ByteRange, size: u64) -> String {
    format!("bytes {}-{}/{}", range.start, range.end, size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_ranges() {
        assert_eq!(
            RangeSpec::parse("bytes=0-99"),
            Some(RangeSpec::Bounded { start: 0, end: 99 })
        );
        assert_eq!(RangeSpec::parse("bytes=500-"), Some(RangeSpec::From { start: 500 }));
        assert_eq!(RangeSpec::parse("bytes=-20"), Some(RangeSpec::Suffix { len: 20 }));
        assert_eq!(RangeSpec::parse("bytes=0-1,5-6"), None);
        assert_eq!(RangeSpec::parse("items=0-1"), None);
        assert_eq!(RangeSpec::parse("bytes=9-1"), None);
        assert_eq!(RangeSpec::parse("bytes=-"), None);
        assert_eq!(RangeSpec::parse("bytes=a-b"), None);
    }

    #[test]
    fn resolves_against_size() {
        let r = RangeSpec::Bounded { start: 0, end: 99 }.resolve(1000).unwrap();
        assert_eq!((r.start, r.end, r.len()), (0, 99, 100));
        assert_eq!(content_range(r, 1000), "bytes 0-99/1000");

        let r = RangeSpec::Bounded { start: 900, end: 5000 }.resolve(1000).unwrap();
        assert_eq!((r.start, r.end), (900, 999));

        let r = RangeSpec::Suffix { len: 5000 }.resolve(1000).unwrap();
        assert_eq!((r.start, r.end), (0, 999));

        let r = RangeSpec::From { start: 999 }.resolve(1000).unwrap();
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn unsatisfiable_ranges() {
        for spec in [
            RangeSpec::From { start: 1000 },
            RangeSpec::Bounded { start: 1000, end: 1001 },
            RangeSpec::Suffix { len: 0 },
        ] {
            assert!(matches!(
                spec.resolve(1000),
                Err(BlobError::RangeNotSatisfiable { size: 1000 })
            ));
        }
        assert!(RangeSpec::From { start: 0 }.resolve(0).is_err());
    }
}
