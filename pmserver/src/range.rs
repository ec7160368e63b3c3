#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpRange {
    // inclusive on both ends
    pub start: u64,
    pub end: u64,
}

impl HttpRange {
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    Malformed,
    Unsatisfiable,
    MultipleRanges,
}

// how wrong is this?
impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn parse_spec(input: &str) -> Option<(Option<u64>, Option<u64>)> {
    use nom::{
        IResult, Parser,
        bytes::complete::tag,
        character::complete::{char, u64 as number},
        combinator::opt,
    };
    fn parser(input: &str) -> IResult<&str, (Option<u64>, Option<u64>)> {
        let (input, _) = tag("bytes=").parse(input)?;
        let (input, start) = opt(number).parse(input)?;
        let (input, _) = char('-').parse(input)?;
        let (input, end) = opt(number).parse(input)?;
        Ok((input, (start, end)))
    }
    let (rest, spec) = parser(input).ok()?;
    if !rest.is_empty() {
        return None;
    }
    Some(spec)
}

// resolve a Range header against a known size. the end is clamped like everyone
// clamps it, a start at or past the end of the content is unsatisfiable
pub fn parse(header: &str, size: u64) -> Result<HttpRange, Error> {
    if header.contains(',') {
        return Err(Error::MultipleRanges);
    }
    let (start, end) = parse_spec(header).ok_or(Error::Malformed)?;
    match (start, end) {
        (Some(start), Some(end)) => {
            if start > end {
                return Err(Error::Malformed);
            }
            if start >= size {
                return Err(Error::Unsatisfiable);
            }
            Ok(HttpRange {
                start,
                end: end.min(size - 1),
            })
        }
        (Some(start), None) => {
            if start >= size {
                return Err(Error::Unsatisfiable);
            }
            Ok(HttpRange {
                start,
                end: size - 1,
            })
        }
        (None, Some(suffix)) => {
            if suffix == 0 || size == 0 {
                return Err(Error::Unsatisfiable);
            }
            Ok(HttpRange {
                start: size - suffix.min(size),
                end: size - 1,
            })
        }
        (None, None) => Err(Error::Malformed),
    }
}

// just "bytes=a-b", nothing else. a mirrored blob has no known size to resolve the
// open and suffix forms against, those fall back to a full fetch
pub fn parse_explicit(header: &str) -> Option<HttpRange> {
    if header.contains(',') {
        return None;
    }
    match parse_spec(header)? {
        (Some(start), Some(end)) if start <= end => Some(HttpRange { start, end }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_sided() {
        let r = parse("bytes=0-99", 100).unwrap();
        assert_eq!(r, HttpRange { start: 0, end: 99 });
        assert_eq!(r.size(), 100);

        let r = parse("bytes=40-99", 100).unwrap();
        assert_eq!(r, HttpRange { start: 40, end: 99 });
        assert_eq!(r.size(), 60);
        assert_eq!(r.content_range(100), "bytes 40-99/100");

        // end clamps to the content
        let r = parse("bytes=10-5000", 100).unwrap();
        assert_eq!(r, HttpRange { start: 10, end: 99 });
    }

    #[test]
    fn test_open_end() {
        let r = parse("bytes=40-", 100).unwrap();
        assert_eq!(r, HttpRange { start: 40, end: 99 });
    }

    #[test]
    fn test_suffix() {
        let r = parse("bytes=-10", 100).unwrap();
        assert_eq!(r, HttpRange { start: 90, end: 99 });
        // a suffix longer than the content is the whole content
        let r = parse("bytes=-500", 100).unwrap();
        assert_eq!(r, HttpRange { start: 0, end: 99 });
    }

    #[test]
    fn test_unsatisfiable() {
        assert!(matches!(parse("bytes=100-", 100), Err(Error::Unsatisfiable)));
        assert!(matches!(
            parse("bytes=100-200", 100),
            Err(Error::Unsatisfiable)
        ));
        assert!(matches!(parse("bytes=-0", 100), Err(Error::Unsatisfiable)));
        assert!(matches!(parse("bytes=0-0", 0), Err(Error::Unsatisfiable)));
    }

    #[test]
    fn test_malformed() {
        for header in ["bytes=", "bytes=a-b", "0-99", "bytes=5-2", "bytes=1-2x"] {
            assert!(
                matches!(parse(header, 100), Err(Error::Malformed)),
                "{header}"
            );
        }
        assert!(matches!(
            parse("bytes=0-1,5-6", 100),
            Err(Error::MultipleRanges)
        ));
    }

    #[test]
    fn test_parse_explicit() {
        assert_eq!(
            parse_explicit("bytes=40-99"),
            Some(HttpRange { start: 40, end: 99 })
        );
        assert_eq!(parse_explicit("bytes=40-"), None);
        assert_eq!(parse_explicit("bytes=-10"), None);
        assert_eq!(parse_explicit("bytes=0-1,5-6"), None);
        assert_eq!(parse_explicit("junk"), None);
    }
}
