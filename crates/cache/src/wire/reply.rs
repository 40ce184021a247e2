//! Reply grammar and an incremental parser
//!
//! Every reply starts with a one-byte marker:
//!
//! | marker | reply |
//! |---|---|
//! | `+` | status line |
//! | `-` | error line |
//! | `:` | integer |
//! | `$` | bulk string `$<len>\r\n<bytes>\r\n`, `$-1` is null |
//! | `*` | array `*<count>\r\n` followed by `count` replies, `*-1` is null |
//!
//! The parser works on whatever is buffered so far and reports when more
//! bytes are needed, so a reply split across reads is reassembled by
//! reading again and re-parsing.

use std::fmt;

/// Largest bulk payload or array the parser accepts
const MAX_DECLARED_LEN: i64 = 512 * 1024 * 1024;

const CRLF: &[u8] = b"\r\n";

/// A decoded server reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    /// `None` for the null bulk and the null array
    Bulk(Option<Vec<u8>>),
    Array(Vec<Reply>),
}

impl Reply {
    /// Status `OK` or `QUEUED`, the acknowledgements of a queued command
    pub fn is_ack(&self) -> bool {
        matches!(self, Reply::Status(s) if s.eq_ignore_ascii_case("OK") || s.eq_ignore_ascii_case("QUEUED"))
    }

    /// Status `OK`
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Status(s) if s.eq_ignore_ascii_case("OK"))
    }

    /// Readable rendering for diagnostics, in wire form
    pub fn describe(&self) -> String {
        match self {
            Reply::Status(s) => format!("+{s}"),
            Reply::Error(s) => format!("-{s}"),
            Reply::Integer(n) => format!(":{n}"),
            Reply::Bulk(None) => "$-1".to_string(),
            Reply::Bulk(Some(bytes)) => format!(
                "${}\r\n{}",
                bytes.len(),
                String::from_utf8_lossy(&bytes[..bytes.len().min(64)])
            ),
            Reply::Array(items) => format!("*{}", items.len()),
        }
    }
}

/// A buffer that can not be the start of a valid reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    message: String,
    /// Start of the offending bytes, for diagnostics
    excerpt: String,
}

impl ParseError {
    fn new(message: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            message: message.into(),
            excerpt: String::from_utf8_lossy(&bytes[..bytes.len().min(48)]).into_owned(),
        }
    }

    /// Rendering of the bytes that failed to parse
    pub fn excerpt(&self) -> &str {
        &self.excerpt
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} near {:?}", self.message, self.excerpt)
    }
}

impl std::error::Error for ParseError {}

/// Position of the first CRLF in `buf`
pub fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Parse one reply from the front of `buf`
///
/// Returns the reply and the number of bytes it occupies, or `None` when
/// the buffer holds only a prefix of a reply.
pub fn parse(buf: &[u8]) -> Result<Option<(Reply, usize)>, ParseError> {
    let Some(line_end) = find_crlf(buf) else {
        return match buf.first() {
            Some(b'+' | b'-' | b':' | b'$' | b'*') | None => Ok(None),
            Some(_) => Err(ParseError::new("unknown reply marker", buf)),
        };
    };
    let line = &buf[1..line_end];
    let after_line = line_end + CRLF.len();

    match buf[0] {
        b'+' => Ok(Some((Reply::Status(text(line)), after_line))),
        b'-' => Ok(Some((Reply::Error(text(line)), after_line))),
        b':' => {
            let n = integer(line).ok_or_else(|| ParseError::new("malformed integer", buf))?;
            Ok(Some((Reply::Integer(n), after_line)))
        }
        b'$' => parse_bulk(buf, line, after_line),
        b'*' => parse_array(buf, line, after_line),
        _ => Err(ParseError::new("unknown reply marker", buf)),
    }
}

fn parse_bulk(
    buf: &[u8],
    header: &[u8],
    body_start: usize,
) -> Result<Option<(Reply, usize)>, ParseError> {
    let len = declared_len(header).ok_or_else(|| ParseError::new("malformed bulk length", buf))?;
    let Some(len) = len else {
        return Ok(Some((Reply::Bulk(None), body_start)));
    };

    let body_end = body_start + len;
    if buf.len() < body_end + CRLF.len() {
        return Ok(None);
    }
    if &buf[body_end..body_end + CRLF.len()] != CRLF {
        return Err(ParseError::new("bulk payload is not terminated", &buf[body_start..]));
    }
    let payload = buf[body_start..body_end].to_vec();
    Ok(Some((Reply::Bulk(Some(payload)), body_end + CRLF.len())))
}

fn parse_array(
    buf: &[u8],
    header: &[u8],
    items_start: usize,
) -> Result<Option<(Reply, usize)>, ParseError> {
    let count =
        declared_len(header).ok_or_else(|| ParseError::new("malformed array length", buf))?;
    let Some(count) = count else {
        return Ok(Some((Reply::Bulk(None), items_start)));
    };

    let mut items = Vec::with_capacity(count.min(1024));
    let mut cursor = items_start;
    for _ in 0..count {
        match parse(&buf[cursor..])? {
            Some((item, used)) => {
                items.push(item);
                cursor += used;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((Reply::Array(items), cursor)))
}

fn text(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

fn integer(line: &[u8]) -> Option<i64> {
    std::str::from_utf8(line).ok()?.parse().ok()
}

/// Length header of a bulk or array: `Some(None)` for -1, `None` if malformed
fn declared_len(header: &[u8]) -> Option<Option<usize>> {
    match integer(header)? {
        -1 => Some(None),
        n if (0..=MAX_DECLARED_LEN).contains(&n) => usize::try_from(n).ok().map(Some),
        _ => None,
    }
}
