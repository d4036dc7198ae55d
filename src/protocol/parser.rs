//! Resumable HTTP/1.x Request Parser
//!
//! This module implements an incremental parser for HTTP/1.x requests.
//! It never holds on to input: each call looks at the bytes it is given,
//! reports what it recognised as [`ParseEvent`]s and returns how many bytes
//! it consumed. Whatever it did not consume (a partial line) must be handed
//! back on the next call, followed by the newly received bytes.
//!
//! ## How the Parser Works
//!
//! ```text
//!            ┌────────────┐  request line   ┌─────────┐  empty line   ┌──────┐
//!  start ──> │ FirstLine  │ ──────────────> │ Headers │ ────────────> │ Body │
//!            └────────────┘                 └─────────┘               └──────┘
//!                  ▲                             │ no body               │
//!                  └─────────────────────────────┴───────────────────────┘
//!                                 Complete (returns to caller)
//! ```
//!
//! A single call completes at most one request. When it returns in the
//! [`ParserState::FirstLine`] state with bytes left over, the caller is
//! expected to call it again on the remainder: that is how several pipelined
//! requests delivered in one read get processed without another read.
//!
//! Calls return:
//! - `Ok(consumed)` - `consumed` bytes were used, events were appended
//! - `Err(ParseError)` - invalid protocol data, the connection cannot recover

use crate::protocol::types::{is_token_byte, Method, StatusCode, Version};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur while parsing a request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The request line is not `METHOD SP target SP version`
    #[error("invalid request line: {0}")]
    InvalidRequestLine(String),

    /// The method is not a valid token
    #[error("invalid method: {0}")]
    InvalidMethod(String),

    /// Anything other than HTTP/1.0 or HTTP/1.1
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// The request target is neither origin-form, absolute-form nor `*`
    #[error("invalid request target: {0}")]
    InvalidUri(String),

    /// A header line without a colon or with an invalid name
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Content-Length is not a number, or appears twice with different values
    #[error("invalid content length: {0}")]
    InvalidContentLength(String),

    /// Only identity bodies framed by Content-Length are accepted
    #[error("unsupported transfer encoding: {0}")]
    UnsupportedTransferEncoding(String),

    /// The header block carries more fields than allowed
    #[error("too many headers (max: {max})")]
    TooManyHeaders { max: usize },

    /// The declared body is larger than allowed
    #[error("request body too large: {size} bytes (max: {max})")]
    BodyTooLarge { size: u64, max: u64 },
}

impl ParseError {
    /// The status code to answer with before dropping the connection.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Default maximum number of header fields per request
pub const DEFAULT_MAX_HEADERS: usize = 100;

/// Default maximum declared body size (10 MB)
pub const DEFAULT_MAX_BODY_SIZE: u64 = 10 * 1024 * 1024;

/// Limits enforced while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    pub max_headers: usize,
    pub max_body_size: u64,
}

impl Default for ParseLimits {
    fn default() -> Self {
        Self {
            max_headers: DEFAULT_MAX_HEADERS,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// Where the parser currently is within a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Waiting for a request line (between requests)
    FirstLine,
    /// Reading header lines
    Headers,
    /// Reading body bytes, `remaining` still expected
    Body { remaining: u64 },
}

/// Something the parser recognised in the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseEvent {
    RequestLine {
        method: Method,
        uri: String,
        version: Version,
    },
    Header {
        name: String,
        value: String,
    },
    /// The empty line after the last header was seen
    HeadersComplete,
    /// A slice of the body; chunks add up to the declared Content-Length
    Body(Bytes),
    /// The request is complete, the parser is back in `FirstLine`
    Complete,
}

/// The contract between a connection and its request parser.
///
/// Implementations are resumable: state survives between calls, bytes do
/// not. A connection owns exactly one parser for its whole lifetime.
pub trait RequestParser: Send {
    /// Parses as much of `buf` as possible, appending events in order.
    fn parse(&mut self, buf: &[u8], events: &mut Vec<ParseEvent>) -> ParseResult<usize>;

    /// The current state; `FirstLine` means ready for the next request.
    fn state(&self) -> ParserState;

    /// Drops any partial request and returns to `FirstLine`.
    fn reset(&mut self);
}

/// An HTTP/1.0 and HTTP/1.1 request parser.
///
/// # Example
///
/// ```
/// use portico::protocol::{HttpParser, ParseEvent, ParserState, RequestParser};
///
/// let mut parser = HttpParser::new();
/// let mut events = Vec::new();
/// let input = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
///
/// let consumed = parser.parse(input, &mut events).unwrap();
/// assert_eq!(consumed, input.len());
/// assert_eq!(events.last(), Some(&ParseEvent::Complete));
/// assert_eq!(parser.state(), ParserState::FirstLine);
/// ```
#[derive(Debug)]
pub struct HttpParser {
    state: ParserState,
    limits: ParseLimits,
    /// Header fields seen in the current request
    header_count: usize,
    /// Content-Length of the current request, if declared
    content_length: Option<u64>,
}

impl HttpParser {
    /// Creates a parser with default limits.
    pub fn new() -> Self {
        Self::with_limits(ParseLimits::default())
    }

    pub fn with_limits(limits: ParseLimits) -> Self {
        Self {
            state: ParserState::FirstLine,
            limits,
            header_count: 0,
            content_length: None,
        }
    }

    pub fn limits(&self) -> &ParseLimits {
        &self.limits
    }

    fn parse_request_line(&mut self, line: &[u8]) -> ParseResult<ParseEvent> {
        let line = std::str::from_utf8(line)
            .map_err(|_| ParseError::InvalidRequestLine(lossy(line)))?;

        let mut parts = line.split(' ');
        let (method, uri, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(m), Some(u), Some(v), None) if !u.is_empty() => (m, u, v),
            _ => return Err(ParseError::InvalidRequestLine(line.to_string())),
        };

        let method =
            Method::parse(method).ok_or_else(|| ParseError::InvalidMethod(method.to_string()))?;
        let version = Version::parse(version)
            .ok_or_else(|| ParseError::UnsupportedVersion(version.to_string()))?;

        if !is_valid_target(uri) {
            return Err(ParseError::InvalidUri(uri.to_string()));
        }

        self.header_count = 0;
        self.content_length = None;

        Ok(ParseEvent::RequestLine {
            method,
            uri: uri.to_string(),
            version,
        })
    }

    fn parse_header(&mut self, line: &[u8]) -> ParseResult<ParseEvent> {
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| ParseError::InvalidHeader(lossy(line)))?;

        let name = &line[..colon];
        if name.is_empty() || !name.iter().copied().all(is_token_byte) {
            return Err(ParseError::InvalidHeader(lossy(line)));
        }

        self.header_count += 1;
        if self.header_count > self.limits.max_headers {
            return Err(ParseError::TooManyHeaders {
                max: self.limits.max_headers,
            });
        }

        // Names are pure ASCII at this point
        let name = String::from_utf8_lossy(name).into_owned();
        let value = String::from_utf8_lossy(trim_ows(&line[colon + 1..])).into_owned();

        if name.eq_ignore_ascii_case("content-length") {
            let length: u64 = value
                .parse()
                .map_err(|_| ParseError::InvalidContentLength(value.clone()))?;
            match self.content_length {
                Some(previous) if previous != length => {
                    return Err(ParseError::InvalidContentLength(value));
                }
                _ => self.content_length = Some(length),
            }
        } else if name.eq_ignore_ascii_case("transfer-encoding")
            && !value.trim().eq_ignore_ascii_case("identity")
        {
            return Err(ParseError::UnsupportedTransferEncoding(value));
        }

        Ok(ParseEvent::Header { name, value })
    }
}

impl Default for HttpParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser for HttpParser {
    fn parse(&mut self, buf: &[u8], events: &mut Vec<ParseEvent>) -> ParseResult<usize> {
        let mut pos = 0;

        loop {
            match self.state {
                ParserState::FirstLine => {
                    let Some((line_len, terminator)) = find_line(&buf[pos..]) else {
                        return Ok(pos);
                    };
                    let line = &buf[pos..pos + line_len];
                    pos += line_len + terminator;

                    // Robustness: ignore empty lines before a request line
                    if line.is_empty() {
                        continue;
                    }

                    events.push(self.parse_request_line(line)?);
                    self.state = ParserState::Headers;
                }
                ParserState::Headers => {
                    let Some((line_len, terminator)) = find_line(&buf[pos..]) else {
                        return Ok(pos);
                    };
                    let line = &buf[pos..pos + line_len];
                    pos += line_len + terminator;

                    if !line.is_empty() {
                        events.push(self.parse_header(line)?);
                        continue;
                    }

                    events.push(ParseEvent::HeadersComplete);
                    let length = self.content_length.unwrap_or(0);
                    if length > self.limits.max_body_size {
                        return Err(ParseError::BodyTooLarge {
                            size: length,
                            max: self.limits.max_body_size,
                        });
                    }

                    if length == 0 {
                        events.push(ParseEvent::Complete);
                        self.state = ParserState::FirstLine;
                        return Ok(pos);
                    }
                    self.state = ParserState::Body { remaining: length };
                }
                ParserState::Body { remaining } => {
                    let available = (buf.len() - pos) as u64;
                    if available == 0 {
                        return Ok(pos);
                    }

                    let take = remaining.min(available) as usize;
                    events.push(ParseEvent::Body(Bytes::copy_from_slice(
                        &buf[pos..pos + take],
                    )));
                    pos += take;

                    let remaining = remaining - take as u64;
                    if remaining == 0 {
                        events.push(ParseEvent::Complete);
                        self.state = ParserState::FirstLine;
                        return Ok(pos);
                    }
                    self.state = ParserState::Body { remaining };
                }
            }
        }
    }

    fn state(&self) -> ParserState {
        self.state
    }

    fn reset(&mut self) {
        self.state = ParserState::FirstLine;
        self.header_count = 0;
        self.content_length = None;
    }
}

/// Finds the end of the next line.
///
/// Returns the line length (without terminator) and the terminator length
/// (2 for CRLF, 1 for a bare LF), or None if no line end is present yet.
#[inline]
fn find_line(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.iter().position(|&b| b == b'\n')?;
    if lf > 0 && buf[lf - 1] == b'\r' {
        Some((lf - 1, 2))
    } else {
        Some((lf, 1))
    }
}

/// Strips optional whitespace (SP / HTAB) around a header value.
fn trim_ows(value: &[u8]) -> &[u8] {
    let is_ows = |b: &u8| *b == b' ' || *b == b'\t';
    let start = value.iter().position(|b| !is_ows(b)).unwrap_or(value.len());
    let end = value.iter().rposition(|b| !is_ows(b)).map_or(start, |p| p + 1);
    &value[start..end]
}

/// origin-form (`/path?q`), absolute-form (`http://host/path`) or `*`.
fn is_valid_target(uri: &str) -> bool {
    if uri.bytes().any(|b| b <= b' ' || b == 0x7f) {
        return false;
    }
    uri.starts_with('/')
        || uri == "*"
        || uri.starts_with("http://")
        || uri.starts_with("https://")
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Parses every complete request in `buf` with a fresh parser.
///
/// Convenience wrapper used by tests and benchmarks; connections keep their
/// own parser so that state survives between reads.
pub fn parse_all(buf: &[u8]) -> ParseResult<(Vec<ParseEvent>, usize)> {
    let mut parser = HttpParser::new();
    let mut events = Vec::new();
    let mut offset = 0;

    loop {
        let consumed = parser.parse(&buf[offset..], &mut events)?;
        offset += consumed;
        if consumed == 0 || offset == buf.len() || parser.state() != ParserState::FirstLine {
            return Ok((events, offset));
        }
    }
}
