//! HTTP/1.x Protocol Types
//!
//! This module defines the small vocabulary shared by the parser, the
//! request/response model and the dispatcher: request methods, protocol
//! versions and status codes.
//!
//! ## Wire Format
//!
//! ```text
//! GET /index.html?lang=en HTTP/1.1\r\n      <- request line
//! Host: example.com\r\n                     <- header
//! \r\n                                      <- end of header block
//!
//! HTTP/1.1 200 OK\r\n                       <- status line
//! Content-Length: 5\r\n
//! \r\n
//! hello                                     <- body
//! ```

use std::fmt;

/// The CRLF terminator used by HTTP/1.x framing
pub const CRLF: &[u8] = b"\r\n";

/// HTTP request methods.
///
/// Known methods get their own variant; anything else that is a valid
/// token is kept as an extension method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
    Trace,
    Connect,
    /// Any other token, kept verbatim
    Extension(String),
}

impl Method {
    /// Parses a method token. Methods are case-sensitive.
    ///
    /// Returns `None` if the token contains characters that are not
    /// allowed in an HTTP token.
    ///
    /// # Example
    /// ```
    /// use portico::protocol::Method;
    /// assert_eq!(Method::parse("GET"), Some(Method::Get));
    /// assert_eq!(Method::parse("PURGE"), Some(Method::Extension("PURGE".into())));
    /// assert_eq!(Method::parse("G(T"), None);
    /// ```
    pub fn parse(token: &str) -> Option<Self> {
        let method = match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            "PATCH" => Method::Patch,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            other => {
                if other.is_empty() || !other.bytes().all(is_token_byte) {
                    return None;
                }
                Method::Extension(other.to_string())
            }
        };
        Some(method)
    }

    /// Returns the method as it appears on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Extension(token) => token,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP protocol version. Only the 1.x family is spoken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

impl Version {
    /// Parses `HTTP/1.0` or `HTTP/1.1`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HTTP/1.1" => Some(Version::Http11),
            "HTTP/1.0" => Some(Version::Http10),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }

    /// Whether connections stay open unless told otherwise.
    pub fn keep_alive_by_default(&self) -> bool {
        matches!(self, Version::Http11)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An HTTP status code.
///
/// Any three digit code can be represented; the associated constants cover
/// the codes the server emits itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(u16);

impl StatusCode {
    pub const CONTINUE: StatusCode = StatusCode(100);
    pub const OK: StatusCode = StatusCode(200);
    pub const CREATED: StatusCode = StatusCode(201);
    pub const NO_CONTENT: StatusCode = StatusCode(204);
    pub const MOVED_PERMANENTLY: StatusCode = StatusCode(301);
    pub const FOUND: StatusCode = StatusCode(302);
    pub const NOT_MODIFIED: StatusCode = StatusCode(304);
    pub const BAD_REQUEST: StatusCode = StatusCode(400);
    pub const UNAUTHORIZED: StatusCode = StatusCode(401);
    pub const FORBIDDEN: StatusCode = StatusCode(403);
    pub const NOT_FOUND: StatusCode = StatusCode(404);
    pub const METHOD_NOT_ALLOWED: StatusCode = StatusCode(405);
    pub const PAYLOAD_TOO_LARGE: StatusCode = StatusCode(413);
    pub const INTERNAL_SERVER_ERROR: StatusCode = StatusCode(500);
    pub const SERVICE_UNAVAILABLE: StatusCode = StatusCode(503);

    /// Creates a status code from its numeric value.
    ///
    /// Returns `None` outside of 100..=999.
    pub fn from_u16(code: u16) -> Option<Self> {
        (100..=999).contains(&code).then_some(StatusCode(code))
    }

    /// Returns the numeric HTTP status code.
    ///
    /// # Example
    /// ```
    /// use portico::protocol::StatusCode;
    /// assert_eq!(StatusCode::NOT_FOUND.as_u16(), 404);
    /// ```
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns the standard reason phrase, or `"Unknown"` for codes
    /// without one.
    pub fn reason_phrase(&self) -> &'static str {
        match self.0 {
            100 => "Continue",
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            413 => "Payload Too Large",
            500 => "Internal Server Error",
            503 => "Service Unavailable",
            _ => "Unknown",
        }
    }

    /// 1xx responses carry no body and do not end the exchange.
    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.0)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.0)
    }

    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.0)
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.0)
    }

    /// Statuses that never carry a body (RFC 9110 section 6.4.1).
    pub fn forbids_body(&self) -> bool {
        self.is_informational() || self.0 == 204 || self.0 == 304
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode::OK
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.0, self.reason_phrase())
    }
}

/// Returns true for bytes allowed in an HTTP token (RFC 9110 section 5.6.2).
#[inline]
pub fn is_token_byte(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse_known_and_extension() {
        assert_eq!(Method::parse("POST"), Some(Method::Post));
        assert_eq!(Method::parse("HEAD"), Some(Method::Head));
        assert_eq!(
            Method::parse("PROPFIND"),
            Some(Method::Extension("PROPFIND".to_string()))
        );
        assert_eq!(Method::parse(""), None);
        assert_eq!(Method::parse("GE T"), None);
    }

    #[test]
    fn test_method_is_case_sensitive() {
        // lowercase "get" is a valid token but not the GET method
        assert_eq!(
            Method::parse("get"),
            Some(Method::Extension("get".to_string()))
        );
    }

    #[test]
    fn test_version_parse() {
        assert_eq!(Version::parse("HTTP/1.1"), Some(Version::Http11));
        assert_eq!(Version::parse("HTTP/1.0"), Some(Version::Http10));
        assert_eq!(Version::parse("HTTP/2.0"), None);
        assert!(Version::Http11.keep_alive_by_default());
        assert!(!Version::Http10.keep_alive_by_default());
    }

    #[test]
    fn test_status_reason_phrases() {
        assert_eq!(StatusCode::CONTINUE.reason_phrase(), "Continue");
        assert_eq!(StatusCode::FOUND.reason_phrase(), "Found");
        assert_eq!(
            StatusCode::SERVICE_UNAVAILABLE.reason_phrase(),
            "Service Unavailable"
        );
        assert_eq!(StatusCode::from_u16(299).unwrap().reason_phrase(), "Unknown");
        assert_eq!(StatusCode::NOT_FOUND.to_string(), "404 Not Found");
    }

    #[test]
    fn test_status_classes() {
        assert!(StatusCode::CONTINUE.is_informational());
        assert!(StatusCode::NO_CONTENT.forbids_body());
        assert!(!StatusCode::OK.forbids_body());
        assert!(StatusCode::UNAUTHORIZED.is_client_error());
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_server_error());
        assert_eq!(StatusCode::from_u16(42), None);
    }
}
