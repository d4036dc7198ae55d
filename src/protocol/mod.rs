//! HTTP/1.x Protocol Implementation
//!
//! This module provides the wire-level vocabulary and the request parser.
//!
//! ## Modules
//!
//! - `types`: `Method`, `Version` and `StatusCode`
//! - `parser`: the resumable request parser and its event contract
//!
//! ## Example
//!
//! ```
//! use portico::protocol::{HttpParser, ParseEvent, RequestParser};
//!
//! let mut parser = HttpParser::new();
//! let mut events = Vec::new();
//! let consumed = parser
//!     .parse(b"GET /status HTTP/1.1\r\nHost: x\r\n\r\n", &mut events)
//!     .unwrap();
//!
//! assert_eq!(consumed, 33);
//! assert!(matches!(events[0], ParseEvent::RequestLine { .. }));
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{
    parse_all, HttpParser, ParseError, ParseEvent, ParseLimits, ParseResult, ParserState,
    RequestParser,
};
pub use types::{Method, StatusCode, Version, CRLF};
