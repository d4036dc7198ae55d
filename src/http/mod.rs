//! HTTP Message Model
//!
//! The values handlers work with: requests assembled by a connection,
//! responses written back through it, and the pieces both are made of.
//!
//! ## Modules
//!
//! - `headers`: case-insensitive multi-valued `HeaderMap`
//! - `cookies`: request cookie parsing and `Set-Cookie` rendering
//! - `form`: decoded form fields and pluggable body decoders
//! - `request`: the `Request` and its builder
//! - `response`: the `Response` with buffered and streamed send modes

pub mod cookies;
pub mod form;
pub mod headers;
pub mod request;
pub mod response;

pub use cookies::{RequestCookie, RequestCookies, ResponseCookie, ResponseCookies};
pub use form::{DecodeError, Form, FormDecoder, FormDecoderProvider, UrlDecoder};
pub use headers::HeaderMap;
pub use request::{BodyOverflow, ConnectionDirective, Request, RequestBuilder};
pub use response::{Response, ResponseError, DEFAULT_CONTENT_TYPE};
