//! The request being assembled from parser events and handed to handlers.

use crate::http::cookies::RequestCookies;
use crate::http::form::Form;
use crate::http::headers::HeaderMap;
use crate::protocol::{Method, Version};
use bytes::BytesMut;
use std::net::SocketAddr;
use thiserror::Error;

/// What should happen to the connection after this exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionDirective {
    #[default]
    KeepAlive,
    Close,
}

/// More body bytes arrived than Content-Length announced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("body exceeds declared content length of {declared} bytes")]
pub struct BodyOverflow {
    pub declared: u64,
}

/// A parsed HTTP request.
///
/// A connection fills one of these from parser events: the request line,
/// then headers, then body chunks. Handlers get it read-only except for the
/// decoded form and cookies the dispatcher attaches.
#[derive(Debug, Clone, Default)]
pub struct Request {
    method: Method,
    uri: String,
    path: String,
    segments: Vec<String>,
    query: Form,
    version: Version,
    headers: HeaderMap,
    content_length: u64,
    connection: ConnectionDirective,
    body: BytesMut,
    form: Option<Form>,
    cookies: RequestCookies,
    remote_addr: Option<SocketAddr>,
    secure: bool,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> RequestBuilder {
        RequestBuilder::new()
    }

    /// Records the request line and splits the target into path, segments
    /// and query parameters.
    pub fn set_request_line(&mut self, method: Method, uri: impl Into<String>, version: Version) {
        self.method = method;
        self.uri = uri.into();
        self.version = version;
        self.connection = if version.keep_alive_by_default() {
            ConnectionDirective::KeepAlive
        } else {
            ConnectionDirective::Close
        };

        // absolute-form: drop scheme and authority
        let target = match self.uri.split_once("://") {
            Some((_, rest)) => rest.find('/').map_or("/", |i| &rest[i..]),
            None => self.uri.as_str(),
        };
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };

        self.path = path.to_string();
        self.segments = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self.query = query
            .map(|q| Form::from_urlencoded(q.as_bytes()))
            .unwrap_or_default();
    }

    /// Derives content length and connection directive once all headers
    /// are known.
    pub fn finish_headers(&mut self) {
        self.content_length = self
            .headers
            .get("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);

        if self.headers.has_token("connection", "close") {
            self.connection = ConnectionDirective::Close;
        } else if self.headers.has_token("connection", "keep-alive") {
            self.connection = ConnectionDirective::KeepAlive;
        }

        if self.content_length > 0 {
            self.body.reserve(self.content_length.min(64 * 1024) as usize);
        }
    }

    /// Appends body bytes. The body never grows past Content-Length.
    pub fn append_body(&mut self, chunk: &[u8]) -> Result<(), BodyOverflow> {
        if self.body.len() as u64 + chunk.len() as u64 > self.content_length {
            return Err(BodyOverflow {
                declared: self.content_length,
            });
        }
        self.body.extend_from_slice(chunk);
        Ok(())
    }

    /// Resets to the default state, keeping allocated capacity so the value
    /// can be reused for the next request on the connection.
    pub fn clear(&mut self) {
        self.method = Method::Get;
        self.uri.clear();
        self.path.clear();
        self.segments.clear();
        self.query = Form::new();
        self.version = Version::Http11;
        self.headers.clear();
        self.content_length = 0;
        self.connection = ConnectionDirective::KeepAlive;
        self.body.clear();
        self.form = None;
        self.cookies = RequestCookies::default();
        self.remote_addr = None;
        self.secure = false;
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request target exactly as received.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The path component, without query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Non-empty path segments: `/a//b/` gives `["a", "b"]`.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Query string parameters.
    pub fn query(&self) -> &Form {
        &self.query
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Returns the first value of a header, ignoring case.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    pub fn connection(&self) -> ConnectionDirective {
        self.connection
    }

    pub fn is_keep_alive(&self) -> bool {
        self.connection == ConnectionDirective::KeepAlive
    }

    /// Whether the client asked for `100 Continue` before sending the body.
    pub fn expects_continue(&self) -> bool {
        self.version == Version::Http11 && self.headers.has_token("expect", "100-continue")
    }

    /// The body received so far; complete once the request is dispatched.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The decoded body, if a decoder accepted its content type.
    pub fn form(&self) -> Option<&Form> {
        self.form.as_ref()
    }

    pub fn set_form(&mut self, form: Form) {
        self.form = Some(form);
    }

    pub fn cookies(&self) -> &RequestCookies {
        &self.cookies
    }

    pub fn set_cookies(&mut self, cookies: RequestCookies) {
        self.cookies = cookies;
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Whether the request arrived over TLS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Records where the request came from and adds the synthesized
    /// `remote_addr` / `remote_port` headers.
    pub fn set_remote(&mut self, addr: SocketAddr, secure: bool) {
        self.remote_addr = Some(addr);
        self.secure = secure;
        self.headers.insert("remote_addr", addr.ip().to_string());
        self.headers.insert("remote_port", addr.port().to_string());
    }
}

/// Builder for constructing requests outside of a connection, mostly for
/// handler tests.
///
/// # Example
/// ```
/// use portico::http::Request;
/// use portico::protocol::Method;
///
/// let request = Request::builder()
///     .method(Method::Post)
///     .uri("/login?next=%2Fhome")
///     .header("Content-Type", "application/x-www-form-urlencoded")
///     .body("user=ada")
///     .build();
///
/// assert_eq!(request.path(), "/login");
/// assert_eq!(request.query().get("next"), Some("/home"));
/// assert_eq!(request.content_length(), 8);
/// ```
#[derive(Debug, Default)]
pub struct RequestBuilder {
    method: Method,
    uri: Option<String>,
    version: Version,
    headers: HeaderMap,
    body: Vec<u8>,
    remote: Option<(SocketAddr, bool)>,
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets the body; Content-Length is set to match.
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn remote(mut self, addr: SocketAddr, secure: bool) -> Self {
        self.remote = Some((addr, secure));
        self
    }

    pub fn build(self) -> Request {
        let mut request = Request::new();
        let uri = self.uri.unwrap_or_else(|| "/".to_string());
        request.set_request_line(self.method, uri, self.version);
        request.headers = self.headers;
        if !self.body.is_empty() {
            request
                .headers
                .insert("Content-Length", self.body.len().to_string());
        }
        request.finish_headers();
        request.body.extend_from_slice(&self.body);
        if let Some((addr, secure)) = self.remote {
            request.set_remote(addr, secure);
        }
        request
    }
}
