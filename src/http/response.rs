//! The response a handler fills in and sends.
//!
//! A response goes out in one of two ways:
//!
//! - **Buffered**: handlers write into the body buffer and [`Response::send`]
//!   emits headers and body in a single frame with an exact Content-Length.
//! - **Streamed**: [`Response::send_headers`] goes first, then any number of
//!   [`Response::send_body`] calls, then [`Response::finish`]. Without a
//!   declared length, HTTP/1.1 uses chunked coding and HTTP/1.0 delimits the
//!   body by closing the connection.
//!
//! Headers go out at most once and the response completes at most once;
//! repeated calls return a [`ResponseError`] instead of writing twice.

use crate::connection::{ConnectionClosed, ConnectionHandle};
use crate::http::cookies::{ResponseCookie, ResponseCookies};
use crate::http::headers::HeaderMap;
use crate::http::request::{ConnectionDirective, Request};
use crate::protocol::{Method, StatusCode, Version};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Write as _;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Headers computed from response fields; copies in `headers()` are ignored.
const MANAGED_HEADERS: [&str; 7] = [
    "date",
    "server",
    "content-type",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
];

pub const DEFAULT_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Errors from sending a response.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ResponseError {
    #[error("headers have already been sent")]
    HeadersAlreadySent,

    #[error("response has already been sent")]
    AlreadySent,

    #[error(transparent)]
    Disconnected(#[from] ConnectionClosed),
}

/// An HTTP response bound to the connection it will be written to.
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    reason: Option<String>,
    version: Version,
    head_only: bool,
    headers: HeaderMap,
    content_type: String,
    content_length: Option<u64>,
    cookies: ResponseCookies,
    body: BytesMut,
    connection: ConnectionDirective,
    keep_alive_timeout: Option<Duration>,
    server_name: String,
    chunked: bool,
    headers_sent: bool,
    sent: bool,
    handle: ConnectionHandle,
}

impl Response {
    /// Creates a `200 OK` response answering `request`.
    ///
    /// Version, HEAD handling and the connection directive follow the
    /// request.
    pub fn new(handle: ConnectionHandle, request: &Request) -> Self {
        Self {
            status: StatusCode::OK,
            reason: None,
            version: request.version(),
            head_only: *request.method() == Method::Head,
            headers: HeaderMap::new(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            content_length: None,
            cookies: ResponseCookies::default(),
            body: BytesMut::new(),
            connection: request.connection(),
            keep_alive_timeout: None,
            server_name: String::new(),
            chunked: false,
            headers_sent: false,
            sent: false,
            handle,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// The reason phrase; the status' standard phrase unless overridden.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .unwrap_or_else(|| self.status.reason_phrase())
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Extra headers. Framing headers (`Content-Length`, `Connection`, ...)
    /// are derived from the response's fields and ignored here.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Sets a header, replacing earlier values.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = content_type.into();
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    /// Declares the body length of a streamed response.
    pub fn set_content_length(&mut self, length: u64) {
        self.content_length = Some(length);
    }

    pub fn cookies(&self) -> &ResponseCookies {
        &self.cookies
    }

    /// Adds a cookie. Cookies can only change until headers are sent.
    pub fn set_cookie(&mut self, cookie: ResponseCookie) -> Result<(), ResponseError> {
        if self.headers_sent {
            return Err(ResponseError::HeadersAlreadySent);
        }
        self.cookies.add(cookie);
        Ok(())
    }

    pub fn connection(&self) -> ConnectionDirective {
        self.connection
    }

    pub fn set_connection(&mut self, connection: ConnectionDirective) {
        self.connection = connection;
    }

    /// Whether the connection should close once this response is out.
    pub fn wants_close(&self) -> bool {
        self.connection == ConnectionDirective::Close
    }

    pub fn set_keep_alive_timeout(&mut self, timeout: Option<Duration>) {
        self.keep_alive_timeout = timeout;
    }

    pub fn set_server_name(&mut self, name: impl Into<String>) {
        self.server_name = name.into();
    }

    /// The buffered body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Appends to the buffered body.
    pub fn write(&mut self, data: impl AsRef<[u8]>) {
        self.body.extend_from_slice(data.as_ref());
    }

    /// Replaces the buffered body.
    pub fn set_body(&mut self, data: impl AsRef<[u8]>) {
        self.body.clear();
        self.body.extend_from_slice(data.as_ref());
    }

    pub fn clear_body(&mut self) {
        self.body.clear();
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    pub fn connection_handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Turns this into a `302 Found` pointing at `location`.
    pub fn redirect(&mut self, location: impl Into<String>) {
        self.status = StatusCode::FOUND;
        self.headers.insert("Location", location);
    }

    /// Sends the status line and headers of a streamed response.
    pub fn send_headers(&mut self) -> Result<(), ResponseError> {
        if self.headers_sent {
            return Err(ResponseError::HeadersAlreadySent);
        }

        let may_have_body = !self.status.forbids_body();
        if may_have_body && self.content_length.is_none() {
            match self.version {
                Version::Http11 => self.chunked = true,
                Version::Http10 => self.connection = ConnectionDirective::Close,
            }
        }

        let head = self.render_head(self.content_length);
        self.headers_sent = true;
        self.handle.send(head)?;
        Ok(())
    }

    /// Streams a piece of the body, sending headers first if needed.
    pub fn send_body(&mut self, data: impl AsRef<[u8]>) -> Result<(), ResponseError> {
        if self.sent {
            return Err(ResponseError::AlreadySent);
        }
        if !self.headers_sent {
            self.send_headers()?;
        }

        let data = data.as_ref();
        if data.is_empty() || self.head_only || self.status.forbids_body() {
            return Ok(());
        }

        if self.chunked {
            let mut frame = BytesMut::with_capacity(data.len() + 12);
            frame.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
            frame.put_slice(data);
            frame.put_slice(b"\r\n");
            self.handle.send(frame.freeze())?;
        } else {
            self.handle.send(Bytes::copy_from_slice(data))?;
        }
        Ok(())
    }

    /// Completes a streamed response.
    pub fn finish(&mut self) -> Result<(), ResponseError> {
        if self.sent {
            return Err(ResponseError::AlreadySent);
        }
        if !self.headers_sent {
            self.send_headers()?;
        }
        self.sent = true;
        if self.chunked && !self.head_only {
            self.handle.send(Bytes::from_static(b"0\r\n\r\n"))?;
        }
        Ok(())
    }

    /// Sends headers and the buffered body in one frame.
    ///
    /// # Example
    /// ```
    /// use portico::connection::{ConnectionHandle, ConnectionInfo, Outbound};
    /// use portico::http::{Request, Response};
    ///
    /// let info = ConnectionInfo::new(1, "127.0.0.1:40000".parse().unwrap(), false);
    /// let (handle, mut rx) = ConnectionHandle::pair(info);
    /// let request = Request::builder().uri("/").build();
    ///
    /// let mut response = Response::new(handle, &request);
    /// response.write("hello");
    /// response.send().unwrap();
    ///
    /// assert!(response.send().is_err());
    /// let Outbound::Data(frame) = rx.try_recv().unwrap() else { unreachable!() };
    /// assert!(frame.starts_with(b"HTTP/1.1 200 OK\r\n"));
    /// assert!(frame.ends_with(b"\r\n\r\nhello"));
    /// ```
    pub fn send(&mut self) -> Result<(), ResponseError> {
        if self.sent {
            return Err(ResponseError::AlreadySent);
        }
        if self.headers_sent {
            return Err(ResponseError::HeadersAlreadySent);
        }

        let with_body = !self.status.forbids_body();
        let length = with_body.then_some(self.body.len() as u64);
        let head = self.render_head(length);

        let mut frame = BytesMut::from(&head[..]);
        if with_body && !self.head_only {
            frame.put_slice(&self.body);
        }

        self.headers_sent = true;
        self.sent = true;
        self.handle.send(frame.freeze())?;
        Ok(())
    }

    fn render_head(&self, content_length: Option<u64>) -> Bytes {
        let mut head = String::with_capacity(256);
        let _ = write!(
            head,
            "{} {} {}\r\n",
            self.version,
            self.status.as_u16(),
            self.reason()
        );
        let _ = write!(head, "Date: {}\r\n", httpdate::fmt_http_date(SystemTime::now()));
        if !self.server_name.is_empty() {
            let _ = write!(head, "Server: {}\r\n", self.server_name);
        }

        if !self.status.forbids_body() {
            let _ = write!(head, "Content-Type: {}\r\n", self.content_type);
            match content_length {
                Some(length) => {
                    let _ = write!(head, "Content-Length: {}\r\n", length);
                }
                None if self.chunked => head.push_str("Transfer-Encoding: chunked\r\n"),
                None => {}
            }
        }

        match self.connection {
            ConnectionDirective::Close => head.push_str("Connection: close\r\n"),
            ConnectionDirective::KeepAlive => {
                head.push_str("Connection: keep-alive\r\n");
                if let Some(timeout) = self.keep_alive_timeout {
                    let _ = write!(head, "Keep-Alive: timeout={}\r\n", timeout.as_secs());
                }
            }
        }

        for (name, value) in self.headers.iter() {
            if MANAGED_HEADERS.iter().any(|m| name.eq_ignore_ascii_case(m)) {
                continue;
            }
            let _ = write!(head, "{}: {}\r\n", name, value);
        }
        for cookie in self.cookies.iter() {
            let _ = write!(head, "Set-Cookie: {}\r\n", cookie);
        }
        head.push_str("\r\n");

        Bytes::from(head)
    }
}
