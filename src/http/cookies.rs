//! Request and response cookies.
//!
//! Request cookies come from the `Cookie` header and are read-only once
//! parsed. Response cookies are collected by handlers and rendered as one
//! `Set-Cookie` header each when the response headers go out.

use std::fmt;
use std::time::SystemTime;

/// A cookie sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestCookie {
    name: String,
    value: String,
}

impl RequestCookie {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// The cookies of one request, parsed from its `Cookie` header.
///
/// # Example
/// ```
/// use portico::http::RequestCookies;
///
/// let cookies = RequestCookies::parse("theme=dark; __sid=abc123");
/// assert_eq!(cookies.get("__sid").map(|c| c.value()), Some("abc123"));
/// assert_eq!(cookies.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCookies {
    cookies: Vec<RequestCookie>,
}

impl RequestCookies {
    /// Parses a `Cookie` header value (`name=value` pairs separated by `;`).
    ///
    /// Pairs without a name are skipped; surrounding double quotes are
    /// stripped from values. The first occurrence of a name wins on lookup.
    pub fn parse(header: &str) -> Self {
        let cookies = header
            .split(';')
            .filter_map(|pair| {
                let (name, value) = match pair.split_once('=') {
                    Some((name, value)) => (name.trim(), value.trim()),
                    None => (pair.trim(), ""),
                };
                if name.is_empty() {
                    return None;
                }
                let value = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(value);
                Some(RequestCookie {
                    name: name.to_string(),
                    value: value.to_string(),
                })
            })
            .collect();

        Self { cookies }
    }

    pub fn get(&self, name: &str) -> Option<&RequestCookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestCookie> {
        self.cookies.iter()
    }
}

/// A cookie to be set on the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseCookie {
    name: String,
    value: String,
    expires: Option<SystemTime>,
    path: Option<String>,
    domain: Option<String>,
    http_only: bool,
    secure: bool,
}

impl ResponseCookie {
    /// Creates a session cookie (no expiry) valid for the whole site.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expires: None,
            path: Some("/".to_string()),
            domain: None,
            http_only: false,
            secure: false,
        }
    }

    pub fn expires(mut self, at: SystemTime) -> Self {
        self.expires = Some(at);
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }
}

/// Renders the `Set-Cookie` header value.
impl fmt::Display for ResponseCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)?;
        if let Some(expires) = self.expires {
            write!(f, "; Expires={}", httpdate::fmt_http_date(expires))?;
        }
        if let Some(path) = &self.path {
            write!(f, "; Path={}", path)?;
        }
        if let Some(domain) = &self.domain {
            write!(f, "; Domain={}", domain)?;
        }
        if self.secure {
            f.write_str("; Secure")?;
        }
        if self.http_only {
            f.write_str("; HttpOnly")?;
        }
        Ok(())
    }
}

/// The cookies a response will set, one per name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseCookies {
    cookies: Vec<ResponseCookie>,
}

impl ResponseCookies {
    /// Adds a cookie, replacing an earlier one with the same name.
    pub fn add(&mut self, cookie: ResponseCookie) {
        match self.cookies.iter_mut().find(|c| c.name == cookie.name) {
            Some(existing) => *existing = cookie,
            None => self.cookies.push(cookie),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ResponseCookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ResponseCookie> {
        self.cookies.iter_mut().find(|c| c.name == name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ResponseCookie> {
        let index = self.cookies.iter().position(|c| c.name == name)?;
        Some(self.cookies.remove(index))
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResponseCookie> {
        self.cookies.iter()
    }
}
