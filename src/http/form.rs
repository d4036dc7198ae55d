//! Decoded form input and the decoders that produce it.
//!
//! Request bodies are decoded by whichever registered [`FormDecoder`]
//! accepts the request's content type. Only URL-encoded bodies are decoded
//! out of the box; multipart or XML decoders plug in through the same trait.

use thiserror::Error;

/// Errors that can occur while decoding a request body.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The body does not match the format its content type announces
    #[error("invalid form data: {0}")]
    InvalidData(String),

    /// The charset parameter names an encoding the decoder cannot handle
    #[error("unsupported charset: {0}")]
    UnsupportedCharset(String),
}

/// Multi-valued form fields, in the order they appeared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Form {
    fields: Vec<(String, String)>,
}

impl Form {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a form from `application/x-www-form-urlencoded` text.
    ///
    /// # Example
    /// ```
    /// use portico::http::Form;
    ///
    /// let form = Form::from_urlencoded(b"name=Ada+Lovelace&tag=a&tag=b");
    /// assert_eq!(form.get("name"), Some("Ada Lovelace"));
    /// assert_eq!(form.get_all("tag").count(), 2);
    /// ```
    pub fn from_urlencoded(input: &[u8]) -> Self {
        Self {
            fields: url::form_urlencoded::parse(input)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
        }
    }

    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Returns the first value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Turns a request body of some content type into a [`Form`].
pub trait FormDecoder: Send + Sync {
    /// Whether this decoder handles `content_type` (media type only, no
    /// parameters, lowercase).
    fn can_decode(&self, content_type: &str) -> bool;

    /// Decodes `body`. `charset` is the content type's charset parameter.
    fn decode(
        &self,
        content_type: &str,
        body: &[u8],
        charset: Option<&str>,
    ) -> Result<Form, DecodeError>;
}

/// Decoder for `application/x-www-form-urlencoded` bodies.
#[derive(Debug, Default, Clone, Copy)]
pub struct UrlDecoder;

impl FormDecoder for UrlDecoder {
    fn can_decode(&self, content_type: &str) -> bool {
        content_type == "application/x-www-form-urlencoded"
    }

    fn decode(
        &self,
        _content_type: &str,
        body: &[u8],
        charset: Option<&str>,
    ) -> Result<Form, DecodeError> {
        match charset {
            None => {}
            Some(cs) if cs.eq_ignore_ascii_case("utf-8") || cs.eq_ignore_ascii_case("us-ascii") => {}
            Some(cs) => return Err(DecodeError::UnsupportedCharset(cs.to_string())),
        }
        if std::str::from_utf8(body).is_err() {
            return Err(DecodeError::InvalidData(
                "url-encoded body is not valid UTF-8".to_string(),
            ));
        }
        Ok(Form::from_urlencoded(body))
    }
}

/// The set of decoders a server consults, in registration order.
#[derive(Default)]
pub struct FormDecoderProvider {
    decoders: Vec<Box<dyn FormDecoder>>,
}

impl FormDecoderProvider {
    /// An empty provider: no body is decoded.
    pub fn new() -> Self {
        Self::default()
    }

    /// A provider with the built-in decoders registered.
    pub fn with_defaults() -> Self {
        let mut provider = Self::new();
        provider.add(UrlDecoder);
        provider
    }

    pub fn add(&mut self, decoder: impl FormDecoder + 'static) {
        self.decoders.push(Box::new(decoder));
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decodes `body` using the first decoder accepting `content_type`.
    ///
    /// Returns `Ok(None)` if no decoder is registered for the type.
    pub fn decode(&self, content_type: &str, body: &[u8]) -> Result<Option<Form>, DecodeError> {
        let (media_type, charset) = split_content_type(content_type);

        match self.decoders.iter().find(|d| d.can_decode(&media_type)) {
            Some(decoder) => decoder
                .decode(&media_type, body, charset.as_deref())
                .map(Some),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for FormDecoderProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormDecoderProvider")
            .field("decoders", &self.decoders.len())
            .finish()
    }
}

/// Splits `text/html; charset=UTF-8` into `("text/html", Some("UTF-8"))`.
fn split_content_type(content_type: &str) -> (String, Option<String>) {
    let mut parts = content_type.split(';');
    let media_type = parts.next().unwrap_or("").trim().to_ascii_lowercase();
    let charset = parts.find_map(|p| {
        let (key, value) = p.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| value.trim().trim_matches('"').to_string())
    });
    (media_type, charset)
}
