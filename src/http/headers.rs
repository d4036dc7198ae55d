//! Case-insensitive, multi-valued header storage.

/// An ordered collection of header fields.
///
/// Lookups ignore ASCII case; a name may carry several values, kept in the
/// order they were added. Names keep the spelling they were added with so
/// responses go out the way handlers wrote them.
///
/// # Example
/// ```
/// use portico::http::HeaderMap;
///
/// let mut headers = HeaderMap::new();
/// headers.append("Accept", "text/html");
/// headers.append("accept", "application/json");
///
/// assert_eq!(headers.get("ACCEPT"), Some("text/html"));
/// assert_eq!(headers.get_all("Accept").count(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the first value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns every value for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Adds a value, keeping any existing values for the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every value for `name` with a single value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.entries.push((name, value.into()));
    }

    /// Removes every value for `name`, returning how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    /// Number of header fields (a name with two values counts twice).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes all fields but keeps the allocation.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Whether any comma-separated element of any `name` value equals
    /// `token`, ignoring case. Used for `Connection` and `Expect`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut headers = HeaderMap::new();
        headers.append("Content-Type", "text/plain");

        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert!(headers.contains("CONTENT-TYPE"));
        assert_eq!(headers.get("content-length"), None);
    }

    #[test]
    fn test_insert_replaces_all_values() {
        let mut headers = HeaderMap::new();
        headers.append("X-Tag", "a");
        headers.append("x-tag", "b");
        headers.insert("X-TAG", "c");

        assert_eq!(headers.get_all("x-tag").collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_remove_returns_count() {
        let mut headers = HeaderMap::new();
        headers.append("Cookie", "a=1");
        headers.append("Cookie", "b=2");
        headers.append("Host", "x");

        assert_eq!(headers.remove("cookie"), 2);
        assert_eq!(headers.remove("cookie"), 0);
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_has_token() {
        let mut headers = HeaderMap::new();
        headers.append("Connection", "keep-alive, Upgrade");

        assert!(headers.has_token("connection", "upgrade"));
        assert!(headers.has_token("connection", "Keep-Alive"));
        assert!(!headers.has_token("connection", "close"));
    }
}
