//! Header fields of a request or response.
//!
//! Field order is kept as received and names compare ASCII
//! case-insensitively. A name that appears twice stays two fields: CGI
//! joins them, `Content-Length` checks them for agreement, and everything
//! else reads the first.

/// One `name: value` line.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    name: String,
    value: String,
}

impl Field {
    fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Ordered header fields with case-insensitive lookup.
///
/// ```
/// use wharf::http::Headers;
///
/// let mut headers = Headers::new();
/// headers.insert("Accept-Encoding", "gzip");
/// headers.insert("X-Trace", "a");
/// headers.insert("x-trace", "b");
///
/// assert_eq!(headers.get("ACCEPT-ENCODING"), Some("gzip"));
/// assert_eq!(headers.get_all("X-Trace").collect::<Vec<_>>(), ["a", "b"]);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<Field>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    /// Appends a field, keeping any earlier field of the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push(Field {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Drops every field named `name`, then appends one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.insert(name, value);
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|field| field.is(name))
            .map(|field| field.value.as_str())
    }

    /// Every value of `name`, in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |field| field.is(name))
            .map(|field| field.value.as_str())
    }

    /// `true` if some value of `name`, read as a comma list, holds `token`.
    ///
    /// ```
    /// use wharf::http::Headers;
    ///
    /// let mut h = Headers::new();
    /// h.insert("Connection", "keep-alive, Upgrade");
    /// assert!(h.has_token("connection", "upgrade"));
    /// assert!(!h.has_token("connection", "close"));
    /// ```
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).any(|value| value_has_token(value, token))
    }

    /// `true` if anything was removed.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.fields.len();
        self.fields.retain(|field| !field.is(name));
        self.fields.len() != before
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|field| field.is(name))
    }

    /// Number of fields, counting repeats.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|field| (field.name.as_str(), field.value.as_str()))
    }
}

/// Comma list membership for `Connection`, `Upgrade` and
/// `Accept-Encoding`. Parameters after `;` are ignored.
pub fn value_has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .filter_map(|item| item.split(';').next())
        .any(|item| item.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        let mut h = Headers::new();
        h.insert("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(h.get("content-length"), None);
    }

    #[test]
    fn repeated_names_stay_separate_and_ordered() {
        let mut h = Headers::new();
        h.insert("Content-Length", "5");
        h.insert("Host", "x");
        h.insert("content-length", "5");
        assert_eq!(h.get_all("Content-Length").collect::<Vec<_>>(), ["5", "5"]);
        assert_eq!(h.len(), 3);
        assert_eq!(
            h.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            ["Content-Length", "Host", "content-length"]
        );
    }

    #[test]
    fn set_collapses_repeats() {
        let mut h = Headers::new();
        h.insert("Connection", "keep-alive");
        h.insert("connection", "upgrade");
        h.set("Connection", "close");
        assert_eq!(h.get_all("connection").collect::<Vec<_>>(), ["close"]);
    }

    #[test]
    fn remove_reports_whether_anything_went() {
        let mut h = Headers::new();
        h.insert("Expect", "100-continue");
        assert!(h.remove("expect"));
        assert!(h.is_empty());
        assert!(!h.remove("expect"));
    }

    #[test]
    fn token_lists_ignore_parameters_and_spacing() {
        assert!(value_has_token("gzip;q=1.0, deflate", "gzip"));
        assert!(value_has_token(" Keep-Alive ", "keep-alive"));
        assert!(!value_has_token("gzipped", "gzip"));
        assert!(!value_has_token("", "close"));
    }
}
