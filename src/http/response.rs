//! Responses built by handlers and by the server itself.
//!
//! A [`Response`] carries status, headers and an optional buffered body.
//! The connection picks the [`Framing`] and writes the head;
//! [`Response::into_bytes`] covers the fixed-length case.

use std::borrow::Cow;
use std::time::SystemTime;

use bytes::{BufMut, BytesMut};

use super::{Headers, StatusCode, status_forbids_body};

/// How the body following a response head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `Content-Length: n`.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// No length; the body ends when the connection closes.
    UntilClose,
}

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use wharf::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    reason: Cow<'static, str>,
    headers: Headers,
    body: Vec<u8>,
    keep_alive: bool,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self::from_code(status.as_u16(), status.canonical_reason())
    }

    /// Creates a response for an arbitrary numeric code, as CGI scripts may
    /// return codes we have no variant for.
    pub fn from_code(status: u16, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Headers::new(),
            body: Vec::new(),
            keep_alive: true,
        }
    }

    /// The plain-text error page the server sends on its own behalf.
    pub fn error(status: StatusCode) -> Self {
        let body = if status.forbids_body() {
            String::new()
        } else {
            format!("Error {}: {}\n", status.as_u16(), status.canonical_reason())
        };
        Self::new(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body)
    }

    /// Adds a header; repeated names are kept.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// [`header`](Self::header) on a borrowed response.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    /// Text body. `Content-Length` is derived when the head is written.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into().into_bytes();
        self
    }

    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Requests `Connection: close` regardless of what the client asked for.
    /// Setting `true` never overrides the server's own keep-alive decision.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body_ref(&self) -> &[u8] {
        &self.body
    }

    /// Whether the response itself allows the connection to stay open.
    pub fn wants_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub(crate) fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Serializes the status line and headers for the given framing.
    ///
    /// Adds, unless the caller already set them:
    /// - `Date` (IMF-fixdate).
    /// - `Content-Type: text/plain; charset=utf-8` for a non-empty fixed body.
    /// - `Content-Length` or `Transfer-Encoding: chunked` as `framing` says;
    ///   neither for 1xx, 204 and 304.
    /// - `Connection: keep-alive` or `Connection: close`.
    pub fn head_bytes(&self, framing: Framing, keep_alive: bool) -> BytesMut {
        let mut buf = BytesMut::with_capacity(128 + self.headers.len() * 64);
        buf.put(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());

        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        if !self.headers.contains("date") {
            let date = httpdate::fmt_http_date(SystemTime::now());
            buf.put(format!("Date: {date}\r\n").as_bytes());
        }

        if !status_forbids_body(self.status) {
            match framing {
                Framing::Length(n) => {
                    if n > 0 && !self.headers.contains("content-type") {
                        buf.put(&b"Content-Type: text/plain; charset=utf-8\r\n"[..]);
                    }
                    if !self.headers.contains("content-length") {
                        buf.put(format!("Content-Length: {n}\r\n").as_bytes());
                    }
                }
                Framing::Chunked => buf.put(&b"Transfer-Encoding: chunked\r\n"[..]),
                Framing::UntilClose => {}
            }
        }

        if !self.headers.contains("connection") {
            let connection = if keep_alive { "keep-alive" } else { "close" };
            buf.put(format!("Connection: {connection}\r\n").as_bytes());
        }

        buf.put(&b"\r\n"[..]);
        buf
    }

    /// Serializes the full response with a `Content-Length` body.
    pub fn into_bytes(self) -> BytesMut {
        let framing = Framing::Length(self.body.len() as u64);
        let mut buf = self.head_bytes(framing, self.keep_alive);
        if !status_forbids_body(self.status) {
            buf.put(self.body.as_slice());
        }
        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
