//! HTTP/1.x request-head parsing.
//!
//! Everything here is pure and re-entrant: functions take a byte slice and
//! never perform I/O. Header lines are split with [`httparse`]; the request
//! line, method whitelist and version rules are enforced here.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str;

use thiserror::Error;

use super::url;
use super::{Headers, Method, StatusCode, Version};
use crate::connection::PeerInfo;

/// Maximum number of header lines accepted in one request head.
pub const MAX_HEADERS: usize = 64;

/// Errors produced while parsing a request head.
///
/// Every variant maps to the status the client should see via
/// [`ParseError::status`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("request head is incomplete, more data needed")]
    Incomplete,

    #[error("request head contains illegal bytes")]
    Malformed,

    #[error("malformed request line")]
    InvalidRequestLine,

    #[error("unsupported request method: {0}")]
    UnsupportedMethod(String),

    #[error("invalid request target")]
    InvalidUri,

    #[error("invalid HTTP version")]
    InvalidVersion,

    #[error("unsupported HTTP version: {0}")]
    UnsupportedVersion(String),

    #[error("invalid header line")]
    InvalidHeader,

    #[error("more than 64 header lines")]
    TooManyHeaders,

    #[error("invalid Content-Length")]
    InvalidContentLength,

    #[error("both Content-Length and Transfer-Encoding present")]
    ConflictingLength,

    #[error("unsupported transfer coding: {0}")]
    UnsupportedTransferEncoding(String),
}

impl ParseError {
    /// The status code used when replying to a request that failed this way.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedMethod(_) => StatusCode::MethodNotAllowed,
            Self::UnsupportedVersion(_) => StatusCode::HttpVersionNotSupported,
            Self::UnsupportedTransferEncoding(_) => StatusCode::NotImplemented,
            _ => StatusCode::BadRequest,
        }
    }
}

/// Result of scanning a buffer for the end of a message head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadStatus {
    /// The head ends after this many bytes (terminator included).
    Complete(usize),
    /// No terminator yet; read more.
    Partial,
    /// A control byte was found; the message can be rejected immediately.
    Invalid,
}

/// Scans `buf` for the blank line ending a message head.
///
/// Accepts the standard `\r\n\r\n` terminator and tolerates a bare `\n\n`.
/// Any non-printable byte below `0x80` other than CR and LF aborts the scan
/// with [`HeadStatus::Invalid`], so binary garbage is rejected without
/// waiting for a terminator that may never come.
///
/// ```
/// use wharf::http::request::{find_header_end, HeadStatus};
///
/// assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n\r\n"), HeadStatus::Complete(18));
/// assert_eq!(find_header_end(b"GET / HTTP/1.1\n\n"), HeadStatus::Complete(16));
/// assert_eq!(find_header_end(b"GET / HTTP/1.1\r\n"), HeadStatus::Partial);
/// assert_eq!(find_header_end(b"GET /\x01 HTTP/1.1"), HeadStatus::Invalid);
/// ```
pub fn find_header_end(buf: &[u8]) -> HeadStatus {
    for (i, &c) in buf.iter().enumerate() {
        if c < 0x80 && c != b'\r' && c != b'\n' && !(0x20..0x7f).contains(&c) {
            return HeadStatus::Invalid;
        }
        if c == b'\n' && buf.get(i + 1) == Some(&b'\n') {
            return HeadStatus::Complete(i + 2);
        }
        if c == b'\r' && buf[i..].starts_with(b"\r\n\r\n") {
            return HeadStatus::Complete(i + 4);
        }
    }
    HeadStatus::Partial
}

/// Number of leading whitespace bytes (stray CRLFs between pipelined
/// requests) before the request line.
pub fn leading_whitespace(buf: &[u8]) -> usize {
    buf.iter().take_while(|b| b.is_ascii_whitespace()).count()
}

/// Like [`find_header_end`] but skips leading whitespace first; a complete
/// length includes the skipped bytes.
pub fn request_head_len(buf: &[u8]) -> HeadStatus {
    let skip = leading_whitespace(buf);
    match find_header_end(&buf[skip..]) {
        HeadStatus::Complete(n) => HeadStatus::Complete(skip + n),
        other => other,
    }
}

/// Strict base-10 parsing for `Content-Length`: digits only, no sign, no
/// surrounding garbage, no overflow.
pub fn parse_content_length(value: &str) -> Option<u64> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.bytes().try_fold(0u64, |acc, b| {
        acc.checked_mul(10)?.checked_add(u64::from(b - b'0'))
    })
}

/// A parsed request head: request line plus header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Method,
    /// Request target exactly as received.
    pub uri: String,
    pub version: Version,
    pub headers: Headers,
    /// Bytes the head occupied in the input buffer, leading whitespace and
    /// terminator included.
    pub len: usize,
}

/// Parses one request head from the start of `buf`.
///
/// # Errors
///
/// - [`ParseError::Incomplete`]: the head terminator has not arrived yet.
/// - [`ParseError::Malformed`]: illegal bytes in the head.
/// - any other variant: the head is complete but invalid.
pub fn parse_request(buf: &[u8]) -> Result<RequestHead, ParseError> {
    let skip = leading_whitespace(buf);
    let rest = &buf[skip..];
    let head_len = match find_header_end(rest) {
        HeadStatus::Complete(n) => n,
        HeadStatus::Partial => return Err(ParseError::Incomplete),
        HeadStatus::Invalid => return Err(ParseError::Malformed),
    };
    let head = &rest[..head_len];

    let line_end = head
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(ParseError::InvalidRequestLine)?;
    let line = head[..line_end].strip_suffix(b"\r").unwrap_or(&head[..line_end]);
    let line = str::from_utf8(line).map_err(|_| ParseError::InvalidRequestLine)?;

    let mut parts = line.split_ascii_whitespace();
    let (Some(method), Some(uri), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::InvalidRequestLine);
    };

    let method: Method = method.parse()?;
    let version: Version = version.parse()?;
    local_target(uri, method)?;

    let headers = parse_header_block(&head[line_end + 1..])?;

    Ok(RequestHead {
        method,
        uri: uri.to_owned(),
        version,
        headers,
        len: skip + head_len,
    })
}

/// Splits a header block (everything after the request or status line, up to
/// and including the blank line) into ordered entries.
pub fn parse_header_block(block: &[u8]) -> Result<Headers, ParseError> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let parsed = match httparse::parse_headers(block, &mut raw) {
        Ok(httparse::Status::Complete((_, parsed))) => parsed,
        Ok(httparse::Status::Partial) => return Err(ParseError::Incomplete),
        Err(httparse::Error::TooManyHeaders) => return Err(ParseError::TooManyHeaders),
        Err(_) => return Err(ParseError::InvalidHeader),
    };

    let mut headers = Headers::with_capacity(parsed.len());
    for header in parsed {
        headers.insert(header.name, String::from_utf8_lossy(header.value).trim());
    }
    Ok(headers)
}

/// Reduces a request target to the server-local form.
///
/// Origin-form (`/path`) is returned as is, absolute-form
/// (`http://host/path`) loses its scheme and authority, `*` is kept for
/// `OPTIONS`, and authority-form is only legal for `CONNECT`.
pub fn local_target(uri: &str, method: Method) -> Result<&str, ParseError> {
    if uri.starts_with('/') || uri == "*" {
        return Ok(uri);
    }
    for scheme in ["http://", "https://"] {
        let Some(prefix) = uri.get(..scheme.len()) else {
            continue;
        };
        if prefix.eq_ignore_ascii_case(scheme) {
            let after = &uri[scheme.len()..];
            return Ok(after.find('/').map_or("/", |i| &after[i..]));
        }
    }
    if method == Method::Connect && !uri.is_empty() {
        return Ok(uri);
    }
    Err(ParseError::InvalidUri)
}

/// A request as handlers see it.
///
/// Created by the dispatcher from a [`RequestHead`] and the connection's
/// peer information; the body is read separately through the
/// [`Exchange`](crate::dispatch::Exchange).
///
/// # Examples
///
/// ```
/// use wharf::http::request::Request;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.query_param("name"), Some("world"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    method: Method,
    uri: String,
    local_uri: String,
    version: Version,
    headers: Headers,
    query: Option<String>,
    params: HashMap<String, String>,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    is_secure: bool,
    handler_pattern: Option<String>,
}

impl Request {
    /// Builds a request from a parsed head and the peer it arrived from.
    ///
    /// The local URI starts out as the undecoded path; the dispatcher
    /// replaces it once decoding and dot-segment removal have run.
    pub fn from_head(head: RequestHead, peer: &PeerInfo) -> Self {
        let target = local_target(&head.uri, head.method)
            .unwrap_or("/")
            .to_owned();
        let (path, query) = url::split_query(&target);
        let query = query.map(str::to_owned);
        let params = query
            .as_deref()
            .map(url::parse_query)
            .unwrap_or_default()
            .into_iter()
            .collect();
        Self {
            method: head.method,
            local_uri: path.to_owned(),
            uri: head.uri,
            version: head.version,
            headers: head.headers,
            query,
            params,
            remote_addr: peer.remote,
            local_addr: peer.local,
            is_secure: peer.is_secure,
            handler_pattern: None,
        }
    }

    /// Parse a request head from a byte slice with no peer attached.
    ///
    /// Returns the request and the offset of the first body byte.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), ParseError> {
        let head = parse_request(buf)?;
        let len = head.len;
        Ok((Self::from_head(head, &PeerInfo::default()), len))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// Returns the request target exactly as the client sent it.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Returns the decoded, normalized path used for handler and file
    /// resolution (no query string).
    pub fn path(&self) -> &str {
        &self.local_uri
    }

    pub(crate) fn set_path(&mut self, path: String) {
        self.local_uri = path;
    }

    /// The URI the serving handler was registered under, if a handler
    /// serves this request.
    pub fn handler_pattern(&self) -> Option<&str> {
        self.handler_pattern.as_deref()
    }

    pub(crate) fn set_handler_pattern(&mut self, pattern: &str) {
        self.handler_pattern = Some(pattern.to_owned());
    }

    /// Returns the HTTP version.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns a decoded query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// `true` when the request arrived over TLS.
    pub fn is_secure(&self) -> bool {
        self.is_secure
    }

    /// The `Host` header without its port, if present.
    pub fn host(&self) -> Option<&str> {
        let host = self.headers.get("host")?;
        if let Some(bracketed) = host.strip_prefix('[') {
            return bracketed.split(']').next();
        }
        Some(host.split(':').next().unwrap_or(host))
    }

    /// Returns the value of the `Content-Length` header, if present and valid.
    pub fn content_length(&self) -> Option<u64> {
        parse_content_length(self.headers.get("content-length")?)
    }
}
