//! HTTP/1.x protocol types and parsing.
//!
//! [`Method`], [`StatusCode`], [`Version`], [`Headers`], [`Request`] and
//! [`Response`], plus the pure framing helpers in [`chunked`] and [`url`].
//! Nothing in here touches a socket.

use std::fmt;

pub mod chunked;
pub mod headers;
pub mod request;
pub mod response;
pub mod url;

pub use headers::Headers;
pub use request::{ParseError, Request, RequestHead};
pub use response::Response;

/// An HTTP response status code.
///
/// # Examples
///
/// ```
/// use wharf::http::StatusCode;
///
/// let status = StatusCode::Ok;
/// assert_eq!(status.as_u16(), 200);
/// assert_eq!(status.canonical_reason(), "OK");
/// assert!(StatusCode::NotModified.forbids_body());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    // 1xx Informational
    Continue = 100,
    SwitchingProtocols = 101,

    // 2xx Success
    Ok = 200,
    Created = 201,
    Accepted = 202,
    NoContent = 204,
    PartialContent = 206,

    // 3xx Redirection
    MovedPermanently = 301,
    Found = 302,
    SeeOther = 303,
    NotModified = 304,
    TemporaryRedirect = 307,
    PermanentRedirect = 308,

    // 4xx Client Error
    BadRequest = 400,
    Unauthorized = 401,
    Forbidden = 403,
    NotFound = 404,
    MethodNotAllowed = 405,
    RequestTimeout = 408,
    Conflict = 409,
    Gone = 410,
    LengthRequired = 411,
    PreconditionFailed = 412,
    PayloadTooLarge = 413,
    UriTooLong = 414,
    UnsupportedMediaType = 415,
    RangeNotSatisfiable = 416,
    ExpectationFailed = 417,
    UnprocessableEntity = 422,
    TooManyRequests = 429,
    RequestHeaderFieldsTooLarge = 431,

    // 5xx Server Error
    InternalServerError = 500,
    NotImplemented = 501,
    BadGateway = 502,
    ServiceUnavailable = 503,
    GatewayTimeout = 504,
    HttpVersionNotSupported = 505,
}

impl StatusCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Looks up the variant for a numeric code, if it is one we name.
    pub fn from_u16(code: u16) -> Option<Self> {
        const ALL: &[StatusCode] = &[
            StatusCode::Continue,
            StatusCode::SwitchingProtocols,
            StatusCode::Ok,
            StatusCode::Created,
            StatusCode::Accepted,
            StatusCode::NoContent,
            StatusCode::PartialContent,
            StatusCode::MovedPermanently,
            StatusCode::Found,
            StatusCode::SeeOther,
            StatusCode::NotModified,
            StatusCode::TemporaryRedirect,
            StatusCode::PermanentRedirect,
            StatusCode::BadRequest,
            StatusCode::Unauthorized,
            StatusCode::Forbidden,
            StatusCode::NotFound,
            StatusCode::MethodNotAllowed,
            StatusCode::RequestTimeout,
            StatusCode::Conflict,
            StatusCode::Gone,
            StatusCode::LengthRequired,
            StatusCode::PreconditionFailed,
            StatusCode::PayloadTooLarge,
            StatusCode::UriTooLong,
            StatusCode::UnsupportedMediaType,
            StatusCode::RangeNotSatisfiable,
            StatusCode::ExpectationFailed,
            StatusCode::UnprocessableEntity,
            StatusCode::TooManyRequests,
            StatusCode::RequestHeaderFieldsTooLarge,
            StatusCode::InternalServerError,
            StatusCode::NotImplemented,
            StatusCode::BadGateway,
            StatusCode::ServiceUnavailable,
            StatusCode::GatewayTimeout,
            StatusCode::HttpVersionNotSupported,
        ];
        ALL.iter().copied().find(|s| s.as_u16() == code)
    }

    /// Reason phrase written on the status line.
    pub fn canonical_reason(self) -> &'static str {
        match self {
            Self::Continue => "Continue",
            Self::SwitchingProtocols => "Switching Protocols",
            Self::Ok => "OK",
            Self::Created => "Created",
            Self::Accepted => "Accepted",
            Self::NoContent => "No Content",
            Self::PartialContent => "Partial Content",
            Self::MovedPermanently => "Moved Permanently",
            Self::Found => "Found",
            Self::SeeOther => "See Other",
            Self::NotModified => "Not Modified",
            Self::TemporaryRedirect => "Temporary Redirect",
            Self::PermanentRedirect => "Permanent Redirect",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::RequestTimeout => "Request Timeout",
            Self::Conflict => "Conflict",
            Self::Gone => "Gone",
            Self::LengthRequired => "Length Required",
            Self::PreconditionFailed => "Precondition Failed",
            Self::PayloadTooLarge => "Payload Too Large",
            Self::UriTooLong => "URI Too Long",
            Self::UnsupportedMediaType => "Unsupported Media Type",
            Self::RangeNotSatisfiable => "Range Not Satisfiable",
            Self::ExpectationFailed => "Expectation Failed",
            Self::UnprocessableEntity => "Unprocessable Entity",
            Self::TooManyRequests => "Too Many Requests",
            Self::RequestHeaderFieldsTooLarge => "Request Header Fields Too Large",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::BadGateway => "Bad Gateway",
            Self::ServiceUnavailable => "Service Unavailable",
            Self::GatewayTimeout => "Gateway Timeout",
            Self::HttpVersionNotSupported => "HTTP Version Not Supported",
        }
    }

    /// Returns `true` when a response with this status must not carry a body
    /// (1xx, 204 and 304).
    pub fn forbids_body(self) -> bool {
        status_forbids_body(self.as_u16())
    }
}

/// Same as [`StatusCode::forbids_body`] for codes we have no variant for.
pub fn status_forbids_body(code: u16) -> bool {
    (100..200).contains(&code) || code == 204 || code == 304
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.canonical_reason())
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> u16 {
        code.as_u16()
    }
}

/// Parses a status code the way a response head or a script `Status:` line
/// carries it: exactly three ASCII digits in the range 100–999.
///
/// ```
/// use wharf::http::parse_status_code;
///
/// assert_eq!(parse_status_code("404"), Some(404));
/// assert_eq!(parse_status_code("99"), None);
/// assert_eq!(parse_status_code("+20"), None);
/// ```
pub fn parse_status_code(s: &str) -> Option<u16> {
    let bytes = s.as_bytes();
    if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let code = bytes
        .iter()
        .fold(0u16, |acc, b| acc * 10 + u16::from(b - b'0'));
    (100..=999).contains(&code).then_some(code)
}

/// An HTTP request method from the accepted whitelist.
///
/// `TRACE` and extension methods are rejected at parse time; see
/// [`ParseError::UnsupportedMethod`].
///
/// # Examples
///
/// ```
/// use wharf::http::Method;
///
/// let method: Method = "GET".parse().unwrap();
/// assert_eq!(method, Method::Get);
/// assert_eq!(method.as_str(), "GET");
/// assert!("TRACE".parse::<Method>().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Head,
    Options,
    Connect,
    Patch,
    // WebDAV
    Propfind,
    Mkcol,
    Report,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
            Self::Connect => "CONNECT",
            Self::Patch => "PATCH",
            Self::Propfind => "PROPFIND",
            Self::Mkcol => "MKCOL",
            Self::Report => "REPORT",
        }
    }

    /// Methods whose requests carry no body unless they say so explicitly.
    ///
    /// A request for one of these without `Content-Length` or
    /// `Transfer-Encoding` has a zero-length body rather than an unknown one.
    pub fn has_no_body(&self) -> bool {
        matches!(self, Self::Get | Self::Head | Self::Options | Self::Delete)
    }

    /// Methods that modify the file tree when no handler or script claims
    /// them. They are checked against `put_delete_auth_file`.
    pub fn writes_files(&self) -> bool {
        matches!(self, Self::Put | Self::Delete | Self::Mkcol)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Method {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            "CONNECT" => Self::Connect,
            "PATCH" => Self::Patch,
            "PROPFIND" => Self::Propfind,
            "MKCOL" => Self::Mkcol,
            "REPORT" => Self::Report,
            // TRACE lands here too.
            other => return Err(ParseError::UnsupportedMethod(other.to_owned())),
        })
    }
}

impl AsRef<str> for Method {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// HTTP protocol version of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    /// Returns the version as it appears on the wire, e.g. `HTTP/1.1`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }

    /// Returns the version number without the protocol prefix, e.g. `1.1`.
    pub fn number(self) -> &'static str {
        &self.as_str()[5..]
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Version {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(number) = s.strip_prefix("HTTP/") else {
            return Err(ParseError::InvalidVersion);
        };
        match number {
            "1.0" => Ok(Self::Http10),
            "1.1" => Ok(Self::Http11),
            other => Err(ParseError::UnsupportedVersion(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_accepts_webdav_methods() {
        for name in ["PROPFIND", "MKCOL", "REPORT", "PATCH", "CONNECT"] {
            let method: Method = name.parse().unwrap();
            assert_eq!(method.as_str(), name);
        }
    }

    #[test]
    fn trace_is_rejected() {
        assert_eq!(
            "TRACE".parse::<Method>(),
            Err(ParseError::UnsupportedMethod("TRACE".into()))
        );
    }

    #[test]
    fn methods_are_case_sensitive() {
        assert!("get".parse::<Method>().is_err());
    }

    #[test]
    fn version_requires_http_prefix() {
        assert_eq!("HTTP/1.1".parse::<Version>(), Ok(Version::Http11));
        assert_eq!("HTTP/1.0".parse::<Version>(), Ok(Version::Http10));
        assert_eq!("HTP/1.1".parse::<Version>(), Err(ParseError::InvalidVersion));
        assert_eq!(
            "HTTP/2.0".parse::<Version>(),
            Err(ParseError::UnsupportedVersion("2.0".into()))
        );
    }

    #[test]
    fn status_code_parsing_is_strict() {
        assert_eq!(parse_status_code("200"), Some(200));
        assert_eq!(parse_status_code("999"), Some(999));
        assert_eq!(parse_status_code("099"), None);
        assert_eq!(parse_status_code("2000"), None);
        assert_eq!(parse_status_code("20a"), None);
        assert_eq!(parse_status_code(" 20"), None);
    }

    #[test]
    fn status_lookup_round_trips_named_codes() {
        assert_eq!(StatusCode::from_u16(416), Some(StatusCode::RangeNotSatisfiable));
        assert_eq!(StatusCode::from_u16(299), None);
    }

    #[test]
    fn bodiless_statuses() {
        assert!(StatusCode::NotModified.forbids_body());
        assert!(StatusCode::NoContent.forbids_body());
        assert!(StatusCode::SwitchingProtocols.forbids_body());
        assert!(!StatusCode::Ok.forbids_body());
    }
}
