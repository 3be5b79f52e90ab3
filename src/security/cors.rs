//! Cross-Origin Resource Sharing.
//!
//! A [`CorsPolicy`] is built from the three `access_control_*` options. It
//! answers preflight requests on its own and decorates every other response
//! to an allowed origin.
//!
//! # Behavior
//!
//! - Without an `Origin` header, or with an origin not on the allow-list,
//!   nothing happens.
//! - `OPTIONS` with `Access-Control-Request-Method` is a preflight and is
//!   answered with `204 No Content`; no handler runs.
//! - Other requests get `Access-Control-Allow-Origin` added to their
//!   response.
//! - A specific (non-wildcard) origin is echoed back together with
//!   `Vary: Origin` so caches keep the variants apart.

use crate::config::Config;
use crate::http::{Method, Request, Response, StatusCode};

/// CORS settings for one domain.
///
/// ```
/// use wharf::security::CorsPolicy;
///
/// let cors = CorsPolicy::new("https://app.example.com")
///     .allow_methods("GET, POST")
///     .allow_headers("X-Request-ID");
/// assert!(cors.allows_origin("https://app.example.com"));
/// assert!(!cors.allows_origin("https://evil.example.com"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsPolicy {
    allowed_origins: Vec<String>,
    allowed_methods: String,
    allowed_headers: String,
}

impl CorsPolicy {
    /// A policy for a comma-separated origin list, or `*` for any origin.
    /// Methods and headers default to `*` (echo what the client asks for).
    pub fn new(origins: &str) -> Self {
        Self {
            allowed_origins: origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_owned)
                .collect(),
            allowed_methods: "*".to_owned(),
            allowed_headers: "*".to_owned(),
        }
    }

    /// The policy configured for a domain, if `access_control_allow_origin`
    /// is set.
    pub fn from_config(config: &Config) -> Option<Self> {
        let origins = config.access_control_allow_origin.as_deref()?;
        Some(
            Self::new(origins)
                .allow_methods(&config.access_control_allow_methods)
                .allow_headers(&config.access_control_allow_headers),
        )
    }

    #[must_use]
    pub fn allow_methods(mut self, methods: &str) -> Self {
        methods.trim().clone_into(&mut self.allowed_methods);
        self
    }

    #[must_use]
    pub fn allow_headers(mut self, headers: &str) -> Self {
        headers.trim().clone_into(&mut self.allowed_headers);
        self
    }

    pub fn allows_origin(&self, origin: &str) -> bool {
        self.allowed_origins.iter().any(|o| o == "*" || o == origin)
    }

    fn is_wildcard(&self) -> bool {
        self.allowed_origins.iter().any(|o| o == "*")
    }

    // The Access-Control-Allow-Origin value for this request, if allowed.
    fn allow_origin_for(&self, request: &Request) -> Option<String> {
        let origin = request.headers().get("origin")?;
        if self.is_wildcard() {
            Some("*".to_owned())
        } else if self.allows_origin(origin) {
            Some(origin.to_owned())
        } else {
            None
        }
    }

    /// Answers a preflight request, or returns `None` if `request` is not
    /// one this policy covers.
    pub fn preflight(&self, request: &Request) -> Option<Response> {
        if request.method() != Method::Options {
            return None;
        }
        let requested_method = request.headers().get("access-control-request-method")?;
        let allow_origin = self.allow_origin_for(request)?;

        let methods = if self.allowed_methods == "*" {
            requested_method
        } else {
            &self.allowed_methods
        };
        let mut response = Response::new(StatusCode::NoContent)
            .header("Access-Control-Allow-Origin", allow_origin.as_str())
            .header("Access-Control-Allow-Methods", methods)
            .header("Access-Control-Max-Age", "3600");

        let requested_headers = request.headers().get("access-control-request-headers");
        let headers = match (self.allowed_headers.as_str(), requested_headers) {
            ("*", Some(requested)) => Some(requested),
            ("*", None) => None,
            (configured, _) => Some(configured),
        };
        if let Some(headers) = headers {
            response.add_header("Access-Control-Allow-Headers", headers);
        }
        if allow_origin != "*" {
            response.add_header("Vary", "Origin");
        }
        Some(response)
    }

    /// Headers to add to the response of a non-preflight request.
    pub fn decorations(&self, request: &Request) -> Vec<(String, String)> {
        let Some(allow_origin) = self.allow_origin_for(request) else {
            return Vec::new();
        };
        let vary = allow_origin != "*";
        let mut headers = vec![("Access-Control-Allow-Origin".to_owned(), allow_origin)];
        if vary {
            headers.push(("Vary".to_owned(), "Origin".to_owned()));
        }
        headers
    }
}
