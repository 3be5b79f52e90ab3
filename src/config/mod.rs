//! Server configuration.
//!
//! Options arrive as a flat `name → string` table, the way an embedding
//! application or a JSON file provides them. [`Config`] parses that table
//! once into typed values; nothing downstream re-reads option strings.
//!
//! ```
//! use wharf::config::Config;
//!
//! let config = Config::from_options([
//!     ("listening_ports", "127.0.0.1:0"),
//!     ("num_threads", "4"),
//!     ("enable_keep_alive", "yes"),
//! ])
//! .unwrap();
//! assert_eq!(config.num_threads, 4);
//! assert!(config.enable_keep_alive);
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::security::{AccessControlList, ThrottleRules};

/// Errors produced while building a [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown option: {0}")]
    UnknownOption(String),

    #[error("invalid value {value:?} for option {name}: {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },

    #[error("configuration must be a JSON object")]
    NotAnObject,

    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// One entry of `listening_ports`: `[ip:]port[s|r]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSpec {
    pub addr: SocketAddr,
    /// `s` suffix: connections on this port start with a TLS handshake.
    pub secure: bool,
    /// `r` suffix: plain port whose requests are redirected to a secure port.
    pub redirect: bool,
}

impl std::str::FromStr for PortSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (body, secure, redirect) = match s.as_bytes().last() {
            Some(b's') => (&s[..s.len() - 1], true, false),
            Some(b'r') => (&s[..s.len() - 1], false, true),
            _ => (s, false, false),
        };
        let addr = if let Ok(port) = body.parse::<u16>() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)
        } else {
            body.parse::<SocketAddr>()
                .map_err(|_| format!("expected [ip:]port[s|r], got {s:?}"))?
        };
        Ok(Self {
            addr,
            secure,
            redirect,
        })
    }
}

/// Typed server configuration. See the field docs for option names and
/// defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// `listening_ports`, default `8080`.
    pub listening_ports: Vec<PortSpec>,
    /// `num_threads`, default 50.
    pub num_threads: usize,
    /// `document_root`; without one no files are served.
    pub document_root: Option<PathBuf>,
    /// `enable_keep_alive`, default yes.
    pub enable_keep_alive: bool,
    /// `request_timeout_ms`, default 30000.
    pub request_timeout: Duration,
    /// `keep_alive_timeout_ms`, default 500.
    pub keep_alive_timeout: Duration,
    /// `max_request_size`: bytes of buffered request head, default 16384.
    pub max_request_size: usize,
    /// `decode_url`, default yes.
    pub decode_url: bool,
    /// `index_files`.
    pub index_files: Vec<String>,
    /// `url_rewrite_patterns`: `/uri_prefix=/fs/dir` pairs.
    pub url_rewrite_patterns: Vec<(String, PathBuf)>,
    /// `cgi_pattern`; empty disables scripts.
    pub cgi_pattern: Option<String>,
    /// `cgi_interpreter`: run every script through this program.
    pub cgi_interpreter: Option<PathBuf>,
    /// `cgi_timeout_ms`; zero means no limit.
    pub cgi_timeout: Option<Duration>,
    /// `hide_files_patterns`.
    pub hide_files_patterns: Option<String>,
    pub global_auth_file: Option<PathBuf>,
    pub put_delete_auth_file: Option<PathBuf>,
    /// `authentication_domain`: the digest realm and the domain name.
    pub authentication_domain: String,
    pub throttle: ThrottleRules,
    pub access_control_list: AccessControlList,
    pub access_control_allow_origin: Option<String>,
    pub access_control_allow_methods: String,
    pub access_control_allow_headers: String,
    /// `static_file_max_age` in seconds, default 3600.
    pub static_file_max_age: u64,
    /// `additional_header`: extra `Name: value` lines for every response.
    pub additional_headers: Vec<(String, String)>,
    pub tcp_nodelay: bool,
    /// `websocket_timeout_ms`, default 30000.
    pub websocket_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listening_ports: vec![PortSpec {
                addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
                secure: false,
                redirect: false,
            }],
            num_threads: 50,
            document_root: None,
            enable_keep_alive: true,
            request_timeout: Duration::from_secs(30),
            keep_alive_timeout: Duration::from_millis(500),
            max_request_size: 16 * 1024,
            decode_url: true,
            index_files: ["index.html", "index.htm", "index.cgi"]
                .map(String::from)
                .to_vec(),
            url_rewrite_patterns: Vec::new(),
            cgi_pattern: Some("**.cgi$|**.pl$|**.php$".to_owned()),
            cgi_interpreter: None,
            cgi_timeout: None,
            hide_files_patterns: None,
            global_auth_file: None,
            put_delete_auth_file: None,
            authentication_domain: "mydomain.com".to_owned(),
            throttle: ThrottleRules::default(),
            access_control_list: AccessControlList::default(),
            access_control_allow_origin: None,
            access_control_allow_methods: "*".to_owned(),
            access_control_allow_headers: "*".to_owned(),
            static_file_max_age: 3600,
            additional_headers: Vec::new(),
            tcp_nodelay: false,
            websocket_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Builds a configuration from defaults plus the given options.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownOption`] for names not in the option table and
    /// [`ConfigError::InvalidValue`] for values that do not parse.
    pub fn from_options<I, K, V>(options: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (name, value) in options {
            config.set(name.as_ref(), value.as_ref())?;
        }
        Ok(config)
    }

    /// Parses a JSON object of options. Numbers and booleans are accepted
    /// in place of strings.
    ///
    /// ```
    /// use wharf::config::Config;
    ///
    /// let config = Config::from_json_str(r#"{"num_threads": 8, "tcp_nodelay": true}"#).unwrap();
    /// assert_eq!(config.num_threads, 8);
    /// assert!(config.tcp_nodelay);
    /// ```
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        let serde_json::Value::Object(map) = value else {
            return Err(ConfigError::NotAnObject);
        };
        let mut options = Vec::with_capacity(map.len());
        for (name, value) in map {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Bool(true) => "yes".to_owned(),
                serde_json::Value::Bool(false) => "no".to_owned(),
                serde_json::Value::Number(n) => n.to_string(),
                other => {
                    return Err(ConfigError::InvalidValue {
                        name,
                        value: other.to_string(),
                        reason: "expected a string, number or boolean".to_owned(),
                    });
                }
            };
            options.push((name, value));
        }
        Self::from_options(options)
    }

    /// Sets one option by name.
    pub fn set(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidValue {
            name: name.to_owned(),
            value: value.to_owned(),
            reason,
        };

        match name {
            "listening_ports" => {
                let ports = list(value)
                    .map(str::parse)
                    .collect::<Result<Vec<PortSpec>, _>>()
                    .map_err(invalid)?;
                if ports.is_empty() {
                    return Err(invalid("at least one port is required".to_owned()));
                }
                self.listening_ports = ports;
            }
            "num_threads" => {
                self.num_threads = number(value).map_err(invalid)?;
                if self.num_threads == 0 {
                    return Err(invalid("must be at least 1".to_owned()));
                }
            }
            "document_root" => self.document_root = optional(value).map(PathBuf::from),
            "enable_keep_alive" => self.enable_keep_alive = boolean(value).map_err(invalid)?,
            "request_timeout_ms" => self.request_timeout = millis(value).map_err(invalid)?,
            "keep_alive_timeout_ms" => self.keep_alive_timeout = millis(value).map_err(invalid)?,
            "max_request_size" => {
                self.max_request_size = number(value).map_err(invalid)?;
                if self.max_request_size < 1024 {
                    return Err(invalid("must be at least 1024".to_owned()));
                }
            }
            "decode_url" => self.decode_url = boolean(value).map_err(invalid)?,
            "index_files" => self.index_files = list(value).map(str::to_owned).collect(),
            "url_rewrite_patterns" => {
                self.url_rewrite_patterns = list(value)
                    .map(|pair| {
                        pair.split_once('=')
                            .map(|(uri, dir)| (uri.trim().to_owned(), PathBuf::from(dir.trim())))
                            .ok_or_else(|| format!("expected /uri=/dir, got {pair:?}"))
                    })
                    .collect::<Result<Vec<_>, String>>()
                    .map_err(invalid)?;
            }
            "cgi_pattern" => self.cgi_pattern = optional(value).map(str::to_owned),
            "cgi_interpreter" => self.cgi_interpreter = optional(value).map(PathBuf::from),
            "cgi_timeout_ms" => {
                let timeout = millis(value).map_err(invalid)?;
                self.cgi_timeout = (!timeout.is_zero()).then_some(timeout);
            }
            "hide_files_patterns" => self.hide_files_patterns = optional(value).map(str::to_owned),
            "global_auth_file" => self.global_auth_file = optional(value).map(PathBuf::from),
            "put_delete_auth_file" => {
                self.put_delete_auth_file = optional(value).map(PathBuf::from);
            }
            "authentication_domain" => self.authentication_domain = value.trim().to_owned(),
            "throttle" => self.throttle = ThrottleRules::parse(value).map_err(invalid)?,
            "access_control_list" => {
                self.access_control_list = AccessControlList::parse(value).map_err(invalid)?;
            }
            "access_control_allow_origin" => {
                self.access_control_allow_origin = optional(value).map(str::to_owned);
            }
            "access_control_allow_methods" => {
                self.access_control_allow_methods = value.trim().to_owned();
            }
            "access_control_allow_headers" => {
                self.access_control_allow_headers = value.trim().to_owned();
            }
            "static_file_max_age" => self.static_file_max_age = number(value).map_err(invalid)?,
            "additional_header" => {
                self.additional_headers = value
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(|line| {
                        line.split_once(':')
                            .map(|(n, v)| (n.trim().to_owned(), v.trim().to_owned()))
                            .ok_or_else(|| format!("expected Name: value, got {line:?}"))
                    })
                    .collect::<Result<Vec<_>, String>>()
                    .map_err(invalid)?;
            }
            "tcp_nodelay" => self.tcp_nodelay = boolean(value).map_err(invalid)?,
            "websocket_timeout_ms" => self.websocket_timeout = millis(value).map_err(invalid)?,
            other => return Err(ConfigError::UnknownOption(other.to_owned())),
        }
        Ok(())
    }

    /// `true` if any listening port is a TLS port.
    pub fn has_secure_port(&self) -> bool {
        self.listening_ports.iter().any(|p| p.secure)
    }
}

fn list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn optional(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

fn boolean(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Ok(true),
        "no" | "false" | "0" | "off" => Ok(false),
        _ => Err("expected yes or no".to_owned()),
    }
}

fn number<T: std::str::FromStr>(value: &str) -> Result<T, String> {
    let value = value.trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err("expected a non-negative integer".to_owned());
    }
    value.parse().map_err(|_| "number out of range".to_owned())
}

fn millis(value: &str) -> Result<Duration, String> {
    number(value).map(Duration::from_millis)
}
