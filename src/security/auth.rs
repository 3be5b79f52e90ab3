//! Authorization gate.
//!
//! Checking credentials is delegated to a [`PasswordVerifier`] supplied by
//! the embedding application; this module only decides which password file
//! governs a request and builds the Digest challenge.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha1::{Digest, Sha1};

use crate::config::Config;
use crate::http::{Request, Response, StatusCode};

/// Name of the per-directory password file. Never served.
pub const PASSWORDS_FILE_NAME: &str = ".htpasswd";

/// Checks a request's credentials against a password file.
pub trait PasswordVerifier: Send + Sync {
    /// `true` if the `Authorization` header of `request` is valid for
    /// `realm` according to `password_file`.
    fn verify(&self, request: &Request, realm: &str, password_file: &Path) -> bool;
}

impl<F> PasswordVerifier for F
where
    F: Fn(&Request, &str, &Path) -> bool + Send + Sync,
{
    fn verify(&self, request: &Request, realm: &str, password_file: &Path) -> bool {
        self(request, realm, password_file)
    }
}

/// Issues a fresh nonce for every Digest challenge.
#[derive(Debug)]
pub struct NonceSource {
    seed: u64,
    counter: AtomicU64,
}

impl Default for NonceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceSource {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        Self {
            seed: seed ^ u64::from(std::process::id()).rotate_left(32),
            counter: AtomicU64::new(0),
        }
    }

    pub fn issue(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha1::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update(n.to_le_bytes());
        let digest = hasher.finalize();
        digest[..12].iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// The password file that protects `path`: the global file if one is
/// configured, else a `.htpasswd` in the directory holding `path`, else none.
pub fn governing_password_file(config: &Config, path: Option<&Path>) -> Option<PathBuf> {
    if let Some(global) = &config.global_auth_file {
        return Some(global.clone());
    }
    let path = path?;
    let dir = if path.is_dir() { path } else { path.parent()? };
    let candidate = dir.join(PASSWORDS_FILE_NAME);
    candidate.is_file().then_some(candidate)
}

/// Runs the standard check. Without a governing file the request is allowed;
/// with one but no verifier it is refused.
pub fn is_authorized(
    verifier: Option<&dyn PasswordVerifier>,
    request: &Request,
    realm: &str,
    password_file: Option<&Path>,
) -> bool {
    match (password_file, verifier) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(file), Some(verifier)) => verifier.verify(request, realm, file),
    }
}

/// The separate check for PUT, DELETE and MKCOL. Refused unless
/// `put_delete_auth_file` is configured and the credentials verify.
pub fn is_authorized_for_write(
    verifier: Option<&dyn PasswordVerifier>,
    request: &Request,
    config: &Config,
) -> bool {
    let Some(file) = config.put_delete_auth_file.as_deref() else {
        return false;
    };
    is_authorized(verifier, request, &config.authentication_domain, Some(file))
}

/// A `401` carrying a Digest challenge with a fresh nonce.
pub fn challenge(realm: &str, nonces: &NonceSource) -> Response {
    Response::error(StatusCode::Unauthorized).header(
        "WWW-Authenticate",
        format!(
            "Digest qop=\"auth\", realm=\"{realm}\", nonce=\"{}\"",
            nonces.issue()
        ),
    )
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn request() -> Request {
        Request::parse(b"GET /secret HTTP/1.1\r\nAuthorization: Digest x\r\n\r\n")
            .unwrap()
            .0
    }

    #[test]
    fn nonces_are_fresh() {
        let nonces = NonceSource::new();
        let a = nonces.issue();
        let b = nonces.issue();
        assert_ne!(a, b);
        assert_eq!(a.len(), 24);
    }

    #[test]
    fn challenge_carries_realm_and_nonce() {
        let response = challenge("example.com", &NonceSource::new());
        assert_eq!(response.status(), 401);
        let header = response.headers().get("www-authenticate").unwrap();
        assert!(header.starts_with("Digest qop=\"auth\", realm=\"example.com\", nonce=\""));
    }

    #[test]
    fn directory_password_file_governs_its_files() {
        let root = tempfile::tempdir().unwrap();
        let private = root.path().join("private");
        fs::create_dir(&private).unwrap();
        fs::write(private.join("doc.txt"), "x").unwrap();
        fs::write(private.join(PASSWORDS_FILE_NAME), "user:realm:hash").unwrap();
        fs::write(root.path().join("open.txt"), "x").unwrap();

        let config = Config::default();
        assert_eq!(
            governing_password_file(&config, Some(&private.join("doc.txt"))),
            Some(private.join(PASSWORDS_FILE_NAME))
        );
        assert_eq!(
            governing_password_file(&config, Some(&private)),
            Some(private.join(PASSWORDS_FILE_NAME))
        );
        assert_eq!(governing_password_file(&config, Some(&root.path().join("open.txt"))), None);
        assert_eq!(governing_password_file(&config, None), None);
    }

    #[test]
    fn global_file_wins() {
        let config = Config {
            global_auth_file: Some(PathBuf::from("/etc/wharf.passwd")),
            ..Config::default()
        };
        assert_eq!(
            governing_password_file(&config, None),
            Some(PathBuf::from("/etc/wharf.passwd"))
        );
    }

    #[test]
    fn verifier_decides_when_a_file_governs() {
        let allow = |_: &Request, realm: &str, _: &Path| realm == "r";
        let file = Path::new("/p");
        assert!(is_authorized(None, &request(), "r", None));
        assert!(!is_authorized(None, &request(), "r", Some(file)));
        assert!(is_authorized(Some(&allow), &request(), "r", Some(file)));
        assert!(!is_authorized(Some(&allow), &request(), "other", Some(file)));
    }

    #[test]
    fn writes_need_the_put_delete_file() {
        let allow = |_: &Request, _: &str, _: &Path| true;
        let mut config = Config::default();
        assert!(!is_authorized_for_write(Some(&allow), &request(), &config));
        config.put_delete_auth_file = Some(PathBuf::from("/p"));
        assert!(is_authorized_for_write(Some(&allow), &request(), &config));
    }
}
