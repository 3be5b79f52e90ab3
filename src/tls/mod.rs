//! TLS collaborator interface.
//!
//! The server never implements TLS itself. An embedding application that
//! listens on secure ports supplies a [`TlsProvider`]; the worker hands it
//! each raw socket from a secure listener and speaks HTTP over the session
//! it returns.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use crate::sync::lock;

/// Errors from the TLS collaborator.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("TLS library initialization failed: {0}")]
    Init(String),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("I/O error during TLS handshake: {0}")]
    Io(#[from] std::io::Error),
}

/// An established TLS session over one client socket.
pub trait TlsSession: Read + Write + Send {
    /// The SNI host name the client asked for, if any.
    fn server_name(&self) -> Option<&str>;

    /// Sets the timeout for one read on the underlying socket.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()>;

    /// Sends `close_notify` and shuts the socket down.
    fn shutdown(&mut self) -> std::io::Result<()>;
}

/// Produces TLS sessions for the secure listening ports.
pub trait TlsProvider: Send + Sync {
    /// One-time library setup. Called at most once per process no matter how
    /// many servers start; see [`ensure_tls_library_initialized`].
    fn initialize(&self) -> Result<(), TlsError> {
        Ok(())
    }

    /// Releases what [`initialize`](Self::initialize) set up.
    fn cleanup(&self) {}

    /// Runs the server side of the handshake. `domains` lists the configured
    /// domain names so the provider can select a certificate by SNI.
    fn handshake(&self, stream: TcpStream, domains: &[String]) -> Result<Box<dyn TlsSession>, TlsError>;
}

static LIBRARY_USERS: Mutex<usize> = Mutex::new(0);

/// Initializes the TLS library on first use. Later calls only bump the
/// user count.
pub fn ensure_tls_library_initialized(provider: &dyn TlsProvider) -> Result<(), TlsError> {
    let mut users = lock(&LIBRARY_USERS);
    if *users == 0 {
        provider.initialize()?;
        info!("TLS library initialized");
    }
    *users += 1;
    Ok(())
}

/// Drops one user; the last one out runs [`TlsProvider::cleanup`].
pub fn release_tls_library(provider: &dyn TlsProvider) {
    let mut users = lock(&LIBRARY_USERS);
    match *users {
        0 => {}
        1 => {
            *users = 0;
            provider.cleanup();
            debug!("TLS library released");
        }
        _ => *users -= 1,
    }
}
