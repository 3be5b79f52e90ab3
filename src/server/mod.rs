//! Server lifecycle.
//!
//! [`Server::start`] binds every listening port, starts the worker pool and
//! then the acceptor thread. [`Server::stop`] (or dropping the server)
//! raises the stop flag, wakes every blocked thread and joins them.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use wharf::config::Config;
//! use wharf::http::{Response, StatusCode};
//! use wharf::router::Reply;
//! use wharf::server::Server;
//!
//! let config = Config::from_options([("listening_ports", "8080"), ("document_root", "./public")])?;
//! let server = Server::start(config)?;
//! server.set_request_handler(
//!     "/hello",
//!     Some(Arc::new(|_: &mut wharf::dispatch::Exchange<'_>| {
//!         Reply::from(Response::new(StatusCode::Ok).body("Hello!"))
//!     })),
//! )?;
//! # server.stop();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::Waker;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::cgi::{CommandSpawner, ProcessSpawner};
use crate::config::{Config, ConfigError};
use crate::context::{Callbacks, Collaborators, Context, DomainId, StatsSnapshot};
use crate::realtime::WebSocketHandler;
use crate::router::{AuthHandler, Handler, HandlerKind, RegistryError, RequestHandler};
use crate::security::PasswordVerifier;
use crate::tls::{TlsError, TlsProvider, ensure_tls_library_initialized, release_tls_library};

mod acceptor;
pub mod queue;
mod worker;

use acceptor::{Acceptor, Listener};
use queue::SocketQueue;

/// Errors produced while starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("a secure port is configured but no TLS provider was supplied")]
    TlsRequired,

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("no listening ports configured")]
    NoListeners,

    #[error("a redirecting port needs a secure port to redirect to")]
    RedirectWithoutSecurePort,

    #[error("failed to spawn {what} thread: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Plugs collaborators into a server before it starts.
pub struct ServerBuilder {
    config: Config,
    tls: Option<Arc<dyn TlsProvider>>,
    verifier: Option<Arc<dyn PasswordVerifier>>,
    spawner: Arc<dyn ProcessSpawner>,
    callbacks: Callbacks,
}

impl ServerBuilder {
    /// Required when any listening port is secure.
    pub fn tls_provider(mut self, provider: Arc<dyn TlsProvider>) -> Self {
        self.tls = Some(provider);
        self
    }

    /// Checks credentials against password files.
    pub fn password_verifier(mut self, verifier: Arc<dyn PasswordVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Replaces the [`CommandSpawner`] used for CGI scripts.
    pub fn process_spawner(mut self, spawner: Arc<dyn ProcessSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Binds the listening ports and starts serving.
    ///
    /// # Errors
    ///
    /// - [`ServerError::NoListeners`] without listening ports.
    /// - [`ServerError::TlsRequired`] for a secure port without a provider.
    /// - [`ServerError::RedirectWithoutSecurePort`] for an `r` port with no
    ///   `s` port.
    /// - [`ServerError::Bind`] when a port cannot be bound.
    pub fn start(self) -> Result<Server, ServerError> {
        let Self {
            config,
            tls,
            verifier,
            spawner,
            callbacks,
        } = self;

        if config.listening_ports.is_empty() {
            return Err(ServerError::NoListeners);
        }
        if config.has_secure_port() && tls.is_none() {
            return Err(ServerError::TlsRequired);
        }
        if config.listening_ports.iter().any(|p| p.redirect) && !config.has_secure_port() {
            return Err(ServerError::RedirectWithoutSecurePort);
        }

        let listeners = bind(&config)?;
        let ports: Vec<(SocketAddr, bool)> = listeners.iter().map(|l| (l.addr, l.is_secure)).collect();

        let tls_in_use = match &tls {
            Some(provider) if config.has_secure_port() => {
                ensure_tls_library_initialized(provider.as_ref())?;
                Some(Arc::clone(provider))
            }
            _ => None,
        };

        let num_threads = config.num_threads.max(1);
        let ctx = Arc::new(Context::new(
            config,
            Collaborators {
                tls,
                verifier,
                spawner,
                callbacks,
            },
        ));
        ctx.set_bound_ports(&ports);

        let mut server = Server {
            ctx,
            queue: Arc::new(SocketQueue::new(num_threads)),
            waker: None,
            acceptor: None,
            workers: Vec::new(),
            ports: ports.iter().map(|(addr, _)| *addr).collect(),
            tls: tls_in_use,
            stopped: false,
        };

        // On failure `server` is dropped, which stops whatever already runs.
        server.workers = worker::spawn_workers(num_threads, &server.queue, &server.ctx)
            .map_err(|source| ServerError::Spawn { what: "worker", source })?;
        let (acceptor, waker) =
            Acceptor::new(listeners, Arc::clone(&server.queue), Arc::clone(&server.ctx))?;
        server.waker = Some(waker);
        server.acceptor = Some(
            thread::Builder::new()
                .name("wharf-acceptor".to_owned())
                .spawn(move || acceptor.run())
                .map_err(|source| ServerError::Spawn { what: "acceptor", source })?,
        );

        for addr in &server.ports {
            info!(address = %addr, "wharf listening");
        }
        Ok(server)
    }
}

fn bind(config: &Config) -> Result<Vec<Listener>, ServerError> {
    config
        .listening_ports
        .iter()
        .map(|spec| {
            let socket = TcpListener::bind(spec.addr).map_err(|source| ServerError::Bind {
                addr: spec.addr,
                source,
            })?;
            let addr = socket.local_addr()?;
            debug!(address = %addr, secure = spec.secure, redirect = spec.redirect, "bound listening port");
            Ok(Listener {
                socket,
                addr,
                is_secure: spec.secure,
                redirect_to_tls: spec.redirect,
            })
        })
        .collect()
}

/// A running server.
pub struct Server {
    ctx: Arc<Context>,
    queue: Arc<SocketQueue>,
    waker: Option<Waker>,
    acceptor: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    ports: Vec<SocketAddr>,
    tls: Option<Arc<dyn TlsProvider>>,
    stopped: bool,
}

impl Server {
    /// Starts a server with no collaborators beyond the default process
    /// spawner.
    pub fn start(config: Config) -> Result<Self, ServerError> {
        Self::builder(config).start()
    }

    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder {
            config,
            tls: None,
            verifier: None,
            spawner: Arc::new(CommandSpawner),
            callbacks: Callbacks::default(),
        }
    }

    /// Bound listening addresses, in `listening_ports` order. Port 0 in the
    /// configuration shows up here as the port actually assigned.
    pub fn ports(&self) -> &[SocketAddr] {
        &self.ports
    }

    /// Adds a virtual host selected by SNI or `Host` against its
    /// `authentication_domain`.
    pub fn add_domain(&self, config: Config) -> DomainId {
        self.ctx.add_domain(config)
    }

    /// Registers, replaces (`Some`) or removes (`None`) a handler on a
    /// domain. Replacing or removing waits until no request is running the
    /// old handler.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Stopped`] if the server stops while waiting,
    /// [`RegistryError::KindMismatch`] if `handler` is not of `kind`.
    pub fn set_handler(
        &self,
        domain: DomainId,
        uri: &str,
        kind: HandlerKind,
        handler: Option<Handler>,
    ) -> Result<(), RegistryError> {
        self.ctx.registry().set(domain.index(), uri, kind, handler)
    }

    /// [`set_handler`](Self::set_handler) for a request handler on the
    /// default domain.
    pub fn set_request_handler(
        &self,
        uri: &str,
        handler: Option<Arc<dyn RequestHandler>>,
    ) -> Result<(), RegistryError> {
        self.set_handler(DomainId::DEFAULT, uri, HandlerKind::Request, handler.map(Handler::Request))
    }

    pub fn set_websocket_handler(
        &self,
        uri: &str,
        handler: Option<Arc<dyn WebSocketHandler>>,
    ) -> Result<(), RegistryError> {
        self.set_handler(
            DomainId::DEFAULT,
            uri,
            HandlerKind::WebSocket,
            handler.map(Handler::WebSocket),
        )
    }

    pub fn set_auth_handler(
        &self,
        uri: &str,
        handler: Option<Arc<dyn AuthHandler>>,
    ) -> Result<(), RegistryError> {
        self.set_handler(DomainId::DEFAULT, uri, HandlerKind::Auth, handler.map(Handler::Auth))
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats().snapshot()
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Stops accepting, lets in-flight requests notice the stop flag, and
    /// joins every thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!("stopping server");
        self.ctx.signal_stop();
        if let Some(waker) = &self.waker {
            if let Err(e) = waker.wake() {
                error!(error = %e, "failed to wake the acceptor");
            }
        }
        self.queue.stop();

        if let Some(acceptor) = self.acceptor.take() {
            if acceptor.join().is_err() {
                error!("acceptor thread panicked");
            }
        }
        for (index, worker) in self.workers.drain(..).enumerate() {
            if worker.join().is_err() {
                error!(worker = index, "worker thread panicked");
            }
        }
        self.ctx.timers().stop();
        if let Some(provider) = self.tls.take() {
            release_tls_library(provider.as_ref());
        }
        info!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("ports", &self.ports)
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::http::{Response, StatusCode};
    use crate::router::Reply;

    fn config(ports: &str) -> Config {
        Config::from_options([("listening_ports", ports), ("num_threads", "2")]).unwrap()
    }

    #[test]
    fn secure_port_needs_a_provider() {
        let err = Server::start(config("127.0.0.1:0s")).unwrap_err();
        assert!(matches!(err, ServerError::TlsRequired));
    }

    #[test]
    fn redirect_port_needs_a_secure_port() {
        let err = Server::start(config("127.0.0.1:0r")).unwrap_err();
        assert!(matches!(err, ServerError::RedirectWithoutSecurePort));
    }

    #[test]
    fn ephemeral_port_is_reported() {
        let server = Server::start(config("127.0.0.1:0")).unwrap();
        assert_eq!(server.ports().len(), 1);
        assert_ne!(server.ports()[0].port(), 0);
        server.stop();
    }

    #[test]
    fn serves_a_handler_then_stops() {
        let server = Server::start(config("127.0.0.1:0")).unwrap();
        server
            .set_request_handler(
                "/ping",
                Some(Arc::new(|_: &mut crate::dispatch::Exchange<'_>| {
                    Reply::from(Response::new(StatusCode::Ok).body("pong"))
                })),
            )
            .unwrap();

        let mut stream = TcpStream::connect(server.ports()[0]).unwrap();
        stream
            .write_all(b"GET /ping HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).unwrap();
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(reply.ends_with("pong"));

        let started = Instant::now();
        server.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
