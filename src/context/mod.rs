//! Server-wide state shared by the acceptor and every worker.
//!
//! A [`Context`] holds the domain list (the default domain first), the stop
//! flag, the statistics counters, the handler registry, and the collaborators
//! the embedding application plugged in.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::background::TimerService;
use crate::cgi::ProcessSpawner;
use crate::config::Config;
use crate::dispatch::Exchange;
use crate::http::Request;
use crate::router::HandlerRegistry;
use crate::security::{CorsPolicy, NonceSource, PasswordVerifier};
use crate::sync::lock;
use crate::tls::TlsProvider;

/// Relaxed atomic counters. Statistics only.
#[derive(Debug, Default)]
pub struct ServerStats {
    active_connections: AtomicUsize,
    total_connections: AtomicU64,
    total_requests: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

/// A point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub active_connections: usize,
    pub total_connections: u64,
    pub total_requests: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl ServerStats {
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_completed(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            active_connections: self.active_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Called before any other processing. Returning `true` claims the request:
/// the callback has answered it through the exchange.
pub type BeginRequest = Arc<dyn Fn(&mut Exchange<'_>) -> bool + Send + Sync>;

/// Called after every request with the status that was sent.
pub type EndRequest = Arc<dyn Fn(&Request, u16) + Send + Sync>;

/// Application hooks around request processing.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub begin_request: Option<BeginRequest>,
    pub end_request: Option<EndRequest>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("begin_request", &self.begin_request.is_some())
            .field("end_request", &self.end_request.is_some())
            .finish()
    }
}

/// Identifies a domain within one server. The default domain is always 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainId(pub(crate) usize);

impl DomainId {
    pub const DEFAULT: DomainId = DomainId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

/// One virtual host: its resolved configuration and CORS policy.
#[derive(Debug)]
pub struct DomainContext {
    id: DomainId,
    config: Config,
    cors: Option<CorsPolicy>,
}

impl DomainContext {
    pub fn new(id: DomainId, config: Config) -> Self {
        let cors = CorsPolicy::from_config(&config);
        Self { id, config, cors }
    }

    pub fn id(&self) -> DomainId {
        self.id
    }

    /// The `authentication_domain` option, used for Host and SNI matching.
    pub fn name(&self) -> &str {
        &self.config.authentication_domain
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cors(&self) -> Option<&CorsPolicy> {
        self.cors.as_ref()
    }
}

/// Collaborators supplied by the embedding application.
pub(crate) struct Collaborators {
    pub(crate) tls: Option<Arc<dyn TlsProvider>>,
    pub(crate) verifier: Option<Arc<dyn PasswordVerifier>>,
    pub(crate) spawner: Arc<dyn ProcessSpawner>,
    pub(crate) callbacks: Callbacks,
}

/// Process-wide state of one running server.
pub struct Context {
    domains: Mutex<Vec<Arc<DomainContext>>>,
    stop: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
    registry: HandlerRegistry,
    timers: TimerService,
    nonces: NonceSource,
    collaborators: Collaborators,
    secure_port: Mutex<Option<u16>>,
}

impl Context {
    pub(crate) fn new(config: Config, collaborators: Collaborators) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        Self {
            domains: Mutex::new(vec![Arc::new(DomainContext::new(DomainId::DEFAULT, config))]),
            registry: HandlerRegistry::new(Arc::clone(&stop)),
            stop,
            stats: Arc::new(ServerStats::default()),
            timers: TimerService::start(),
            nonces: NonceSource::new(),
            collaborators,
            secure_port: Mutex::new(None),
        }
    }

    /// Appends a domain and returns its id.
    pub fn add_domain(&self, config: Config) -> DomainId {
        let mut domains = lock(&self.domains);
        let id = DomainId(domains.len());
        domains.push(Arc::new(DomainContext::new(id, config)));
        id
    }

    pub fn domain(&self, id: DomainId) -> Option<Arc<DomainContext>> {
        lock(&self.domains).get(id.0).cloned()
    }

    pub fn default_domain(&self) -> Arc<DomainContext> {
        lock(&self.domains)
            .first()
            .cloned()
            .unwrap_or_else(|| Arc::new(DomainContext::new(DomainId::DEFAULT, Config::default())))
    }

    /// Names of every domain, in order.
    pub fn domain_names(&self) -> Vec<String> {
        lock(&self.domains)
            .iter()
            .map(|d| d.name().to_owned())
            .collect()
    }

    /// Picks the domain for a request: the TLS SNI name if it names a
    /// domain, else the `Host` header, else the default domain.
    pub fn select_domain(&self, server_name: Option<&str>, host: Option<&str>) -> Arc<DomainContext> {
        let domains = lock(&self.domains);
        let by_name = |name: &str| {
            domains
                .iter()
                .find(|d| d.name().eq_ignore_ascii_case(name))
                .cloned()
        };
        server_name
            .and_then(by_name)
            .or_else(|| host.and_then(by_name))
            .or_else(|| domains.first().cloned())
            .unwrap_or_else(|| Arc::new(DomainContext::new(DomainId::DEFAULT, Config::default())))
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn stop_flag(&self) -> &Arc<AtomicBool> {
        &self.stop
    }

    pub(crate) fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.registry.wake_all();
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn timers(&self) -> &TimerService {
        &self.timers
    }

    pub(crate) fn nonces(&self) -> &NonceSource {
        &self.nonces
    }

    pub(crate) fn tls(&self) -> Option<&Arc<dyn TlsProvider>> {
        self.collaborators.tls.as_ref()
    }

    pub(crate) fn verifier(&self) -> Option<&dyn PasswordVerifier> {
        self.collaborators.verifier.as_deref()
    }

    pub(crate) fn spawner(&self) -> &dyn ProcessSpawner {
        self.collaborators.spawner.as_ref()
    }

    pub(crate) fn callbacks(&self) -> &Callbacks {
        &self.collaborators.callbacks
    }

    /// Port that plain requests on redirecting listeners are sent to.
    pub(crate) fn secure_port(&self) -> Option<u16> {
        *lock(&self.secure_port)
    }

    pub(crate) fn set_bound_ports(&self, ports: &[(SocketAddr, bool)]) {
        *lock(&self.secure_port) = ports
            .iter()
            .find(|(_, secure)| *secure)
            .map(|(addr, _)| addr.port());
    }
}
