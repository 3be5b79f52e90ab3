//! Handler registry: map URI patterns to request, websocket and auth
//! handlers.
//!
//! Registrations are kept in one ordered list per server, tagged with the
//! domain they belong to and their [`HandlerKind`]; the three kinds are
//! independent search spaces. [`HandlerRegistry::lookup`] tries, in order:
//!
//! | Tier    | Registered  | Matches                          |
//! |---------|-------------|----------------------------------|
//! | exact   | `/api`      | `/api`                           |
//! | prefix  | `/api`      | `/api/users`, but not `/apiary`  |
//! | pattern | `/img/*.png`| see [`pattern::match_prefix`]    |
//!
//! Within a tier the earliest registration wins.
//!
//! Request handlers are reference counted while they run. Replacing or
//! removing one waits until every running call has returned, so a handler
//! is never torn down mid-call; the registry lock itself is only held for
//! the list walk.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use thiserror::Error;

use crate::connection::POLL_QUANTUM;
use crate::dispatch::Exchange;
use crate::http::{Request, Response};
use crate::realtime::WebSocketHandler;
use crate::sync::{lock, wait_timeout};

pub mod pattern;

/// What a request handler did with the exchange.
#[derive(Debug)]
pub enum Reply {
    /// Send this response.
    Response(Response),
    /// The handler wrote its own response through the exchange.
    Done,
    /// Decline; the request falls through to file resolution. Only valid
    /// while nothing has been written.
    NotHandled,
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

/// A plain request handler.
///
/// Any `Fn(&mut Exchange<'_>) -> Reply + Send + Sync` implements this trait
/// via the blanket impl below.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, exchange: &mut Exchange<'_>) -> Reply;
}

impl<F> RequestHandler for F
where
    F: Fn(&mut Exchange<'_>) -> Reply + Send + Sync,
{
    fn handle(&self, exchange: &mut Exchange<'_>) -> Reply {
        self(exchange)
    }
}

/// A per-URI authorization hook. Returning `false` answers 401.
pub trait AuthHandler: Send + Sync {
    fn authorize(&self, request: &Request) -> bool;
}

impl<F> AuthHandler for F
where
    F: Fn(&Request) -> bool + Send + Sync,
{
    fn authorize(&self, request: &Request) -> bool {
        self(request)
    }
}

/// The three handler search spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Request,
    WebSocket,
    Auth,
}

/// A registered handler of any kind.
#[derive(Clone)]
pub enum Handler {
    Request(Arc<dyn RequestHandler>),
    WebSocket(Arc<dyn WebSocketHandler>),
    Auth(Arc<dyn AuthHandler>),
}

impl Handler {
    pub fn kind(&self) -> HandlerKind {
        match self {
            Self::Request(_) => HandlerKind::Request,
            Self::WebSocket(_) => HandlerKind::WebSocket,
            Self::Auth(_) => HandlerKind::Auth,
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handler::{:?}", self.kind())
    }
}

/// Errors from [`HandlerRegistry::set`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("server is stopping")]
    Stopped,

    #[error("handler kind does not match the registration kind")]
    KindMismatch,
}

struct Registration {
    id: u64,
    domain: usize,
    uri: String,
    kind: HandlerKind,
    handler: Handler,
    ref_count: usize,
}

#[derive(Default)]
struct Entries {
    list: Vec<Registration>,
    next_id: u64,
}

struct Shared {
    entries: Mutex<Entries>,
    released: Condvar,
}

/// The handler registry shared by every domain of one server.
#[derive(Clone)]
pub struct HandlerRegistry {
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
}

impl HandlerRegistry {
    pub fn new(stop: Arc<AtomicBool>) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(Entries::default()),
                released: Condvar::new(),
            }),
            stop,
        }
    }

    /// Adds, replaces (`Some`) or removes (`None`) the registration for
    /// `(domain, uri, kind)`.
    ///
    /// Blocks while a request handler under that registration is running.
    /// Removing a registration that does not exist is a no-op.
    ///
    /// # Errors
    ///
    /// [`RegistryError::Stopped`] if the server stops while waiting, and
    /// [`RegistryError::KindMismatch`] if `handler` is not of `kind`.
    pub fn set(
        &self,
        domain: usize,
        uri: &str,
        kind: HandlerKind,
        handler: Option<Handler>,
    ) -> Result<(), RegistryError> {
        if handler.as_ref().is_some_and(|h| h.kind() != kind) {
            return Err(RegistryError::KindMismatch);
        }

        let mut entries = lock(&self.shared.entries);
        loop {
            let position = entries
                .list
                .iter()
                .position(|r| r.domain == domain && r.kind == kind && r.uri == uri);
            match position {
                Some(i) if entries.list[i].ref_count > 0 => {
                    if self.stop.load(Ordering::Acquire) {
                        return Err(RegistryError::Stopped);
                    }
                    entries = wait_timeout(&self.shared.released, entries, POLL_QUANTUM);
                }
                Some(i) => {
                    match handler {
                        Some(handler) => entries.list[i].handler = handler,
                        None => {
                            entries.list.remove(i);
                        }
                    }
                    return Ok(());
                }
                None => {
                    if let Some(handler) = handler {
                        let id = entries.next_id;
                        entries.next_id += 1;
                        entries.list.push(Registration {
                            id,
                            domain,
                            uri: uri.to_owned(),
                            kind,
                            handler,
                            ref_count: 0,
                        });
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Finds the handler for `uri`. Request handlers stay counted as in use
    /// until the returned lease is dropped.
    pub fn lookup(&self, domain: usize, uri: &str, kind: HandlerKind) -> Option<HandlerLease> {
        let mut entries = lock(&self.shared.entries);
        let candidates = || {
            entries
                .list
                .iter()
                .enumerate()
                .filter(|(_, r)| r.domain == domain && r.kind == kind)
        };

        let found = candidates()
            .find(|(_, r)| r.uri == uri)
            .or_else(|| {
                candidates().find(|(_, r)| {
                    uri.strip_prefix(r.uri.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
                        && !r.uri.ends_with('/')
                })
            })
            .or_else(|| {
                candidates().find(|(_, r)| pattern::is_glob(&r.uri) && pattern::matches(&r.uri, uri))
            })
            .map(|(i, _)| i)?;

        let registration = &mut entries.list[found];
        let counted = registration.kind == HandlerKind::Request;
        if counted {
            registration.ref_count += 1;
        }
        Some(HandlerLease {
            handler: registration.handler.clone(),
            pattern: registration.uri.clone(),
            release: counted.then(|| (Arc::clone(&self.shared), registration.id)),
        })
    }

    /// Number of registrations across all domains and kinds.
    pub fn len(&self) -> usize {
        lock(&self.shared.entries).list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wakes every thread waiting in [`set`](Self::set) so it can observe
    /// the stop flag.
    pub fn wake_all(&self) {
        let _entries = lock(&self.shared.entries);
        self.shared.released.notify_all();
    }
}

/// A handler found by [`HandlerRegistry::lookup`]. Dropping the lease
/// releases the reference count.
pub struct HandlerLease {
    handler: Handler,
    pattern: String,
    release: Option<(Arc<Shared>, u64)>,
}

impl HandlerLease {
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    /// The URI the handler was registered under.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

impl Drop for HandlerLease {
    fn drop(&mut self) {
        let Some((shared, id)) = self.release.take() else {
            return;
        };
        let mut entries = lock(&shared.entries);
        if let Some(registration) = entries.list.iter_mut().find(|r| r.id == id) {
            registration.ref_count = registration.ref_count.saturating_sub(1);
        }
        drop(entries);
        shared.released.notify_all();
    }
}
