//! Request dispatch.
//!
//! [`handle_request`] takes one parsed request head through the fixed
//! dispatch order:
//!
//! 1. split the query string off the target
//! 2. redirect plain requests on a TLS-redirect port to HTTPS
//! 3. URL-decode the path, then remove dot segments
//! 4. select the throttle rate
//! 5. offer the request to the `begin_request` callback
//! 6. answer CORS preflights
//! 7. resolve a websocket or request handler, else a file
//! 8. run the authorization gate
//! 9. execute
//! 10. log and release the handler lease
//!
//! Every failure along the way is answered with an error status unless the
//! socket itself has failed.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, info, warn};

use crate::connection::{BodyError, Connection};
use crate::context::{Context, DomainContext};
use crate::http::request::RequestHead;
use crate::http::response::Framing;
use crate::http::url::{remove_dot_segments, url_decode};
use crate::http::{Request, Response, StatusCode};
use crate::realtime;
use crate::router::{Handler, HandlerKind, Reply};
use crate::security::auth;

pub mod files;

/// A request in progress, as seen by handlers.
///
/// Reads consume the request body; writes go to the client. A handler
/// either returns a [`Reply::Response`] or writes its own response through
/// [`start_response`](Self::start_response) / [`write`](Self::write) and
/// returns [`Reply::Done`].
pub struct Exchange<'a> {
    request: &'a Request,
    conn: &'a mut Connection,
    ctx: &'a Context,
    domain: &'a DomainContext,
}

impl<'a> Exchange<'a> {
    pub(crate) fn new(
        request: &'a Request,
        conn: &'a mut Connection,
        ctx: &'a Context,
        domain: &'a DomainContext,
    ) -> Self {
        Self {
            request,
            conn,
            ctx,
            domain,
        }
    }

    pub fn request(&self) -> &'a Request {
        self.request
    }

    pub fn domain(&self) -> &'a DomainContext {
        self.domain
    }

    pub(crate) fn context(&self) -> &'a Context {
        self.ctx
    }

    pub(crate) fn connection(&mut self) -> &mut Connection {
        self.conn
    }

    /// Reads request body bytes. `Ok(0)` once the body is exhausted.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, BodyError> {
        self.conn.read_body(buf)
    }

    /// Reads the whole remaining request body.
    pub fn read_to_end(&mut self) -> Result<Bytes, BodyError> {
        let mut body = BytesMut::new();
        let mut chunk = [0u8; 8192];
        loop {
            let n = self.conn.read_body(&mut chunk)?;
            if n == 0 {
                return Ok(body.freeze());
            }
            body.extend_from_slice(&chunk[..n]);
        }
    }

    /// Sends a complete response.
    pub fn respond(&mut self, response: Response) -> Result<(), BodyError> {
        self.conn.send_response(response)
    }

    /// Sends the response head. `Framing::Chunked` streams a body of unknown
    /// length.
    pub fn start_response(&mut self, mut response: Response, framing: Framing) -> Result<(), BodyError> {
        self.conn.send_head(&mut response, framing)
    }

    /// Writes body bytes after [`start_response`](Self::start_response).
    pub fn write(&mut self, data: &[u8]) -> Result<usize, BodyError> {
        self.conn.write_body(data)
    }

    /// Ends a streamed body.
    pub fn finish(&mut self) -> Result<(), BodyError> {
        self.conn.finish_response()
    }

    /// Closes the connection once this exchange is over.
    pub fn close_connection(&mut self) {
        self.conn.close_after_response();
    }

    pub fn headers_sent(&self) -> bool {
        self.conn.headers_sent()
    }
}

// Handler resolution outcome.
enum Resolved {
    WebSocket(crate::router::HandlerLease),
    Request(crate::router::HandlerLease),
    Files,
}

/// Serves one request whose head has just been read.
pub(crate) fn handle_request(ctx: &Context, conn: &mut Connection, head: RequestHead) {
    let peer = conn.peer().clone();
    let mut request = Request::from_head(head, &peer);
    let domain = ctx.select_domain(peer.server_name.as_deref(), request.host());

    serve(ctx, &domain, conn, &mut request);

    if !conn.headers_sent() {
        // Nothing answered the request: that is a server fault, not the client's.
        send_error(conn, StatusCode::InternalServerError);
    } else if let Err(e) = conn.finish_response() {
        debug!(error = %e, "failed to finish response");
    }

    ctx.stats().request_completed();
    log_access(conn, Some(&request));
    if let Some(end_request) = &ctx.callbacks().end_request {
        end_request(&request, conn.status());
    }
}

fn serve(ctx: &Context, domain: &DomainContext, conn: &mut Connection, request: &mut Request) {
    let config = domain.config();

    if conn.peer().redirect_to_tls {
        redirect_to_tls(ctx, conn, request);
        return;
    }

    let path = if config.decode_url {
        match url_decode(request.path(), false) {
            Ok(decoded) => decoded,
            Err(_) => {
                warn!(uri = %request.uri(), "invalid percent-encoding in request path");
                send_error(conn, StatusCode::BadRequest);
                return;
            }
        }
    } else {
        request.path().to_owned()
    };
    request.set_path(remove_dot_segments(&path));

    conn.set_throttle(
        config
            .throttle
            .select(request.remote_addr().map(|a| a.ip()), request.path()),
    );

    let mut decorations = config.additional_headers.clone();
    if let Some(cors) = domain.cors() {
        decorations.extend(cors.decorations(request));
    }
    conn.set_decorations(decorations);

    if let Some(begin_request) = ctx.callbacks().begin_request.clone() {
        let mut exchange = Exchange::new(request, conn, ctx, domain);
        let claimed = catch_unwind(AssertUnwindSafe(|| begin_request(&mut exchange)));
        match claimed {
            Ok(true) => return,
            Ok(false) => {}
            Err(_) => {
                handler_panicked(conn, request);
                return;
            }
        }
    }

    if let Some(preflight) = domain.cors().and_then(|cors| cors.preflight(request)) {
        send(conn, preflight);
        return;
    }

    let registry = ctx.registry();
    let domain_index = domain.id().index();
    // Upgrade requests only see websocket handlers.
    let resolved = if realtime::is_upgrade_request(request) {
        registry
            .lookup(domain_index, request.path(), HandlerKind::WebSocket)
            .map(Resolved::WebSocket)
    } else {
        registry
            .lookup(domain_index, request.path(), HandlerKind::Request)
            .map(Resolved::Request)
    };
    let resolved = resolved.unwrap_or(Resolved::Files);

    match resolved {
        Resolved::WebSocket(lease) => {
            if !authorize(ctx, domain, conn, request, None) {
                return;
            }
            let Handler::WebSocket(handler) = lease.handler().clone() else {
                return;
            };
            request.set_handler_pattern(lease.pattern());
            drop(lease);
            let mut exchange = Exchange::new(request, conn, ctx, domain);
            if realtime::serve(&mut exchange, handler.as_ref()) {
                return;
            }
            debug!(uri = %request.path(), "websocket connect refused, resolving as file");
            files::serve(&mut Exchange::new(request, conn, ctx, domain));
        }
        Resolved::Request(lease) => {
            if !authorize(ctx, domain, conn, request, None) {
                return;
            }
            let Handler::Request(handler) = lease.handler() else {
                return;
            };
            request.set_handler_pattern(lease.pattern());
            let mut exchange = Exchange::new(request, conn, ctx, domain);
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&mut exchange)));
            // The lease is released before falling through to files.
            drop(lease);
            match outcome {
                Ok(Reply::Response(response)) => send(conn, response),
                Ok(Reply::Done) => {}
                Ok(Reply::NotHandled) if !conn.headers_sent() => {
                    files::serve(&mut Exchange::new(request, conn, ctx, domain));
                }
                Ok(Reply::NotHandled) => {
                    warn!(uri = %request.path(), "handler declined after writing a response");
                    conn.close_after_response();
                }
                Err(_) => handler_panicked(conn, request),
            }
        }
        Resolved::Files => files::serve(&mut Exchange::new(request, conn, ctx, domain)),
    }
}

/// The authorization gate. A registered auth handler decides alone;
/// otherwise writes need the put/delete password file and everything else
/// the file governing `path`. Sends the rejection itself and returns `false`
/// when the request may not proceed.
pub(crate) fn authorize(
    ctx: &Context,
    domain: &DomainContext,
    conn: &mut Connection,
    request: &Request,
    path: Option<&Path>,
) -> bool {
    let config = domain.config();
    let realm = config.authentication_domain.as_str();

    if let Some(lease) = ctx
        .registry()
        .lookup(domain.id().index(), request.path(), HandlerKind::Auth)
    {
        if let Handler::Auth(auth_handler) = lease.handler() {
            let allowed = catch_unwind(AssertUnwindSafe(|| auth_handler.authorize(request)));
            return match allowed {
                Ok(true) => true,
                Ok(false) => {
                    send(conn, auth::challenge(realm, ctx.nonces()));
                    false
                }
                Err(_) => {
                    handler_panicked(conn, request);
                    false
                }
            };
        }
    }

    let write = request.method().writes_files();
    let allowed = if write && path.is_some() {
        auth::is_authorized_for_write(ctx.verifier(), request, config)
    } else {
        let file = auth::governing_password_file(config, path);
        auth::is_authorized(ctx.verifier(), request, realm, file.as_deref())
    };
    if !allowed {
        debug!(uri = %request.path(), "authorization required");
        send(conn, auth::challenge(realm, ctx.nonces()));
    }
    allowed
}

fn redirect_to_tls(ctx: &Context, conn: &mut Connection, request: &Request) {
    let Some(port) = ctx.secure_port() else {
        error!("redirect port configured without a secure port");
        send_error(conn, StatusCode::InternalServerError);
        return;
    };
    let host = request
        .host()
        .map(str::to_owned)
        .or_else(|| request.local_addr().map(|a| a.ip().to_string()))
        .unwrap_or_else(|| "localhost".to_owned());
    let location = if host.contains(':') {
        format!("https://[{host}]:{port}{}", request.uri())
    } else {
        format!("https://{host}:{port}{}", request.uri())
    };
    send(
        conn,
        Response::new(StatusCode::MovedPermanently).header("Location", location),
    );
}

fn handler_panicked(conn: &mut Connection, request: &Request) {
    error!(uri = %request.path(), "request handler panicked");
    conn.close_after_response();
    if !conn.headers_sent() {
        send_error(conn, StatusCode::InternalServerError);
    }
}

pub(crate) fn send(conn: &mut Connection, response: Response) {
    if let Err(e) = conn.send_response(response) {
        debug!(error = %e, "failed to send response");
    }
}

pub(crate) fn send_error(conn: &mut Connection, status: StatusCode) {
    send(conn, Response::error(status));
}

/// Answers a request whose head could not be read or parsed.
pub(crate) fn reject(conn: &mut Connection, status: StatusCode) {
    send(conn, Response::error(status).keep_alive(false));
    log_access(conn, None);
}

// One line per request on the `wharf::access` target.
pub(crate) fn log_access(conn: &Connection, request: Option<&Request>) {
    let remote = conn
        .peer()
        .remote
        .map_or_else(|| "-".to_owned(), |a| a.ip().to_string());
    let header = |name: &str| {
        request
            .and_then(|r| r.headers().get(name))
            .unwrap_or("-")
            .to_owned()
    };
    info!(
        target: "wharf::access",
        remote = %remote,
        method = request.map_or("-", |r| r.method().as_str()),
        uri = request.map_or("-", Request::uri),
        version = request.map_or("-", |r| r.version().as_str()),
        status = conn.status(),
        bytes = conn.bytes_sent(),
        elapsed_ms = conn.elapsed().as_millis() as u64,
        referer = %header("referer"),
        user_agent = %header("user-agent"),
    );
}
