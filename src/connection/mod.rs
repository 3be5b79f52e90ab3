//! Per-worker connection state.
//!
//! A [`Connection`] is allocated once per worker thread and reused for every
//! socket that worker serves. It owns the input buffer, tracks how much of
//! the current request body has been consumed, frames the response body,
//! and decides whether the socket can carry another request.
//!
//! All socket I/O is bounded: reads and writes wait at most
//! [`POLL_QUANTUM`] before re-checking the server's stop flag and the
//! configured timeouts.

use std::collections::TryReserveError;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::context::ServerStats;
use crate::http::chunked::{ChunkError, ChunkState, ChunkedDecoder, LAST_CHUNK, encode_chunk};
use crate::http::headers::value_has_token;
use crate::http::request::{ParseError, RequestHead, parse_content_length, parse_request};
use crate::http::response::Framing;
use crate::http::{Method, Response, StatusCode, Version, status_forbids_body};
use crate::tls::TlsSession;

/// Longest a single blocking socket operation waits before the stop flag
/// and timeouts are re-checked.
pub const POLL_QUANTUM: Duration = Duration::from_millis(250);

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// A byte stream to one client.
pub trait Transport: Read + Write + Send {
    /// Bounds every blocking read and write to `quantum`.
    fn set_poll_quantum(&mut self, quantum: Duration) -> io::Result<()>;

    /// Closes both directions.
    fn shutdown(&mut self);
}

impl Transport for TcpStream {
    fn set_poll_quantum(&mut self, quantum: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(quantum))?;
        self.set_write_timeout(Some(quantum))
    }

    fn shutdown(&mut self) {
        let _ = TcpStream::shutdown(self, Shutdown::Both);
    }
}

/// Adapts a TLS session to [`Transport`].
pub struct TlsTransport(pub Box<dyn TlsSession>);

impl Read for TlsTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Write for TlsTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl Transport for TlsTransport {
    fn set_poll_quantum(&mut self, quantum: Duration) -> io::Result<()> {
        self.0.set_read_timeout(Some(quantum))
    }

    fn shutdown(&mut self) {
        let _ = self.0.shutdown();
    }
}

/// Where a connection came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    pub remote: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
    pub is_secure: bool,
    /// Accepted on a plain port whose requests are redirected to TLS.
    pub redirect_to_tls: bool,
    /// SNI name from the TLS handshake.
    pub server_name: Option<String>,
}

/// Limits copied from the default domain's configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_request_size: usize,
    pub request_timeout: Duration,
    pub keep_alive_timeout: Duration,
    pub enable_keep_alive: bool,
}

impl From<&Config> for Limits {
    fn from(config: &Config) -> Self {
        Self {
            max_request_size: config.max_request_size,
            request_timeout: config.request_timeout,
            keep_alive_timeout: config.keep_alive_timeout,
            enable_keep_alive: config.enable_keep_alive,
        }
    }
}

/// Why no request head could be read.
#[derive(Debug, Error)]
pub enum HeadError {
    #[error("peer closed the connection")]
    Closed,

    #[error("no request arrived before the idle timeout")]
    Idle,

    #[error("server is stopping")]
    Stopped,

    #[error("request head not completed in time")]
    Timeout,

    #[error("request head exceeds the buffer size")]
    TooLarge,

    #[error("unsupported Expect header")]
    ExpectationFailed,

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HeadError {
    /// The status to answer with, or `None` when the connection should just
    /// be closed.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Timeout => Some(StatusCode::RequestTimeout),
            Self::TooLarge => Some(StatusCode::PayloadTooLarge),
            Self::ExpectationFailed => Some(StatusCode::ExpectationFailed),
            Self::Parse(e) => Some(e.status()),
            Self::Closed | Self::Idle | Self::Stopped | Self::Io(_) => None,
        }
    }
}

/// Errors while streaming a request or response body.
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out waiting for the peer")]
    Timeout,

    #[error("server is stopping")]
    Stopped,

    #[error("peer closed the connection before the body was complete")]
    UnexpectedEof,

    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error("response headers were already sent")]
    HeadersAlreadySent,

    #[error("no socket attached")]
    Detached,
}

/// The keep-alive rule.
///
/// The connection closes if something already demanded it or keep-alive is
/// disabled. Otherwise a `Connection` header decides (it must list
/// `keep-alive` and not `close`); without one, HTTP/1.1 persists and
/// HTTP/1.0 does not.
pub fn keep_alive_decision(
    must_close: bool,
    enabled: bool,
    version: Version,
    connection: Option<&str>,
) -> bool {
    if must_close || !enabled {
        return false;
    }
    match connection {
        Some(value) => value_has_token(value, "keep-alive") && !value_has_token(value, "close"),
        None => version == Version::Http11,
    }
}

/// One worker's connection slot. See the module docs.
pub struct Connection {
    transport: Option<Box<dyn Transport>>,
    peer: PeerInfo,
    buf: Vec<u8>,
    limits: Limits,
    stop: Arc<AtomicBool>,
    stats: Arc<ServerStats>,
    requests_served: u64,

    // Request side.
    version: Version,
    connection_header: Option<String>,
    is_head: bool,
    content_length: Option<u64>,
    consumed: u64,
    chunked: Option<ChunkedDecoder>,
    expect_continue: bool,
    continue_sent: bool,
    must_close: bool,
    started: Instant,

    // Response side.
    headers_sent: bool,
    status: u16,
    framing: Framing,
    body_remaining: Option<u64>,
    body_finished: bool,
    bytes_sent: u64,
    decorations: Vec<(String, String)>,
    throttle: u64,
    window_start: Instant,
    window_sent: u64,
}

impl Connection {
    /// Allocates the slot and its input buffer.
    ///
    /// # Errors
    ///
    /// Fails when the buffer cannot be allocated; the caller (a worker
    /// thread) gives up rather than aborting the process.
    pub fn new(
        limits: Limits,
        stop: Arc<AtomicBool>,
        stats: Arc<ServerStats>,
    ) -> Result<Self, TryReserveError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(limits.max_request_size)?;
        let now = Instant::now();
        Ok(Self {
            transport: None,
            peer: PeerInfo::default(),
            buf,
            limits,
            stop,
            stats,
            requests_served: 0,
            version: Version::Http11,
            connection_header: None,
            is_head: false,
            content_length: None,
            consumed: 0,
            chunked: None,
            expect_continue: false,
            continue_sent: false,
            must_close: false,
            started: now,
            headers_sent: false,
            status: 0,
            framing: Framing::Length(0),
            body_remaining: None,
            body_finished: false,
            bytes_sent: 0,
            decorations: Vec::new(),
            throttle: 0,
            window_start: now,
            window_sent: 0,
        })
    }

    /// Binds the slot to a new socket.
    pub fn attach(&mut self, mut transport: Box<dyn Transport>, peer: PeerInfo) {
        if let Err(e) = transport.set_poll_quantum(POLL_QUANTUM) {
            debug!(error = %e, "failed to set socket timeouts");
        }
        self.transport = Some(transport);
        self.peer = peer;
        self.buf.clear();
        self.requests_served = 0;
        self.reset_request();
    }

    /// Shuts the socket down and forgets it. The buffer allocation is kept.
    pub fn detach(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.flush();
            transport.shutdown();
        }
        self.buf.clear();
        self.reset_request();
    }

    pub fn is_attached(&self) -> bool {
        self.transport.is_some()
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    /// Clears request and response bookkeeping. Buffered bytes of a
    /// pipelined next request stay.
    pub fn reset_request(&mut self) {
        self.version = Version::Http11;
        self.connection_header = None;
        self.is_head = false;
        self.content_length = None;
        self.consumed = 0;
        self.chunked = None;
        self.expect_continue = false;
        self.continue_sent = false;
        self.must_close = false;
        self.started = Instant::now();
        self.headers_sent = false;
        self.status = 0;
        self.framing = Framing::Length(0);
        self.body_remaining = None;
        self.body_finished = false;
        self.bytes_sent = 0;
        self.decorations.clear();
        self.throttle = 0;
        self.window_sent = 0;
    }

    /// Reads and parses the next request head, then resolves the body
    /// framing.
    pub fn read_head(&mut self) -> Result<RequestHead, HeadError> {
        let waiting_since = Instant::now();
        let idle_limit = if self.requests_served == 0 {
            self.limits.request_timeout
        } else {
            self.limits.keep_alive_timeout
        };

        loop {
            if !self.buf.is_empty() {
                match parse_request(&self.buf) {
                    Ok(head) => {
                        self.buf.drain(..head.len);
                        self.started = Instant::now();
                        self.begin_request(&head)?;
                        return Ok(head);
                    }
                    Err(ParseError::Incomplete) => {}
                    Err(e) => {
                        self.must_close = true;
                        return Err(e.into());
                    }
                }
                if self.buf.len() >= self.limits.max_request_size {
                    self.must_close = true;
                    return Err(HeadError::TooLarge);
                }
            }

            if self.stop.load(Ordering::Acquire) {
                return Err(HeadError::Stopped);
            }

            match self.fill() {
                Ok(0) => {
                    self.must_close = true;
                    return if self.buf.iter().all(u8::is_ascii_whitespace) {
                        Err(HeadError::Closed)
                    } else {
                        Err(ParseError::Incomplete.into())
                    };
                }
                Ok(_) => {}
                Err(e) if is_poll_timeout(&e) => {
                    let waited = waiting_since.elapsed();
                    let idle = self.buf.iter().all(u8::is_ascii_whitespace);
                    if idle && waited >= idle_limit {
                        return Err(HeadError::Idle);
                    }
                    if waited >= self.limits.request_timeout {
                        self.must_close = true;
                        return Err(HeadError::Timeout);
                    }
                }
                Err(e) => {
                    self.must_close = true;
                    return Err(e.into());
                }
            }
        }
    }

    fn begin_request(&mut self, head: &RequestHead) -> Result<(), HeadError> {
        self.version = head.version;
        self.connection_header = head.headers.get("connection").map(str::to_owned);
        self.is_head = head.method == Method::Head;
        self.resolve_content_length(head)?;

        if let Some(expect) = head.headers.get("expect") {
            if !expect.trim().eq_ignore_ascii_case("100-continue") {
                self.must_close = true;
                return Err(HeadError::ExpectationFailed);
            }
            self.expect_continue = head.version == Version::Http11 && self.has_pending_body();
        }
        Ok(())
    }

    /// Body framing, in order: Content-Length, chunked, methods that never
    /// carry a body, then unknown (read until close).
    fn resolve_content_length(&mut self, head: &RequestHead) -> Result<(), HeadError> {
        let lengths: Vec<&str> = head.headers.get_all("content-length").collect();
        let transfer = head.headers.get("transfer-encoding");
        match (lengths.first(), transfer) {
            (Some(_), Some(_)) => {
                self.must_close = true;
                return Err(ParseError::ConflictingLength.into());
            }
            (Some(first), None) => {
                let n = parse_content_length(first).ok_or(ParseError::InvalidContentLength)?;
                if lengths.iter().any(|v| parse_content_length(v) != Some(n)) {
                    self.must_close = true;
                    return Err(ParseError::InvalidContentLength.into());
                }
                self.content_length = Some(n);
            }
            (None, Some(coding)) => {
                if !coding.trim().eq_ignore_ascii_case("chunked") {
                    self.must_close = true;
                    return Err(ParseError::UnsupportedTransferEncoding(coding.to_owned()).into());
                }
                self.chunked = Some(ChunkedDecoder::new());
            }
            (None, None) if head.method.has_no_body() => self.content_length = Some(0),
            (None, None) => {
                self.content_length = None;
                self.must_close = true;
            }
        }
        Ok(())
    }

    fn has_pending_body(&self) -> bool {
        match (&self.chunked, self.content_length) {
            (Some(decoder), _) => !decoder.is_done(),
            (None, Some(n)) => self.consumed < n,
            (None, None) => true,
        }
    }

    /// `None` when the body length is unknown (read until close).
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn chunk_state(&self) -> ChunkState {
        self.chunked
            .as_ref()
            .map_or(ChunkState::NotChunked, ChunkedDecoder::state)
    }

    /// Bytes already buffered beyond the current position, which may
    /// include a pipelined next request.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Reads request body bytes into `out`. `Ok(0)` means the body is
    /// complete.
    pub fn read_body(&mut self, out: &mut [u8]) -> Result<usize, BodyError> {
        if out.is_empty() || !self.has_pending_body() {
            return Ok(0);
        }
        self.send_continue()?;

        if self.chunked.is_some() {
            return self.read_chunked(out);
        }

        let remaining = self
            .content_length
            .map_or(u64::MAX, |n| n.saturating_sub(self.consumed));
        if self.buf.is_empty() && self.fill_body()? == 0 {
            if self.content_length.is_none() {
                // Unknown length: end of stream ends the body.
                self.content_length = Some(self.consumed);
                return Ok(0);
            }
            self.must_close = true;
            return Err(BodyError::UnexpectedEof);
        }
        let take = self
            .buf
            .len()
            .min(out.len())
            .min(usize::try_from(remaining).unwrap_or(usize::MAX));
        out[..take].copy_from_slice(&self.buf[..take]);
        self.buf.drain(..take);
        self.consumed += take as u64;
        Ok(take)
    }

    fn read_chunked(&mut self, out: &mut [u8]) -> Result<usize, BodyError> {
        loop {
            if !self.buf.is_empty() {
                let Some(decoder) = self.chunked.as_mut() else {
                    return Ok(0);
                };
                let (used, produced) = match decoder.decode(&self.buf, out) {
                    Ok(progress) => progress,
                    Err(e) => {
                        self.must_close = true;
                        return Err(e.into());
                    }
                };
                let done = decoder.is_done();
                self.buf.drain(..used);
                self.consumed += produced as u64;
                if produced > 0 || done {
                    return Ok(produced);
                }
            }
            if self.fill_body()? == 0 {
                self.must_close = true;
                return Err(BodyError::UnexpectedEof);
            }
        }
    }

    /// Reads and discards whatever is left of the request body so the
    /// buffer starts at the next request. Returns the number of body bytes
    /// discarded.
    pub fn drain_body(&mut self) -> u64 {
        if self.must_close || !self.has_pending_body() {
            return 0;
        }
        if self.expect_continue && !self.continue_sent {
            // The client is still waiting for permission to send.
            self.must_close = true;
            return 0;
        }
        let mut scratch = [0u8; 8192];
        let mut drained = 0u64;
        loop {
            match self.read_body(&mut scratch) {
                Ok(0) => return drained,
                Ok(n) => drained += n as u64,
                Err(e) => {
                    debug!(error = %e, "failed to drain request body");
                    self.must_close = true;
                    return drained;
                }
            }
        }
    }

    fn send_continue(&mut self) -> Result<(), BodyError> {
        if self.expect_continue && !self.continue_sent && !self.headers_sent {
            self.continue_sent = true;
            self.write_all_polled(CONTINUE)?;
        }
        Ok(())
    }

    // Reads more bytes into the buffer's spare capacity.
    fn fill(&mut self) -> io::Result<usize> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))?;
        let start = self.buf.len();
        let capacity = self.buf.capacity().max(start + 1);
        self.buf.resize(capacity, 0);
        let result = transport.read(&mut self.buf[start..]);
        let n = *result.as_ref().unwrap_or(&0);
        self.buf.truncate(start + n);
        if n > 0 {
            self.stats.add_bytes_received(n as u64);
        }
        result
    }

    // `fill` with body-read timeout and stop handling.
    fn fill_body(&mut self) -> Result<usize, BodyError> {
        let since = Instant::now();
        loop {
            if self.stop.load(Ordering::Acquire) {
                self.must_close = true;
                return Err(BodyError::Stopped);
            }
            match self.fill() {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if is_poll_timeout(&e) => {
                    if since.elapsed() >= self.limits.request_timeout {
                        self.must_close = true;
                        return Err(BodyError::Timeout);
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotConnected => return Err(BodyError::Detached),
                Err(e) => {
                    self.must_close = true;
                    return Err(e.into());
                }
            }
        }
    }

    /// Reads raw bytes after a protocol switch, waiting at most `timeout`
    /// for data. `Ok(0)` means the peer closed.
    pub(crate) fn read_raw(&mut self, out: &mut [u8], timeout: Duration) -> Result<usize, BodyError> {
        if self.buf.is_empty() {
            let since = Instant::now();
            loop {
                if self.stop.load(Ordering::Acquire) {
                    return Err(BodyError::Stopped);
                }
                match self.fill() {
                    Ok(0) => return Ok(0),
                    Ok(_) => break,
                    Err(e) if e.kind() == ErrorKind::Interrupted => {}
                    Err(e) if is_poll_timeout(&e) => {
                        if since.elapsed() >= timeout {
                            return Err(BodyError::Timeout);
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        let take = self.buf.len().min(out.len());
        out[..take].copy_from_slice(&self.buf[..take]);
        self.buf.drain(..take);
        Ok(take)
    }

    /// Writes raw bytes outside any response framing.
    pub(crate) fn write_raw(&mut self, data: &[u8]) -> Result<(), BodyError> {
        self.write_all_polled(data)
    }

    /// Headers added to every response head of this request unless the
    /// response already carries them.
    pub fn set_decorations(&mut self, headers: Vec<(String, String)>) {
        self.decorations = headers;
    }

    /// Bytes per second for this request's response; 0 is unlimited.
    pub fn set_throttle(&mut self, bytes_per_sec: u64) {
        self.throttle = bytes_per_sec;
        self.window_start = Instant::now();
        self.window_sent = 0;
    }

    /// Forces the connection to close after this request.
    pub fn close_after_response(&mut self) {
        self.must_close = true;
    }

    pub fn must_close(&self) -> bool {
        self.must_close
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Status of the response sent, 0 before the head is written.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Body bytes written for this request.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// The keep-alive decision for the current request.
    pub fn should_keep_alive(&self) -> bool {
        keep_alive_decision(
            self.must_close,
            self.limits.enable_keep_alive && !self.stop.load(Ordering::Acquire),
            self.version,
            self.connection_header.as_deref(),
        )
    }

    /// Writes the response head. The body follows through
    /// [`write_body`](Self::write_body).
    pub fn send_head(&mut self, response: &mut Response, framing: Framing) -> Result<(), BodyError> {
        if self.headers_sent {
            return Err(BodyError::HeadersAlreadySent);
        }
        if self.transport.is_none() {
            return Err(BodyError::Detached);
        }
        let framing = match framing {
            Framing::Chunked if self.version == Version::Http10 => Framing::UntilClose,
            other => other,
        };
        if framing == Framing::UntilClose && !status_forbids_body(response.status()) {
            self.must_close = true;
        }
        if !response.wants_keep_alive() || response.headers().has_token("connection", "close") {
            self.must_close = true;
        }
        // The head states the server's own decision; only an upgrade keeps
        // the handler's value.
        if !response.headers().has_token("connection", "upgrade") {
            response.headers_mut().remove("connection");
        }
        for (name, value) in &self.decorations {
            if !response.headers().contains(name) {
                response.add_header(name.clone(), value.clone());
            }
        }

        let head = response.head_bytes(framing, self.should_keep_alive());
        self.headers_sent = true;
        self.status = response.status();
        self.framing = framing;
        self.body_remaining = match framing {
            Framing::Length(n) => Some(n),
            _ => None,
        };
        self.write_all_polled(&head)
    }

    /// Writes body bytes using the framing chosen in
    /// [`send_head`](Self::send_head). Bytes beyond a declared
    /// `Content-Length` are dropped; HEAD responses drop everything.
    pub fn write_body(&mut self, data: &[u8]) -> Result<usize, BodyError> {
        if !self.headers_sent {
            return Err(BodyError::HeadersAlreadySent);
        }
        if data.is_empty() || self.is_head || status_forbids_body(self.status) {
            return Ok(data.len());
        }
        match self.framing {
            Framing::Length(_) => {
                let remaining = self.body_remaining.unwrap_or(0);
                let take = data.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                if take < data.len() {
                    debug!(extra = data.len() - take, "dropping bytes beyond Content-Length");
                }
                self.throttled_write(&data[..take])?;
                self.body_remaining = Some(remaining - take as u64);
                self.bytes_sent += take as u64;
            }
            Framing::Chunked => {
                self.throttled_write(&encode_chunk(data))?;
                self.bytes_sent += data.len() as u64;
            }
            Framing::UntilClose => {
                self.throttled_write(data)?;
                self.bytes_sent += data.len() as u64;
            }
        }
        Ok(data.len())
    }

    /// Ends the response body: writes the last chunk, or forces a close if
    /// fewer bytes than announced were written.
    pub fn finish_response(&mut self) -> Result<(), BodyError> {
        if !self.headers_sent || self.body_finished {
            return Ok(());
        }
        self.body_finished = true;
        if self.is_head || status_forbids_body(self.status) {
            return Ok(());
        }
        match self.framing {
            Framing::Chunked => self.write_all_polled(LAST_CHUNK)?,
            Framing::Length(_) if self.body_remaining.unwrap_or(0) > 0 => {
                self.must_close = true;
            }
            _ => {}
        }
        Ok(())
    }

    /// Sends a complete buffered response.
    pub fn send_response(&mut self, mut response: Response) -> Result<(), BodyError> {
        let body = response.take_body();
        self.send_head(&mut response, Framing::Length(body.len() as u64))?;
        self.write_body(&body)?;
        self.finish_response()
    }

    /// Marks the end of one request/response exchange.
    pub fn complete_request(&mut self) {
        self.requests_served += 1;
    }

    fn throttled_write(&mut self, data: &[u8]) -> Result<(), BodyError> {
        if self.throttle == 0 {
            return self.write_all_polled(data);
        }
        let mut rest = data;
        while !rest.is_empty() {
            let now = Instant::now();
            if now.duration_since(self.window_start) >= Duration::from_secs(1) {
                self.window_start = now;
                self.window_sent = 0;
            }
            let allowance = self.throttle.saturating_sub(self.window_sent);
            if allowance == 0 {
                if self.stop.load(Ordering::Acquire) {
                    return Err(BodyError::Stopped);
                }
                let window_end = self.window_start + Duration::from_secs(1);
                thread::sleep(window_end.saturating_duration_since(now).min(POLL_QUANTUM));
                continue;
            }
            let n = rest.len().min(usize::try_from(allowance).unwrap_or(usize::MAX));
            self.write_all_polled(&rest[..n])?;
            self.window_sent += n as u64;
            rest = &rest[n..];
        }
        Ok(())
    }

    fn write_all_polled(&mut self, mut data: &[u8]) -> Result<(), BodyError> {
        let since = Instant::now();
        let total = data.len() as u64;
        let Some(transport) = self.transport.as_mut() else {
            return Err(BodyError::Detached);
        };
        while !data.is_empty() {
            match transport.write(data) {
                Ok(0) => {
                    self.must_close = true;
                    return Err(io::Error::from(ErrorKind::WriteZero).into());
                }
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if is_poll_timeout(&e) => {
                    if self.stop.load(Ordering::Acquire) {
                        self.must_close = true;
                        return Err(BodyError::Stopped);
                    }
                    if since.elapsed() >= self.limits.request_timeout {
                        self.must_close = true;
                        return Err(BodyError::Timeout);
                    }
                }
                Err(e) => {
                    self.must_close = true;
                    return Err(e.into());
                }
            }
        }
        if let Err(e) = transport.flush() {
            self.must_close = true;
            return Err(e.into());
        }
        self.stats.add_bytes_sent(total);
        Ok(())
    }
}

fn is_poll_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// In-memory transport: reads come from a script, writes are captured.
    pub(crate) struct ScriptedTransport {
        reads: VecDeque<Vec<u8>>,
        written: Arc<Mutex<Vec<u8>>>,
        block_when_empty: bool,
    }

    impl ScriptedTransport {
        pub(crate) fn new(reads: &[&[u8]]) -> (Self, Arc<Mutex<Vec<u8>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            let transport = Self {
                reads: reads.iter().map(|r| r.to_vec()).collect(),
                written: Arc::clone(&written),
                block_when_empty: false,
            };
            (transport, written)
        }

        pub(crate) fn blocking(mut self) -> Self {
            self.block_when_empty = true;
            self
        }
    }

    impl Read for ScriptedTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Some(mut chunk) = self.reads.pop_front() else {
                if self.block_when_empty {
                    thread::sleep(Duration::from_millis(2));
                    return Err(ErrorKind::WouldBlock.into());
                }
                return Ok(0);
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                self.reads.push_front(chunk.split_off(n));
            }
            Ok(n)
        }
    }

    impl Write for ScriptedTransport {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for ScriptedTransport {
        fn set_poll_quantum(&mut self, _: Duration) -> io::Result<()> {
            Ok(())
        }

        fn shutdown(&mut self) {}
    }

    pub(crate) fn limits() -> Limits {
        Limits {
            max_request_size: 4096,
            request_timeout: Duration::from_millis(200),
            keep_alive_timeout: Duration::from_millis(50),
            enable_keep_alive: true,
        }
    }

    pub(crate) fn connection_with(reads: &[&[u8]]) -> (Connection, Arc<Mutex<Vec<u8>>>) {
        let (transport, written) = ScriptedTransport::new(reads);
        let mut conn = Connection::new(
            limits(),
            Arc::new(AtomicBool::new(false)),
            Arc::new(ServerStats::default()),
        )
        .unwrap();
        conn.attach(Box::new(transport), PeerInfo::default());
        (conn, written)
    }

    fn output(written: &Arc<Mutex<Vec<u8>>>) -> String {
        String::from_utf8(written.lock().unwrap().clone()).unwrap()
    }

    fn read_all(conn: &mut Connection) -> Vec<u8> {
        let mut body = Vec::new();
        let mut chunk = [0u8; 3];
        loop {
            let n = conn.read_body(&mut chunk).unwrap();
            if n == 0 {
                return body;
            }
            body.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn keep_alive_matrix() {
        use Version::{Http10, Http11};
        let cases = [
            (Http11, None, true, true),
            (Http11, Some("keep-alive"), true, true),
            (Http11, Some("close"), true, false),
            (Http10, None, true, false),
            (Http10, Some("keep-alive"), true, true),
            (Http10, Some("close"), true, false),
            (Http11, None, false, false),
            (Http11, Some("keep-alive"), false, false),
            (Http11, Some("close"), false, false),
            (Http10, None, false, false),
            (Http10, Some("keep-alive"), false, false),
            (Http10, Some("close"), false, false),
        ];
        for (version, header, enabled, expected) in cases {
            assert_eq!(
                keep_alive_decision(false, enabled, version, header),
                expected,
                "{version} {header:?} enabled={enabled}"
            );
            assert!(!keep_alive_decision(true, enabled, version, header));
        }
    }

    #[test]
    fn drain_discards_exactly_the_unread_body() {
        let (mut conn, _) =
            connection_with(&[b"POST /a HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789GET /b HTTP/1.1\r\n\r\n"]);
        conn.read_head().unwrap();
        let mut first = [0u8; 4];
        assert_eq!(conn.read_body(&mut first).unwrap(), 4);
        let before = conn.buffered();
        let drained = conn.drain_body();
        assert_eq!(drained, 10 - 4);
        assert_eq!(conn.buffered(), before - drained as usize);
        conn.reset_request();
        conn.complete_request();
        let next = conn.read_head().unwrap();
        assert_eq!(next.uri, "/b");
    }

    #[test]
    fn chunked_body_leaves_next_request_intact() {
        let (mut conn, _) = connection_with(&[
            b"POST /api HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nab",
            b"cd\r\n0\r\n\r\nGET /next HTTP/1.1\r\n\r\n",
        ]);
        conn.read_head().unwrap();
        assert_eq!(conn.chunk_state(), ChunkState::NoDataYet);
        assert_eq!(read_all(&mut conn), b"abcd");
        assert_eq!(conn.chunk_state(), ChunkState::Done);
        assert_eq!(conn.drain_body(), 0);
        conn.reset_request();
        conn.complete_request();
        assert_eq!(conn.read_head().unwrap().uri, "/next");
    }

    #[test]
    fn content_length_resolution_order() {
        let (mut conn, _) = connection_with(&[b"GET / HTTP/1.1\r\n\r\n"]);
        conn.read_head().unwrap();
        assert_eq!(conn.content_length(), Some(0));

        let (mut conn, _) = connection_with(&[b"POST / HTTP/1.1\r\n\r\n"]);
        conn.read_head().unwrap();
        assert_eq!(conn.content_length(), None);
        assert!(conn.must_close());

        let (mut conn, _) =
            connection_with(&[b"POST / HTTP/1.1\r\nContent-Length: 2\r\nTransfer-Encoding: chunked\r\n\r\n"]);
        assert!(matches!(
            conn.read_head(),
            Err(HeadError::Parse(ParseError::ConflictingLength))
        ));

        let (mut conn, _) = connection_with(&[b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n"]);
        let err = conn.read_head().unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::NotImplemented));
    }

    #[test]
    fn unknown_length_body_ends_at_eof() {
        let (mut conn, _) = connection_with(&[b"POST / HTTP/1.0\r\n\r\nraw bytes"]);
        conn.read_head().unwrap();
        assert_eq!(read_all(&mut conn), b"raw bytes");
        assert!(!conn.should_keep_alive());
    }

    #[test]
    fn short_body_is_an_error() {
        let (mut conn, _) = connection_with(&[b"PUT /f HTTP/1.1\r\nContent-Length: 5\r\n\r\nab"]);
        conn.read_head().unwrap();
        let mut out = [0u8; 8];
        assert_eq!(conn.read_body(&mut out).unwrap(), 2);
        assert!(matches!(conn.read_body(&mut out), Err(BodyError::UnexpectedEof)));
        assert!(conn.must_close());
    }

    #[test]
    fn expect_continue_sent_before_first_body_read() {
        let (mut conn, written) = connection_with(&[
            b"PUT /f HTTP/1.1\r\nContent-Length: 2\r\nExpect: 100-continue\r\n\r\n",
            b"ok",
        ]);
        conn.read_head().unwrap();
        assert!(output(&written).is_empty());
        assert_eq!(read_all(&mut conn), b"ok");
        assert!(output(&written).starts_with("HTTP/1.1 100 Continue\r\n\r\n"));
    }

    #[test]
    fn unread_body_after_unanswered_expect_forces_close() {
        let (mut conn, written) = connection_with(&[
            b"PUT /f HTTP/1.1\r\nContent-Length: 2\r\nExpect: 100-continue\r\n\r\n",
        ]);
        conn.read_head().unwrap();
        assert_eq!(conn.drain_body(), 0);
        assert!(conn.must_close());
        assert!(output(&written).is_empty());
    }

    #[test]
    fn other_expectations_fail() {
        let (mut conn, _) = connection_with(&[b"PUT /f HTTP/1.1\r\nContent-Length: 2\r\nExpect: magic\r\n\r\n"]);
        assert!(matches!(conn.read_head(), Err(HeadError::ExpectationFailed)));
    }

    #[test]
    fn eof_before_any_byte_is_a_silent_close() {
        let (mut conn, _) = connection_with(&[]);
        assert!(matches!(conn.read_head(), Err(HeadError::Closed)));
        let (mut conn, _) = connection_with(&[b"GET / HT"]);
        assert_eq!(
            conn.read_head().unwrap_err().status(),
            Some(StatusCode::BadRequest)
        );
    }

    #[test]
    fn partial_head_times_out_with_408() {
        let (transport, _) = ScriptedTransport::new(&[b"GET / HTTP/1.1\r\n"]);
        let mut conn = Connection::new(
            limits(),
            Arc::new(AtomicBool::new(false)),
            Arc::new(ServerStats::default()),
        )
        .unwrap();
        conn.attach(Box::new(transport.blocking()), PeerInfo::default());
        let err = conn.read_head().unwrap_err();
        assert_eq!(err.status(), Some(StatusCode::RequestTimeout));
    }

    #[test]
    fn idle_keep_alive_connection_closes_silently() {
        let (transport, _) = ScriptedTransport::new(&[]);
        let mut conn = Connection::new(
            limits(),
            Arc::new(AtomicBool::new(false)),
            Arc::new(ServerStats::default()),
        )
        .unwrap();
        conn.attach(Box::new(transport.blocking()), PeerInfo::default());
        conn.complete_request();
        let started = Instant::now();
        assert!(matches!(conn.read_head(), Err(HeadError::Idle)));
        assert!(started.elapsed() < limits().request_timeout);
    }

    #[test]
    fn stop_flag_interrupts_head_read() {
        let (transport, _) = ScriptedTransport::new(&[]);
        let stop = Arc::new(AtomicBool::new(true));
        let mut conn =
            Connection::new(limits(), stop, Arc::new(ServerStats::default())).unwrap();
        conn.attach(Box::new(transport.blocking()), PeerInfo::default());
        assert!(matches!(conn.read_head(), Err(HeadError::Stopped)));
    }

    #[test]
    fn oversized_head_is_413() {
        let mut huge = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        huge.resize(5000, b'a');
        let (mut conn, _) = connection_with(&[&huge]);
        assert!(matches!(conn.read_head(), Err(HeadError::TooLarge)));
    }

    #[test]
    fn head_request_suppresses_body_bytes() {
        let (mut conn, written) = connection_with(&[b"HEAD /f HTTP/1.1\r\n\r\n"]);
        conn.read_head().unwrap();
        conn.send_response(Response::new(StatusCode::Ok).body("hello")).unwrap();
        let out = output(&written);
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
        assert!(conn.should_keep_alive());
    }

    #[test]
    fn chunked_response_framing() {
        let (mut conn, written) = connection_with(&[b"GET / HTTP/1.1\r\n\r\n"]);
        conn.read_head().unwrap();
        conn.send_head(&mut Response::new(StatusCode::Ok), Framing::Chunked).unwrap();
        conn.write_body(b"hello").unwrap();
        conn.finish_response().unwrap();
        let out = output(&written);
        assert!(out.contains("Transfer-Encoding: chunked\r\n"));
        assert!(out.ends_with("\r\n\r\n5\r\nhello\r\n0\r\n\r\n"));
        assert!(conn.should_keep_alive());
        assert!(matches!(
            conn.send_head(&mut Response::new(StatusCode::Ok), Framing::Chunked),
            Err(BodyError::HeadersAlreadySent)
        ));
    }

    #[test]
    fn chunked_falls_back_to_close_for_http10() {
        let (mut conn, written) = connection_with(&[b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n"]);
        conn.read_head().unwrap();
        conn.send_head(&mut Response::new(StatusCode::Ok), Framing::Chunked).unwrap();
        conn.write_body(b"x").unwrap();
        let out = output(&written);
        assert!(!out.contains("chunked"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(out.ends_with("\r\n\r\nx"));
    }

    #[test]
    fn handler_connection_header_cannot_contradict_the_decision() {
        let (mut conn, written) = connection_with(&[b"GET / HTTP/1.0\r\n\r\n"]);
        conn.read_head().unwrap();
        conn.send_response(Response::new(StatusCode::Ok).header("Connection", "keep-alive").body("x"))
            .unwrap();
        let out = output(&written);
        assert!(out.contains("Connection: close\r\n"), "{out}");
        assert!(!out.contains("Connection: keep-alive"));
        assert!(!conn.should_keep_alive());
    }

    #[test]
    fn handler_close_is_honoured_on_a_persistent_connection() {
        let (mut conn, written) = connection_with(&[b"GET / HTTP/1.1\r\n\r\n"]);
        conn.read_head().unwrap();
        conn.send_response(Response::new(StatusCode::Ok).header("Connection", "close"))
            .unwrap();
        let out = output(&written);
        assert_eq!(out.matches("Connection: close\r\n").count(), 1, "{out}");
        assert!(!conn.should_keep_alive());
    }

    #[test]
    fn truncated_body_forces_close() {
        let (mut conn, _) = connection_with(&[b"GET / HTTP/1.1\r\n\r\n"]);
        conn.read_head().unwrap();
        conn.send_head(&mut Response::new(StatusCode::Ok), Framing::Length(10)).unwrap();
        conn.write_body(b"short").unwrap();
        conn.finish_response().unwrap();
        assert!(!conn.should_keep_alive());
    }

    #[test]
    fn decorations_are_added_once() {
        let (mut conn, written) = connection_with(&[b"GET / HTTP/1.1\r\n\r\n"]);
        conn.read_head().unwrap();
        conn.set_decorations(vec![
            ("X-Frame-Options".into(), "DENY".into()),
            ("X-Custom".into(), "default".into()),
        ]);
        conn.send_response(Response::new(StatusCode::Ok).header("X-Custom", "mine"))
            .unwrap();
        let out = output(&written);
        assert!(out.contains("X-Frame-Options: DENY\r\n"));
        assert!(out.contains("X-Custom: mine\r\n"));
        assert!(!out.contains("X-Custom: default"));
    }

    #[test]
    fn throttle_spreads_writes_over_windows() {
        let (mut conn, written) = connection_with(&[b"GET / HTTP/1.1\r\n\r\n"]);
        conn.read_head().unwrap();
        conn.set_throttle(4);
        conn.send_head(&mut Response::new(StatusCode::Ok), Framing::Length(6)).unwrap();
        let started = Instant::now();
        conn.write_body(b"abcdef").unwrap();
        assert!(started.elapsed() >= Duration::from_millis(700));
        assert!(output(&written).ends_with("abcdef"));
    }
}
