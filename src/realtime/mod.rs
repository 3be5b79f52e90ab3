//! WebSocket endpoints.
//!
//! A request carrying `Upgrade: websocket` is routed to a
//! [`WebSocketHandler`]. After a successful handshake the connection
//! belongs to the session; it is closed when the session ends.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, trace};

use crate::connection::{BodyError, Connection};
use crate::dispatch::{Exchange, send};
use crate::http::response::Framing;
use crate::http::{Request, Response, StatusCode};

pub mod frame;

pub use frame::{Frame, FrameError, Opcode, close_code};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest message accepted from a client, after reassembly.
pub const MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;

/// Callbacks for one websocket endpoint.
pub trait WebSocketHandler: Send + Sync {
    /// Decides whether to accept the upgrade. Refusing hands the request to
    /// file resolution.
    fn connect(&self, _request: &Request) -> bool {
        true
    }

    /// Runs once the handshake response has been sent.
    fn ready(&self, _ws: &mut WebSocket<'_>) {}

    /// A complete text or binary message. Returning `false` closes the
    /// session.
    fn data(&self, ws: &mut WebSocket<'_>, opcode: Opcode, data: &[u8]) -> bool;

    /// The session is over.
    fn close(&self, _request: &Request) {}
}

#[derive(Debug, Error)]
pub enum WebSocketError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] BodyError),

    #[error("a close frame was already sent")]
    Closed,
}

/// `Sec-WebSocket-Accept` for a client key.
///
/// ```
/// assert_eq!(
///     wharf::realtime::accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// `true` for `Upgrade: websocket` with `Connection: upgrade`.
pub fn is_upgrade_request(request: &Request) -> bool {
    let headers = request.headers();
    headers.has_token("upgrade", "websocket") && headers.has_token("connection", "upgrade")
}

/// Checks the handshake fields. Returns the client key, or the error
/// response to send.
pub fn validate_handshake(request: &Request) -> Result<&str, Response> {
    let headers = request.headers();
    let Some(key) = headers.get("sec-websocket-key").filter(|k| !k.trim().is_empty()) else {
        return Err(Response::error(StatusCode::BadRequest));
    };
    if headers.get("sec-websocket-version").map(str::trim) != Some("13") {
        return Err(Response::from_code(426, "Upgrade Required")
            .header("Sec-WebSocket-Version", "13")
            .keep_alive(false));
    }
    Ok(key)
}

/// An open websocket session.
pub struct WebSocket<'a> {
    conn: &'a mut Connection,
    request: &'a Request,
    buf: BytesMut,
    timeout: Duration,
    close_sent: bool,
}

impl<'a> WebSocket<'a> {
    fn new(conn: &'a mut Connection, request: &'a Request, timeout: Duration) -> Self {
        Self {
            conn,
            request,
            buf: BytesMut::with_capacity(4096),
            timeout,
            close_sent: false,
        }
    }

    /// The upgrade request that opened this session.
    pub fn request(&self) -> &Request {
        self.request
    }

    pub fn send(&mut self, opcode: Opcode, data: &[u8]) -> Result<(), WebSocketError> {
        if self.close_sent {
            return Err(WebSocketError::Closed);
        }
        if opcode == Opcode::Close {
            self.close_sent = true;
        }
        self.conn.write_raw(&frame::encode(opcode, data, true, None))?;
        Ok(())
    }

    pub fn send_text(&mut self, text: &str) -> Result<(), WebSocketError> {
        self.send(Opcode::Text, text.as_bytes())
    }

    pub fn send_binary(&mut self, data: &[u8]) -> Result<(), WebSocketError> {
        self.send(Opcode::Binary, data)
    }

    /// Sends a close frame. Later sends fail with [`WebSocketError::Closed`].
    pub fn close(&mut self, code: u16, reason: &str) -> Result<(), WebSocketError> {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        self.send(Opcode::Close, &payload)
    }

    pub fn is_closed(&self) -> bool {
        self.close_sent
    }

    fn next_frame(&mut self) -> Result<Option<Frame>, WebSocketError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(frame) = frame::decode(&mut self.buf, MAX_MESSAGE_SIZE, true)? {
                return Ok(Some(frame));
            }
            let n = self.conn.read_raw(&mut chunk, self.timeout)?;
            if n == 0 {
                return Ok(None);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn close_quietly(&mut self, code: u16) {
        if self.close_sent {
            return;
        }
        if let Err(e) = self.close(code, "") {
            debug!(error = %e, "failed to send websocket close");
        }
    }
}

/// Performs the handshake and runs the session. Returns `false` only when
/// the handler refused the connection and nothing was sent.
pub(crate) fn serve(ex: &mut Exchange<'_>, handler: &dyn WebSocketHandler) -> bool {
    let request = ex.request();
    let key = match validate_handshake(request) {
        Ok(key) => key,
        Err(response) => {
            send(ex.connection(), response);
            return true;
        }
    };
    if !handler.connect(request) {
        return false;
    }

    let response = Response::new(StatusCode::SwitchingProtocols)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", accept_key(key));
    ex.close_connection();
    if let Err(e) = ex.start_response(response, Framing::Length(0)) {
        debug!(error = %e, "failed to send websocket handshake");
        return true;
    }

    let timeout = ex.domain().config().websocket_timeout;
    let mut ws = WebSocket::new(ex.connection(), request, timeout);
    debug!(uri = %request.path(), "websocket session open");
    handler.ready(&mut ws);
    if !ws.is_closed() {
        run_session(&mut ws, handler);
    }
    handler.close(request);
    debug!(uri = %request.path(), "websocket session closed");
    true
}

fn run_session(ws: &mut WebSocket<'_>, handler: &dyn WebSocketHandler) {
    // Opcode and collected payload of a fragmented message in progress.
    let mut partial: Option<(Opcode, BytesMut)> = None;
    loop {
        let frame = match ws.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(WebSocketError::Frame(e)) => {
                debug!(error = %e, "websocket protocol error");
                ws.close_quietly(e.close_code());
                break;
            }
            Err(WebSocketError::Io(BodyError::Timeout)) => {
                debug!("websocket read timed out");
                ws.close_quietly(close_code::GOING_AWAY);
                break;
            }
            Err(WebSocketError::Io(BodyError::Stopped)) => {
                ws.close_quietly(close_code::GOING_AWAY);
                break;
            }
            Err(e) => {
                debug!(error = %e, "websocket read failed");
                break;
            }
        };
        trace!(opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "websocket frame");

        let message = match frame.opcode {
            Opcode::Ping => {
                if ws.send(Opcode::Pong, &frame.payload).is_err() {
                    break;
                }
                continue;
            }
            Opcode::Pong => continue,
            Opcode::Close => {
                if !ws.close_sent {
                    let code = frame.payload.get(..2).unwrap_or(&[]);
                    if let Err(e) = ws.send(Opcode::Close, code) {
                        debug!(error = %e, "failed to echo websocket close");
                    }
                }
                break;
            }
            Opcode::Text | Opcode::Binary => {
                if partial.is_some() {
                    ws.close_quietly(close_code::PROTOCOL_ERROR);
                    break;
                }
                if frame.fin {
                    (frame.opcode, frame.payload)
                } else {
                    partial = Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                    continue;
                }
            }
            Opcode::Continuation => {
                let Some((_, collected)) = partial.as_mut() else {
                    ws.close_quietly(close_code::PROTOCOL_ERROR);
                    break;
                };
                if (collected.len() + frame.payload.len()) as u64 > MAX_MESSAGE_SIZE {
                    ws.close_quietly(close_code::TOO_LARGE);
                    break;
                }
                collected.extend_from_slice(&frame.payload);
                if !frame.fin {
                    continue;
                }
                match partial.take() {
                    Some((opcode, collected)) => (opcode, collected.freeze()),
                    None => continue,
                }
            }
        };

        let (opcode, payload): (Opcode, Bytes) = message;
        if opcode == Opcode::Text && std::str::from_utf8(&payload).is_err() {
            ws.close_quietly(close_code::INVALID_DATA);
            break;
        }
        if !handler.data(ws, opcode, &payload) {
            ws.close_quietly(close_code::NORMAL);
            break;
        }
        if ws.is_closed() {
            break;
        }
    }
}
