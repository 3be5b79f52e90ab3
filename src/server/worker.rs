//! Worker threads: take a socket from the queue and serve it until the
//! connection closes.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, warn};

use super::queue::{Socket, SocketQueue};
use crate::connection::{Connection, HeadError, Limits, PeerInfo, TlsTransport, Transport};
use crate::context::Context;
use crate::dispatch;

/// Starts `count` workers sharing `queue`.
pub(crate) fn spawn_workers(
    count: usize,
    queue: &Arc<SocketQueue>,
    ctx: &Arc<Context>,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    (0..count)
        .map(|index| {
            let queue = Arc::clone(queue);
            let ctx = Arc::clone(ctx);
            thread::Builder::new()
                .name(format!("wharf-worker-{index}"))
                .spawn(move || run(index, &queue, &ctx))
        })
        .collect()
}

fn run(index: usize, queue: &SocketQueue, ctx: &Context) {
    let limits = Limits::from(ctx.default_domain().config());
    let mut conn = match Connection::new(limits, Arc::clone(ctx.stop_flag()), Arc::clone(ctx.stats())) {
        Ok(conn) => conn,
        Err(e) => {
            error!(worker = index, error = %e, "cannot allocate connection buffer, worker exiting");
            return;
        }
    };
    debug!(worker = index, "worker ready");

    while let Some(socket) = queue.consume(index) {
        ctx.stats().connection_opened();
        serve_socket(index, ctx, &mut conn, socket);
        ctx.stats().connection_closed();
    }
    info!(worker = index, "worker exiting");
}

fn serve_socket(index: usize, ctx: &Context, conn: &mut Connection, socket: Socket) {
    let Socket {
        stream,
        remote,
        local,
        is_secure,
        redirect_to_tls,
    } = socket;

    let mut peer = PeerInfo {
        remote: Some(remote),
        local: Some(local),
        is_secure,
        redirect_to_tls,
        server_name: None,
    };
    let transport: Box<dyn Transport> = if is_secure {
        let Some(provider) = ctx.tls() else {
            warn!(worker = index, peer = %remote, "no TLS provider for secure port, dropping");
            return;
        };
        match provider.handshake(stream, &ctx.domain_names()) {
            Ok(session) => {
                peer.server_name = session.server_name().map(str::to_owned);
                Box::new(TlsTransport(session))
            }
            Err(e) => {
                warn!(worker = index, peer = %remote, error = %e, "TLS handshake failed");
                return;
            }
        }
    } else {
        Box::new(stream)
    };

    conn.attach(transport, peer);
    process_connection(ctx, conn);
    conn.detach();
    debug!(worker = index, peer = %remote, "connection closed");
}

/// Serves requests on an attached connection while keep-alive allows.
pub(crate) fn process_connection(ctx: &Context, conn: &mut Connection) {
    loop {
        let head = match conn.read_head() {
            Ok(head) => head,
            Err(e) => {
                match e.status() {
                    Some(status) => {
                        warn!(peer = ?conn.peer().remote, error = %e, "bad request");
                        dispatch::reject(conn, status);
                    }
                    None if matches!(e, HeadError::Io(_)) => {
                        debug!(peer = ?conn.peer().remote, error = %e, "read failed");
                    }
                    None => {}
                }
                return;
            }
        };

        dispatch::handle_request(ctx, conn, head);

        let mut keep_alive = conn.should_keep_alive();
        if keep_alive {
            conn.drain_body();
            keep_alive = !conn.must_close();
        }
        conn.reset_request();
        conn.complete_request();
        if !keep_alive || ctx.is_stopping() {
            return;
        }
    }
}
