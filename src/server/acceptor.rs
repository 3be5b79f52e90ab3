//! The master thread: polls every listening socket and feeds the queue.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, warn};

use super::queue::{Socket, SocketQueue};
use crate::context::Context;

/// Token of the stop waker. Listener `i` uses `Token(i + 1)`.
const WAKER: Token = Token(0);

/// A bound listening socket.
#[derive(Debug)]
pub(crate) struct Listener {
    pub(crate) socket: TcpListener,
    pub(crate) addr: SocketAddr,
    pub(crate) is_secure: bool,
    pub(crate) redirect_to_tls: bool,
}

pub(crate) struct Acceptor {
    poll: Poll,
    listeners: Vec<Listener>,
    queue: Arc<SocketQueue>,
    ctx: Arc<Context>,
}

impl Acceptor {
    /// Registers the listeners and returns the acceptor with the waker that
    /// interrupts it.
    pub(crate) fn new(
        listeners: Vec<Listener>,
        queue: Arc<SocketQueue>,
        ctx: Arc<Context>,
    ) -> io::Result<(Self, Waker)> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        for (i, listener) in listeners.iter().enumerate() {
            listener.socket.set_nonblocking(true)?;
            let fd = listener.socket.as_raw_fd();
            poll.registry()
                .register(&mut SourceFd(&fd), Token(i + 1), Interest::READABLE)?;
        }
        Ok((
            Self {
                poll,
                listeners,
                queue,
                ctx,
            },
            waker,
        ))
    }

    /// Runs until the stop flag is set. Dropping the listeners closes them.
    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(64);
        info!(listeners = self.listeners.len(), "acceptor running");
        while !self.ctx.is_stopping() {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "polling listening sockets failed");
                break;
            }
            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    Token(n) => self.accept_all(n - 1),
                }
            }
        }
        for listener in &self.listeners {
            let fd = listener.socket.as_raw_fd();
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
        info!("acceptor stopped, listening sockets closed");
    }

    fn accept_all(&self, index: usize) {
        let Some(listener) = self.listeners.get(index) else {
            return;
        };
        loop {
            if self.ctx.is_stopping() {
                return;
            }
            match listener.socket.accept() {
                Ok((stream, remote)) => self.hand_off(listener, stream, remote),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    error!(addr = %listener.addr, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn hand_off(&self, listener: &Listener, stream: std::net::TcpStream, remote: SocketAddr) {
        let domain = self.ctx.default_domain();
        let config = domain.config();
        if !config.access_control_list.allows(remote.ip()) {
            warn!(peer = %remote, "connection refused by access control list");
            return;
        }
        if let Err(e) = stream.set_nonblocking(false) {
            debug!(peer = %remote, error = %e, "failed to make socket blocking");
            return;
        }
        if config.tcp_nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %remote, error = %e, "failed to set TCP_NODELAY");
            }
        }
        let local = stream.local_addr().unwrap_or(listener.addr);
        debug!(peer = %remote, local = %local, "connection accepted");
        let socket = Socket {
            stream,
            remote,
            local,
            is_secure: listener.is_secure,
            redirect_to_tls: listener.redirect_to_tls,
        };
        if let Err(socket) = self.queue.produce(socket) {
            debug!(peer = %socket.remote, "server stopping, dropping accepted socket");
        }
    }
}
