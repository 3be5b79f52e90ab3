//! Hand-off of accepted sockets from the acceptor to idle workers.
//!
//! Every worker owns a single-socket slot. The acceptor pops an idle worker
//! off a stack and drops the socket into that worker's slot, so a socket is
//! never queued behind a busy worker.

use std::net::{SocketAddr, TcpStream};
use std::sync::{Condvar, Mutex};

use crate::sync::{lock, wait};

/// An accepted client socket and what the acceptor learned about it.
#[derive(Debug)]
pub struct Socket {
    pub stream: TcpStream,
    pub remote: SocketAddr,
    pub local: SocketAddr,
    pub is_secure: bool,
    /// Plain port whose requests are answered with a redirect to TLS.
    pub redirect_to_tls: bool,
}

struct Slot {
    socket: Mutex<Option<Socket>>,
    filled: Condvar,
}

struct Idle {
    workers: Vec<usize>,
    stopped: bool,
}

pub struct SocketQueue {
    idle: Mutex<Idle>,
    has_idle: Condvar,
    slots: Vec<Slot>,
}

impl SocketQueue {
    pub fn new(workers: usize) -> Self {
        Self {
            idle: Mutex::new(Idle {
                workers: Vec::with_capacity(workers),
                stopped: false,
            }),
            has_idle: Condvar::new(),
            slots: (0..workers)
                .map(|_| Slot {
                    socket: Mutex::new(None),
                    filled: Condvar::new(),
                })
                .collect(),
        }
    }

    /// Hands `socket` to an idle worker, waiting for one if all are busy.
    /// Gives the socket back once the queue is stopped.
    pub fn produce(&self, socket: Socket) -> Result<(), Socket> {
        let mut idle = lock(&self.idle);
        let worker = loop {
            if idle.stopped {
                return Err(socket);
            }
            if let Some(worker) = idle.workers.pop() {
                break worker;
            }
            idle = wait(&self.has_idle, idle);
        };
        drop(idle);

        let Some(slot) = self.slots.get(worker) else {
            return Err(socket);
        };
        *lock(&slot.socket) = Some(socket);
        slot.filled.notify_one();
        Ok(())
    }

    /// Marks `worker` idle and blocks until a socket arrives. `None` once
    /// the queue is stopped and the slot is empty.
    pub fn consume(&self, worker: usize) -> Option<Socket> {
        let slot = self.slots.get(worker)?;
        {
            let mut idle = lock(&self.idle);
            if idle.stopped {
                return lock(&slot.socket).take();
            }
            idle.workers.push(worker);
        }
        self.has_idle.notify_one();

        let mut socket = lock(&slot.socket);
        loop {
            if let Some(socket) = socket.take() {
                return Some(socket);
            }
            if lock(&self.idle).stopped {
                return None;
            }
            socket = wait(&slot.filled, socket);
        }
    }

    /// Wakes every producer and consumer. Sockets already in a slot are
    /// still delivered.
    pub fn stop(&self) {
        lock(&self.idle).stopped = true;
        self.has_idle.notify_all();
        for slot in &self.slots {
            // Taking the slot lock orders the flag store before a consumer's
            // check-then-wait.
            drop(lock(&slot.socket));
            slot.filled.notify_all();
        }
    }

    pub fn workers(&self) -> usize {
        self.slots.len()
    }
}
