//! # wharf
//!
//! An embeddable HTTP/1.1 server engine: a thread-pooled request pipeline
//! with static files, CGI, WebSocket endpoints, virtual hosts and an
//! authorization gate.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use wharf::config::Config;
//! use wharf::dispatch::Exchange;
//! use wharf::router::Reply;
//! use wharf::{Response, Server, StatusCode};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_options([
//!         ("listening_ports", "127.0.0.1:8080"),
//!         ("document_root", "./public"),
//!     ])?;
//!     let server = Server::start(config)?;
//!     server.set_request_handler(
//!         "/hello",
//!         Some(Arc::new(|_: &mut Exchange<'_>| {
//!             Reply::from(Response::new(StatusCode::Ok).body("Hello, World!"))
//!         })),
//!     )?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     std::thread::park();
//!     server.stop();
//!     Ok(())
//! }
//! ```

// ── Protocol and connection layer ─────────────────────────────────────────────
pub mod connection;
pub mod http;

// ── Request pipeline ──────────────────────────────────────────────────────────
pub mod cgi;
pub mod dispatch;
pub mod realtime;
pub mod router;
pub mod security;

// ── Server machinery ──────────────────────────────────────────────────────────
pub mod background;
pub mod config;
pub mod context;
pub mod server;
pub mod tls;

mod sync;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::Config;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};
