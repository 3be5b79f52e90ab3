//! Serves a directory, with a JSON stats endpoint and a websocket echo.
//!
//! ```text
//! cargo run --example file_server -- ./public 8080
//! RUST_LOG=wharf=debug cargo run --example file_server
//! ```

use std::io::BufRead;
use std::sync::{Arc, Weak};

use tracing::info;
use tracing_subscriber::EnvFilter;
use wharf::context::Context;
use wharf::dispatch::Exchange;
use wharf::realtime::{Opcode, WebSocket, WebSocketHandler};
use wharf::router::Reply;
use wharf::{Config, Response, Server, StatusCode};

struct Echo;

impl WebSocketHandler for Echo {
    fn ready(&self, ws: &mut WebSocket<'_>) {
        let _ = ws.send_text("connected");
    }

    fn data(&self, ws: &mut WebSocket<'_>, opcode: Opcode, data: &[u8]) -> bool {
        ws.send(opcode, data).is_ok()
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wharf=info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let root = args.next().unwrap_or_else(|| ".".to_owned());
    let port = args.next().unwrap_or_else(|| "8080".to_owned());

    let config = Config::from_options([
        ("listening_ports", format!("127.0.0.1:{port}")),
        ("document_root", root.clone()),
        ("num_threads", "8".to_owned()),
    ])?;
    let server = Server::start(config)?;

    let ctx: Weak<Context> = Arc::downgrade(server.context());
    server.set_request_handler(
        "/_stats",
        Some(Arc::new(move |_: &mut Exchange<'_>| {
            let Some(ctx) = ctx.upgrade() else {
                return Reply::from(Response::error(StatusCode::ServiceUnavailable));
            };
            match serde_json::to_string(&ctx.stats().snapshot()) {
                Ok(json) => Reply::from(
                    Response::new(StatusCode::Ok)
                        .header("Content-Type", "application/json")
                        .body(json),
                ),
                Err(_) => Reply::from(Response::error(StatusCode::InternalServerError)),
            }
        })),
    )?;
    server.set_websocket_handler("/_echo", Some(Arc::new(Echo)))?;

    info!(root = %root, address = %server.ports()[0], "serving; press Enter to stop");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    server.stop();
    Ok(())
}
