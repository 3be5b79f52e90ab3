#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use wharf::{Config, Server};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// A server on an ephemeral loopback port serving `root`.
pub fn serve(root: Option<&Path>, extra: &[(&str, &str)]) -> Server {
    init_tracing();
    let mut options = vec![
        ("listening_ports".to_owned(), "127.0.0.1:0".to_owned()),
        ("num_threads".to_owned(), "4".to_owned()),
    ];
    if let Some(root) = root {
        options.push(("document_root".to_owned(), root.display().to_string()));
    }
    options.extend(extra.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())));
    Server::start(Config::from_options(options).unwrap()).unwrap()
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

/// One parsed response.
#[derive(Debug)]
pub struct Reply {
    pub head: String,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn status(&self) -> u16 {
        self.head[9..12].parse().unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim())
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Reads exactly one response off a persistent connection. Handles
/// `Content-Length`, chunked and close-delimited bodies.
pub fn read_reply(stream: &mut TcpStream, head_request: bool) -> Reply {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert!(n > 0, "connection closed inside a response head: {:?}", String::from_utf8_lossy(&buf));
        buf.push(byte[0]);
    }
    let reply = Reply {
        head: String::from_utf8(buf).unwrap(),
        body: Vec::new(),
    };
    let status = reply.status();
    if head_request || status == 304 || status == 204 || status < 200 {
        return reply;
    }

    let body = if let Some(len) = reply.header("content-length") {
        let mut body = vec![0u8; len.parse().unwrap()];
        stream.read_exact(&mut body).unwrap();
        body
    } else if reply
        .header("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        read_chunked(stream)
    } else {
        let mut body = Vec::new();
        stream.read_to_end(&mut body).unwrap();
        body
    };
    Reply { body, ..reply }
}

fn read_line(stream: &mut TcpStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    while !line.ends_with(b"\r\n") {
        stream.read_exact(&mut byte).unwrap();
        line.push(byte[0]);
    }
    String::from_utf8(line).unwrap().trim_end().to_owned()
}

fn read_chunked(stream: &mut TcpStream) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let size = usize::from_str_radix(read_line(stream).split(';').next().unwrap(), 16).unwrap();
        if size == 0 {
            read_line(stream);
            return body;
        }
        let mut chunk = vec![0u8; size];
        stream.read_exact(&mut chunk).unwrap();
        body.extend_from_slice(&chunk);
        read_line(stream);
    }
}

/// Sends `raw` on a fresh connection and reads one response.
pub fn request(addr: SocketAddr, raw: &str) -> Reply {
    let mut stream = connect(addr);
    stream.write_all(raw.as_bytes()).unwrap();
    read_reply(&mut stream, raw.starts_with("HEAD "))
}

/// `true` once the peer has closed: a read returns EOF.
pub fn is_closed(stream: &mut TcpStream) -> bool {
    let mut byte = [0u8; 1];
    matches!(stream.read(&mut byte), Ok(0))
}
