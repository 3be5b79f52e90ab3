//! Static file serving under `document_root`.

use std::fs::{self, File, Metadata};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use super::{Exchange, authorize, send, send_error};
use crate::cgi;
use crate::config::Config;
use crate::http::response::Framing;
use crate::http::{Method, Response, StatusCode};
use crate::router::pattern;
use crate::security::auth::PASSWORDS_FILE_NAME;

const COPY_BUF: usize = 8192;

/// Content type for a file name, from a small built-in table.
pub fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "html" | "htm" | "shtml" => "text/html",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => "application/json",
        "txt" | "log" => "text/plain",
        "xml" => "text/xml",
        "csv" => "text/csv",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        "wasm" => "application/wasm",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Maps a normalized request path to the file system, applying
/// `url_rewrite_patterns` first. `None` without a document root or if the
/// path would leave its base directory.
pub fn translate(config: &Config, uri: &str) -> Option<PathBuf> {
    let rewrite = config.url_rewrite_patterns.iter().find_map(|(prefix, dir)| {
        pattern::match_prefix(prefix, uri)
            .filter(|&n| n > 0)
            .map(|n| (dir.clone(), &uri[n..]))
    });
    let (mut path, rest) = match rewrite {
        Some(found) => found,
        None => (config.document_root.clone()?, uri),
    };
    for component in Path::new(rest.trim_start_matches(['/', '\\'])).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(path)
}

/// `.htpasswd` files and anything matching `hide_files_patterns` are never
/// served.
pub fn is_hidden(config: &Config, path: &Path) -> bool {
    if path.file_name().is_some_and(|name| name == PASSWORDS_FILE_NAME) {
        return true;
    }
    let Some(patterns) = config.hide_files_patterns.as_deref() else {
        return false;
    };
    path.to_str().is_some_and(|p| pattern::matches(patterns, p))
}

/// `"<mtime hex>.<size>"`.
pub fn etag(meta: &Metadata) -> String {
    format!("\"{:x}.{}\"", mtime_secs(meta), meta.len())
}

fn mtime_secs(meta: &Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs())
}

/// A parsed `Range` header against a file of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// Inclusive start and end offsets.
    Satisfiable(u64, u64),
    Unsatisfiable,
    /// Malformed or multi-range: serve the whole file.
    Ignore,
}

/// Parses a single `bytes=a-b`, `bytes=a-` or `bytes=-n` range.
pub fn parse_range(header: &str, size: u64) -> ByteRange {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return ByteRange::Ignore;
    };
    if spec.contains(',') {
        return ByteRange::Ignore;
    }
    let Some((first, last)) = spec.split_once('-') else {
        return ByteRange::Ignore;
    };
    let number = |s: &str| -> Option<u64> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        s.parse().ok()
    };

    if first.trim().is_empty() {
        return match number(last) {
            Some(0) => ByteRange::Unsatisfiable,
            Some(_) if size == 0 => ByteRange::Unsatisfiable,
            Some(n) => ByteRange::Satisfiable(size.saturating_sub(n), size - 1),
            None => ByteRange::Ignore,
        };
    }
    let Some(start) = number(first) else {
        return ByteRange::Ignore;
    };
    let end = if last.trim().is_empty() {
        None
    } else {
        match number(last) {
            Some(end) if end < start => return ByteRange::Ignore,
            Some(end) => Some(end),
            None => return ByteRange::Ignore,
        }
    };
    if start >= size {
        return ByteRange::Unsatisfiable;
    }
    ByteRange::Satisfiable(start, end.map_or(size - 1, |e| e.min(size - 1)))
}

fn accepts_gzip(ex: &Exchange<'_>) -> bool {
    ex.request()
        .headers()
        .get_all("accept-encoding")
        .any(|v| v.split(',').any(|c| c.trim().starts_with("gzip")))
}

fn is_not_modified(ex: &Exchange<'_>, meta: &Metadata, etag: &str) -> bool {
    let headers = ex.request().headers();
    if let Some(candidates) = headers.get("if-none-match") {
        return candidates
            .split(',')
            .map(str::trim)
            .any(|c| c == "*" || c == etag);
    }
    headers
        .get("if-modified-since")
        .and_then(|v| httpdate::parse_http_date(v).ok())
        .and_then(|since| since.duration_since(UNIX_EPOCH).ok())
        .is_some_and(|since| mtime_secs(meta) <= since.as_secs())
}

/// Resolves the request against the file system and answers it.
pub(crate) fn serve(ex: &mut Exchange<'_>) {
    let request = ex.request();
    let config = ex.domain().config();

    let Some(mut path) = translate(config, request.path()) else {
        send_error(ex.conn, StatusCode::NotFound);
        return;
    };
    if is_hidden(config, &path) {
        send_error(ex.conn, StatusCode::NotFound);
        return;
    }

    let method = request.method();
    if method.writes_files() {
        if config.put_delete_auth_file.is_none() {
            send(ex.conn, Response::error(StatusCode::MethodNotAllowed).header("Allow", allow(config)));
            return;
        }
        if !authorize(ex.ctx, ex.domain, ex.conn, request, Some(&path)) {
            return;
        }
        match method {
            Method::Put => put_file(ex, &path),
            Method::Delete => delete(ex, &path),
            _ => make_collection(ex, &path),
        }
        return;
    }

    let mut gzipped = false;
    let mut meta = fs::metadata(&path).ok();
    if meta.is_none() && accepts_gzip(ex) && !request.headers().contains("range") {
        let mut gz = path.clone().into_os_string();
        gz.push(".gz");
        let gz = PathBuf::from(gz);
        if let Ok(gz_meta) = fs::metadata(&gz) {
            if gz_meta.is_file() {
                meta = Some(gz_meta);
                gzipped = true;
                path = gz;
            }
        }
    }
    let Some(mut meta) = meta else {
        send_error(ex.conn, StatusCode::NotFound);
        return;
    };

    if meta.is_dir() {
        if !request.path().ends_with('/') {
            let mut location = format!("{}/", request.path());
            if let Some(query) = request.query_string() {
                location.push('?');
                location.push_str(query);
            }
            send(ex.conn, Response::new(StatusCode::MovedPermanently).header("Location", location));
            return;
        }
        let index = config.index_files.iter().find_map(|name| {
            let candidate = path.join(name);
            let candidate_meta = fs::metadata(&candidate).ok()?;
            candidate_meta.is_file().then_some((candidate, candidate_meta))
        });
        match index {
            Some((index_path, index_meta)) => {
                path = index_path;
                meta = index_meta;
            }
            None => {
                if authorize(ex.ctx, ex.domain, ex.conn, request, Some(&path)) {
                    send_error(ex.conn, StatusCode::Forbidden);
                }
                return;
            }
        }
    }

    if !authorize(ex.ctx, ex.domain, ex.conn, request, Some(&path)) {
        return;
    }

    if !gzipped && cgi::is_script(config, &path) {
        cgi::run(ex, &path);
        return;
    }

    match method {
        Method::Get | Method::Head => send_file(ex, &path, &meta, gzipped),
        Method::Options => send(
            ex.conn,
            Response::new(StatusCode::Ok).header("Allow", allow(config)),
        ),
        _ => send(
            ex.conn,
            Response::error(StatusCode::MethodNotAllowed).header("Allow", allow(config)),
        ),
    }
}

fn allow(config: &Config) -> &'static str {
    if config.put_delete_auth_file.is_some() {
        "GET, HEAD, OPTIONS, PUT, DELETE, MKCOL"
    } else {
        "GET, HEAD, OPTIONS"
    }
}

fn cache_control(max_age: u64) -> String {
    if max_age == 0 {
        "no-cache, no-store, must-revalidate".to_owned()
    } else {
        format!("max-age={max_age}")
    }
}

fn send_file(ex: &mut Exchange<'_>, path: &Path, meta: &Metadata, gzipped: bool) {
    let config = ex.domain().config();
    let size = meta.len();
    let tag = etag(meta);
    let modified = meta.modified().unwrap_or_else(|_| SystemTime::now());
    let last_modified = httpdate::fmt_http_date(modified);

    if is_not_modified(ex, meta, &tag) {
        send(
            ex.conn,
            Response::new(StatusCode::NotModified)
                .header("ETag", tag)
                .header("Last-Modified", last_modified),
        );
        return;
    }

    let range = match ex.request().headers().get("range") {
        Some(header) if !gzipped => parse_range(header, size),
        _ => ByteRange::Ignore,
    };
    if range == ByteRange::Unsatisfiable {
        send(
            ex.conn,
            Response::error(StatusCode::RangeNotSatisfiable)
                .header("Content-Range", format!("bytes */{size}")),
        );
        return;
    }

    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to open file");
            send_error(ex.conn, StatusCode::InternalServerError);
            return;
        }
    };

    let (status, start, len) = match range {
        ByteRange::Satisfiable(start, end) => (StatusCode::PartialContent, start, end - start + 1),
        _ => (StatusCode::Ok, 0, size),
    };
    let content_path = if gzipped { path.with_extension("") } else { path.to_path_buf() };
    let mut response = Response::new(status)
        .header("Content-Type", mime_type(&content_path))
        .header("Last-Modified", last_modified)
        .header("ETag", tag)
        .header("Accept-Ranges", "bytes")
        .header("Cache-Control", cache_control(config.static_file_max_age));
    if let ByteRange::Satisfiable(start, end) = range {
        response.add_header("Content-Range", format!("bytes {start}-{end}/{size}"));
    }
    if gzipped {
        response.add_header("Content-Encoding", "gzip");
    }

    if let Err(e) = ex.start_response(response, Framing::Length(len)) {
        debug!(error = %e, "failed to send file head");
        return;
    }
    if ex.request().method() == Method::Head || len == 0 {
        return;
    }
    if start > 0 {
        if let Err(e) = file.seek(SeekFrom::Start(start)) {
            warn!(path = %path.display(), error = %e, "seek failed");
            ex.close_connection();
            return;
        }
    }

    let mut remaining = len;
    let mut buf = [0u8; COPY_BUF];
    while remaining > 0 {
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let n = match file.read(&mut buf[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "file read failed");
                break;
            }
        };
        if let Err(e) = ex.write(&buf[..n]) {
            debug!(error = %e, "client went away during file transfer");
            return;
        }
        remaining -= n as u64;
    }
    if remaining > 0 {
        // The file shrank underneath us.
        ex.close_connection();
    }
}

fn put_file(ex: &mut Exchange<'_>, path: &Path) {
    if path.is_dir() {
        send_error(ex.conn, StatusCode::MethodNotAllowed);
        return;
    }
    let existed = path.exists();
    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent) {
            warn!(path = %parent.display(), error = %e, "failed to create directories");
            send_error(ex.conn, StatusCode::InternalServerError);
            return;
        }
    }
    let mut file = match File::create(path) {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to create file");
            send_error(ex.conn, StatusCode::InternalServerError);
            return;
        }
    };

    let mut buf = [0u8; COPY_BUF];
    loop {
        let n = match ex.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "request body failed during PUT");
                drop(file);
                discard_partial(path);
                send_error(ex.conn, StatusCode::BadRequest);
                return;
            }
        };
        if let Err(e) = file.write_all(&buf[..n]) {
            warn!(path = %path.display(), error = %e, "failed to write file");
            drop(file);
            discard_partial(path);
            ex.close_connection();
            send_error(ex.conn, StatusCode::InternalServerError);
            return;
        }
    }

    let status = if existed { StatusCode::Ok } else { StatusCode::Created };
    send(ex.conn, Response::new(status));
}

fn discard_partial(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "failed to remove partial upload");
    }
}

fn delete(ex: &mut Exchange<'_>, path: &Path) {
    let result = match fs::symlink_metadata(path) {
        Err(_) => {
            send_error(ex.conn, StatusCode::NotFound);
            return;
        }
        Ok(meta) if meta.is_dir() => fs::remove_dir(path),
        Ok(_) => fs::remove_file(path),
    };
    match result {
        Ok(()) => send(ex.conn, Response::new(StatusCode::NoContent)),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "delete failed");
            let status = match e.kind() {
                io::ErrorKind::PermissionDenied | io::ErrorKind::DirectoryNotEmpty => StatusCode::Forbidden,
                _ => StatusCode::InternalServerError,
            };
            send_error(ex.conn, status);
        }
    }
}

fn make_collection(ex: &mut Exchange<'_>, path: &Path) {
    let headers = ex.request().headers();
    let has_body = ex.request().content_length().is_some_and(|n| n > 0)
        || headers.contains("transfer-encoding");
    if has_body {
        send_error(ex.conn, StatusCode::UnsupportedMediaType);
        return;
    }
    if path.exists() {
        send_error(ex.conn, StatusCode::MethodNotAllowed);
        return;
    }
    if !path.parent().is_some_and(Path::is_dir) {
        send_error(ex.conn, StatusCode::Conflict);
        return;
    }
    match fs::create_dir(path) {
        Ok(()) => send(ex.conn, Response::new(StatusCode::Created)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "MKCOL failed");
            send_error(ex.conn, StatusCode::InternalServerError);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use super::*;
    use crate::connection::tests::{ScriptedTransport, limits};
    use crate::connection::{Connection, PeerInfo};
    use crate::context::tests::context;
    use crate::cgi::CommandSpawner;
    use crate::context::{Callbacks, Collaborators, Context, ServerStats};
    use crate::http::Request;
    use crate::dispatch::handle_request;

    fn root_with(files: &[(&str, &[u8])]) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            let path = root.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
        root
    }

    fn set_mtime(path: &Path, secs: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(UNIX_EPOCH + Duration::from_secs(secs)).unwrap();
    }

    fn config_for(root: &Path) -> Config {
        Config {
            document_root: Some(root.to_path_buf()),
            ..Config::default()
        }
    }

    fn get(ctx: &Context, raw: &str) -> String {
        let (transport, written) = ScriptedTransport::new(&[raw.as_bytes()]);
        let mut conn = Connection::new(
            limits(),
            Arc::new(AtomicBool::new(false)),
            Arc::new(ServerStats::default()),
        )
        .unwrap();
        conn.attach(Box::new(transport), PeerInfo::default());
        let head = conn.read_head().unwrap();
        handle_request(ctx, &mut conn, head);
        String::from_utf8_lossy(&written.lock().unwrap()).into_owned()
    }

    #[test]
    fn serves_a_regular_file_with_keep_alive() {
        let root = root_with(&[("foo", b"hello world")]);
        let ctx = context(config_for(root.path()));
        let out = get(&ctx, "GET /foo HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains("Content-Length: 11\r\n"));
        assert!(out.contains("Connection: keep-alive\r\n"));
        assert!(out.contains("Accept-Ranges: bytes\r\n"));
        assert!(out.ends_with("\r\n\r\nhello world"));
    }

    #[test]
    fn head_has_headers_but_no_body() {
        let root = root_with(&[("a.txt", b"abc")]);
        let ctx = context(config_for(root.path()));
        let out = get(&ctx, "HEAD /a.txt HTTP/1.1\r\n\r\n");
        assert!(out.contains("Content-Length: 3\r\n"));
        assert!(out.contains("Content-Type: text/plain\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn missing_and_hidden_files_are_404() {
        let root = root_with(&[("private/.htpasswd", b"x"), ("notes.secret", b"x")]);
        let mut config = config_for(root.path());
        config.hide_files_patterns = Some("**.secret$".to_owned());
        let ctx = context(config);
        assert!(get(&ctx, "GET /nope HTTP/1.1\r\n\r\n").starts_with("HTTP/1.1 404 "));
        assert!(get(&ctx, "GET /private/.htpasswd HTTP/1.1\r\n\r\n").starts_with("HTTP/1.1 404 "));
        assert!(get(&ctx, "GET /notes.secret HTTP/1.1\r\n\r\n").starts_with("HTTP/1.1 404 "));
    }

    #[test]
    fn directories_redirect_then_serve_index() {
        let root = root_with(&[("docs/index.html", b"<h1>hi</h1>"), ("empty/.keep", b"")]);
        let ctx = context(config_for(root.path()));

        let out = get(&ctx, "GET /docs?x=1 HTTP/1.1\r\n\r\n");
        assert!(out.starts_with("HTTP/1.1 301 "));
        assert!(out.contains("Location: /docs/?x=1\r\n"));

        let out = get(&ctx, "GET /docs/ HTTP/1.1\r\n\r\n");
        assert!(out.contains("Content-Type: text/html\r\n"));
        assert!(out.ends_with("<h1>hi</h1>"));

        assert!(get(&ctx, "GET /empty/ HTTP/1.1\r\n\r\n").starts_with("HTTP/1.1 403 "));
    }

    #[test]
    fn conditional_requests() {
        let root = root_with(&[("c.css", b"body{}")]);
        set_mtime(&root.path().join("c.css"), 1_000_000);
        let ctx = context(config_for(root.path()));
        let tag = format!("\"{:x}.6\"", 1_000_000);

        let out = get(&ctx, &format!("GET /c.css HTTP/1.1\r\nIf-None-Match: {tag}\r\n\r\n"));
        assert!(out.starts_with("HTTP/1.1 304 "));
        assert!(!out.contains("Content-Length"));

        let since = httpdate::fmt_http_date(UNIX_EPOCH + Duration::from_secs(1_000_000));
        let out = get(&ctx, &format!("GET /c.css HTTP/1.1\r\nIf-Modified-Since: {since}\r\n\r\n"));
        assert!(out.starts_with("HTTP/1.1 304 "));

        let out = get(
            &ctx,
            "GET /c.css HTTP/1.1\r\nIf-Modified-Since: Thu, 01 Jan 1970 00:00:01 GMT\r\n\r\n",
        );
        assert!(out.starts_with("HTTP/1.1 200 "));
        assert!(out.contains(&format!("ETag: {tag}\r\n")));
    }

    #[test]
    fn range_requests() {
        let root = root_with(&[("r.bin", b"0123456789")]);
        let ctx = context(config_for(root.path()));

        let out = get(&ctx, "GET /r.bin HTTP/1.1\r\nRange: bytes=2-4\r\n\r\n");
        assert!(out.starts_with("HTTP/1.1 206 "));
        assert!(out.contains("Content-Range: bytes 2-4/10\r\n"));
        assert!(out.ends_with("\r\n\r\n234"));

        let out = get(&ctx, "GET /r.bin HTTP/1.1\r\nRange: bytes=-3\r\n\r\n");
        assert!(out.ends_with("\r\n\r\n789"));

        let out = get(&ctx, "GET /r.bin HTTP/1.1\r\nRange: bytes=20-\r\n\r\n");
        assert!(out.starts_with("HTTP/1.1 416 "));
        assert!(out.contains("Content-Range: bytes */10\r\n"));
    }

    #[test]
    fn range_parsing() {
        assert_eq!(parse_range("bytes=0-0", 5), ByteRange::Satisfiable(0, 0));
        assert_eq!(parse_range("bytes=3-", 5), ByteRange::Satisfiable(3, 4));
        assert_eq!(parse_range("bytes=1-100", 5), ByteRange::Satisfiable(1, 4));
        assert_eq!(parse_range("bytes=-10", 5), ByteRange::Satisfiable(0, 4));
        assert_eq!(parse_range("bytes=-0", 5), ByteRange::Unsatisfiable);
        assert_eq!(parse_range("bytes=5-", 5), ByteRange::Unsatisfiable);
        assert_eq!(parse_range("bytes=4-2", 5), ByteRange::Ignore);
        assert_eq!(parse_range("bytes=0-1,3-4", 5), ByteRange::Ignore);
        assert_eq!(parse_range("lines=1-2", 5), ByteRange::Ignore);
        assert_eq!(parse_range("bytes=+1-2", 5), ByteRange::Ignore);
    }

    #[test]
    fn gzip_sibling_for_gzip_clients() {
        let root = root_with(&[("app.js.gz", b"\x1f\x8bfake")]);
        let ctx = context(config_for(root.path()));
        let out = get(&ctx, "GET /app.js HTTP/1.1\r\nAccept-Encoding: gzip, br\r\n\r\n");
        assert!(out.starts_with("HTTP/1.1 200 "));
        assert!(out.contains("Content-Encoding: gzip\r\n"));
        assert!(out.contains("Content-Type: application/javascript\r\n"));
        assert!(get(&ctx, "GET /app.js HTTP/1.1\r\n\r\n").starts_with("HTTP/1.1 404 "));
    }

    #[test]
    fn writes_are_refused_without_put_delete_file() {
        let root = root_with(&[("f.txt", b"x")]);
        let ctx = context(config_for(root.path()));
        let out = get(&ctx, "DELETE /f.txt HTTP/1.1\r\n\r\n");
        assert!(out.starts_with("HTTP/1.1 405 "));
        assert!(out.contains("Allow: GET, HEAD, OPTIONS\r\n"));
        assert!(root.path().join("f.txt").exists());
    }

    fn writable_context(root: &Path) -> Context {
        let passwords = root.join("put.passwd");
        fs::write(&passwords, "user:realm:hash").unwrap();
        Context::new(
            Config {
                put_delete_auth_file: Some(passwords),
                ..config_for(root)
            },
            Collaborators {
                tls: None,
                verifier: Some(Arc::new(|_: &Request, _: &str, _: &Path| true)),
                spawner: Arc::new(CommandSpawner),
                callbacks: Callbacks::default(),
            },
        )
    }

    #[test]
    fn put_writes_the_body() {
        let root = root_with(&[]);
        let ctx = writable_context(root.path());
        let out = get(&ctx, "PUT /up.txt HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");
        assert!(out.starts_with("HTTP/1.1 201 "), "{out}");
        assert_eq!(fs::read(root.path().join("up.txt")).unwrap(), b"hello");
    }

    #[test]
    fn interrupted_put_leaves_no_partial_file() {
        let root = root_with(&[]);
        let ctx = writable_context(root.path());
        let out = get(&ctx, "PUT /up.txt HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc");
        assert!(out.starts_with("HTTP/1.1 400 "), "{out}");
        assert!(!root.path().join("up.txt").exists());
    }

    #[test]
    fn post_to_a_static_file_is_405() {
        let root = root_with(&[("f.txt", b"x")]);
        let ctx = context(config_for(root.path()));
        assert!(get(&ctx, "POST /f.txt HTTP/1.1\r\nContent-Length: 0\r\n\r\n").starts_with("HTTP/1.1 405 "));
    }

    #[test]
    fn rewrite_patterns_map_prefixes() {
        let root = root_with(&[]);
        let assets = root_with(&[("logo.svg", b"<svg/>")]);
        let mut config = config_for(root.path());
        config.url_rewrite_patterns = vec![("/static".to_owned(), assets.path().to_path_buf())];
        assert_eq!(
            translate(&config, "/static/logo.svg"),
            Some(assets.path().join("logo.svg"))
        );
        assert_eq!(translate(&config, "/other"), Some(root.path().join("other")));
        assert_eq!(translate(&Config::default(), "/x"), None);
    }

    #[test]
    fn translate_refuses_parent_components() {
        let config = config_for(Path::new("/srv/www"));
        assert_eq!(translate(&config, "/../etc/passwd"), None);
        assert_eq!(translate(&config, "/a/./b"), Some(PathBuf::from("/srv/www/a/b")));
    }

    #[test]
    fn mime_table() {
        assert_eq!(mime_type(Path::new("a.HTML")), "text/html");
        assert_eq!(mime_type(Path::new("a.unknown")), "application/octet-stream");
        assert_eq!(mime_type(Path::new("noext")), "application/octet-stream");
    }
}
