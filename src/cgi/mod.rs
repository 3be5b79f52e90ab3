//! CGI scripts.
//!
//! A script path matching `cgi_pattern` is run through a
//! [`ProcessSpawner`]. The request body is streamed to its stdin and its
//! stdout is parsed as a CGI response: a header block (with the optional
//! `Status:` and `Location:` pseudo-headers) followed by the body.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::dispatch::{Exchange, send_error};
use crate::http::request::parse_header_block;
use crate::http::response::Framing;
use crate::http::{Request, Response, StatusCode, parse_status_code};
use crate::router::pattern;
use crate::sync::lock;

const SERVER_SOFTWARE: &str = concat!("wharf/", env!("CARGO_PKG_VERSION"));
const STDERR_EXCERPT: usize = 4096;
const WAIT_POLL: Duration = Duration::from_millis(10);

/// Errors from running a script.
#[derive(Debug, Error)]
pub enum CgiError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("script output ended before the header block")]
    TruncatedHead,

    #[error("script header block is malformed")]
    MalformedHead,

    #[error("script header block exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("I/O error talking to the script: {0}")]
    Io(#[from] io::Error),
}

/// A running external process.
pub trait ExternalProcess: Send {
    /// Takes the write end of the process's stdin.
    fn stdin(&mut self) -> Option<Box<dyn Write + Send>>;

    /// Takes the read end of the process's stdout.
    fn stdout(&mut self) -> Option<Box<dyn Read + Send>>;

    fn stderr(&mut self) -> Option<Box<dyn Read + Send>>;

    /// Exit code if the process has finished.
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Blocks until the process exits.
    fn wait(&mut self) -> io::Result<i32> {
        loop {
            if let Some(code) = self.try_wait()? {
                return Ok(code);
            }
            thread::sleep(WAIT_POLL);
        }
    }

    fn kill(&mut self) -> io::Result<()>;
}

/// Starts external processes.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(
        &self,
        program: &Path,
        args: &[String],
        env: &[String],
        cwd: &Path,
    ) -> io::Result<Box<dyn ExternalProcess>>;
}

/// Spawns with [`std::process::Command`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandSpawner;

impl ProcessSpawner for CommandSpawner {
    fn spawn(
        &self,
        program: &Path,
        args: &[String],
        env: &[String],
        cwd: &Path,
    ) -> io::Result<Box<dyn ExternalProcess>> {
        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for pair in env {
            if let Some((key, value)) = pair.split_once('=') {
                command.env(key, value);
            }
        }
        let child = command.spawn()?;
        Ok(Box::new(ChildProcess(child)))
    }
}

struct ChildProcess(Child);

impl ExternalProcess for ChildProcess {
    fn stdin(&mut self) -> Option<Box<dyn Write + Send>> {
        self.0.stdin.take().map(|s: ChildStdin| Box::new(s) as Box<dyn Write + Send>)
    }

    fn stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.0.stdout.take().map(|s: ChildStdout| Box::new(s) as Box<dyn Read + Send>)
    }

    fn stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        self.0.stderr.take().map(|s: ChildStderr| Box::new(s) as Box<dyn Read + Send>)
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.0.try_wait()?.map(|status| status.code().unwrap_or(-1)))
    }

    fn kill(&mut self) -> io::Result<()> {
        match self.0.kill() {
            Err(e) if e.kind() != io::ErrorKind::InvalidInput => Err(e),
            _ => Ok(()),
        }
    }
}

/// `true` if `path` should be run as a script.
pub fn is_script(config: &Config, path: &Path) -> bool {
    let Some(cgi_pattern) = config.cgi_pattern.as_deref() else {
        return false;
    };
    path.to_str().is_some_and(|p| pattern::matches(cgi_pattern, p))
}

/// The CGI/1.1 environment for `request` running `script`.
pub fn build_environment(request: &Request, config: &Config, script: &Path) -> Vec<String> {
    let mut env = Vec::with_capacity(24 + request.headers().len());
    let mut set = |key: &str, value: &str| env.push(format!("{key}={value}"));

    set("GATEWAY_INTERFACE", "CGI/1.1");
    set("SERVER_SOFTWARE", SERVER_SOFTWARE);
    set("SERVER_PROTOCOL", request.version().as_str());
    set("REDIRECT_STATUS", "200");
    set("SERVER_NAME", &config.authentication_domain);
    if let Some(local) = request.local_addr() {
        set("SERVER_PORT", &local.port().to_string());
    }
    if let Some(root) = config.document_root.as_deref() {
        set("DOCUMENT_ROOT", &root.to_string_lossy());
    }
    set("REQUEST_METHOD", request.method().as_str());
    set("REQUEST_URI", request.uri());
    set("SCRIPT_NAME", request.path());
    set("SCRIPT_FILENAME", &script.to_string_lossy());
    set("QUERY_STRING", request.query_string().unwrap_or(""));
    if let Some(remote) = request.remote_addr() {
        set("REMOTE_ADDR", &remote.ip().to_string());
        set("REMOTE_PORT", &remote.port().to_string());
    }
    set("HTTPS", if request.is_secure() { "on" } else { "off" });
    if let Some(content_type) = request.headers().get("content-type") {
        set("CONTENT_TYPE", content_type);
    }
    if let Some(length) = request.headers().get("content-length") {
        set("CONTENT_LENGTH", length.trim());
    }
    if let Ok(path) = std::env::var("PATH") {
        set("PATH", &path);
    }

    let mut seen: Vec<String> = Vec::new();
    for (name, value) in request.headers().iter() {
        let key = format!(
            "HTTP_{}",
            name.chars()
                .map(|c| if c == '-' { '_' } else { c.to_ascii_uppercase() })
                .collect::<String>()
        );
        if seen.contains(&key) {
            // Repeated headers are joined like a single comma-separated list.
            if let Some(existing) = env.iter_mut().find(|e| e.starts_with(&format!("{key}="))) {
                existing.push_str(", ");
                existing.push_str(value);
            }
            continue;
        }
        env.push(format!("{key}={value}"));
        seen.push(key);
    }
    env
}

/// The response head a script printed.
#[derive(Debug)]
pub struct ScriptHead {
    pub response: Response,
    /// Bytes after the header block, already read from stdout.
    pub body_start: Vec<u8>,
}

/// Reads and interprets the header block at the start of a script's stdout.
pub fn read_script_head(stdout: &mut dyn Read, limit: usize) -> Result<ScriptHead, CgiError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    let end = loop {
        if let Some(end) = header_block_end(&buf) {
            break end;
        }
        if buf.len() > limit {
            return Err(CgiError::HeadTooLarge(limit));
        }
        match stdout.read(&mut chunk) {
            Ok(0) => return Err(CgiError::TruncatedHead),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    };

    let mut headers = parse_header_block(&buf[..end]).map_err(|_| CgiError::MalformedHead)?;
    let status = headers.get("status").map(str::to_owned);
    headers.remove("status");
    let mut response = match status {
        Some(line) => {
            let line = line.trim();
            let code = line.get(..3).and_then(parse_status_code).ok_or(CgiError::MalformedHead)?;
            let reason = line[3..].trim();
            let reason = if reason.is_empty() {
                StatusCode::from_u16(code).map_or("Unknown", StatusCode::canonical_reason)
            } else {
                reason
            };
            Response::from_code(code, reason.to_owned())
        }
        None if headers.contains("location") => Response::new(StatusCode::Found),
        None => Response::new(StatusCode::Ok),
    };
    for (name, value) in headers.iter() {
        response.add_header(name, value);
    }
    Ok(ScriptHead {
        response,
        body_start: buf[end..].to_vec(),
    })
}

fn header_block_end(buf: &[u8]) -> Option<usize> {
    for i in 0..buf.len() {
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some(i + 4);
        }
        if buf[i..].starts_with(b"\n\n") {
            return Some(i + 2);
        }
    }
    None
}

/// Runs `script` for the current request and relays its response.
pub(crate) fn run(ex: &mut Exchange<'_>, script: &Path) {
    let config = ex.domain().config();
    let request = ex.request();
    let ctx = ex.context();

    let (program, args) = match &config.cgi_interpreter {
        Some(interpreter) => (interpreter.clone(), vec![script.to_string_lossy().into_owned()]),
        None => (script.to_path_buf(), Vec::new()),
    };
    let cwd = script.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    let env = build_environment(request, config, script);

    let mut process = match ctx.spawner().spawn(&program, &args, &env, &cwd) {
        Ok(process) => process,
        Err(source) => {
            let e = CgiError::Spawn {
                program: program.display().to_string(),
                source,
            };
            error!(error = %e, "cannot run CGI script");
            send_error(ex.connection(), StatusCode::InternalServerError);
            return;
        }
    };

    let stdin = process.stdin();
    let stdout = process.stdout();
    let stderr = process.stderr();
    let process = Arc::new(Mutex::new(process));

    let kill_job = config.cgi_timeout.map(|timeout| {
        let target = Arc::clone(&process);
        let script = script.display().to_string();
        ctx.timers().add(timeout, None, move || {
            warn!(script = %script, "CGI script timed out, killing it");
            if let Err(e) = lock(&target).kill() {
                debug!(error = %e, "failed to kill CGI script");
            }
        })
    });

    let errors = stderr.map(|mut stderr| {
        thread::spawn(move || {
            let mut excerpt = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                match stderr.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) if excerpt.len() < STDERR_EXCERPT => {
                        let room = STDERR_EXCERPT - excerpt.len();
                        excerpt.extend_from_slice(&chunk[..n.min(room)]);
                    }
                    Ok(_) => {}
                }
            }
            String::from_utf8_lossy(&excerpt).into_owned()
        })
    });

    relay(ex, script, stdin, stdout, config.max_request_size);

    if let Some(id) = kill_job {
        ctx.timers().cancel(id);
    }
    let code = loop {
        let status = lock(&process).try_wait();
        match status {
            Ok(Some(code)) => break Some(code),
            Ok(None) => thread::sleep(WAIT_POLL),
            Err(e) => {
                debug!(error = %e, "failed to reap CGI script");
                break None;
            }
        }
    };
    let stderr_text = errors.and_then(|h| h.join().ok()).unwrap_or_default();
    if !stderr_text.trim().is_empty() {
        debug!(script = %script.display(), stderr = %stderr_text.trim(), "CGI script wrote to stderr");
    }
    debug!(script = %script.display(), code = ?code, "CGI script finished");
}

fn relay(
    ex: &mut Exchange<'_>,
    script: &Path,
    stdin: Option<Box<dyn Write + Send>>,
    stdout: Option<Box<dyn Read + Send>>,
    head_limit: usize,
) {
    if let Some(mut stdin) = stdin {
        let mut buf = [0u8; 8192];
        loop {
            match ex.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(e) = stdin.write_all(&buf[..n]) {
                        debug!(error = %e, "CGI script stopped reading its input");
                        ex.close_connection();
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "request body failed while feeding CGI script");
                    ex.close_connection();
                    break;
                }
            }
        }
        // Dropping stdin signals end of input.
    }

    let Some(mut stdout) = stdout else {
        send_error(ex.connection(), StatusCode::InternalServerError);
        return;
    };
    let head = match read_script_head(stdout.as_mut(), head_limit) {
        Ok(head) => head,
        Err(e) => {
            error!(script = %script.display(), error = %e, "bad CGI script output");
            send_error(ex.connection(), StatusCode::InternalServerError);
            return;
        }
    };

    let framing = head
        .response
        .headers()
        .get("content-length")
        .and_then(crate::http::request::parse_content_length)
        .map_or(Framing::Chunked, Framing::Length);
    if let Err(e) = ex.start_response(head.response, framing) {
        debug!(error = %e, "failed to send CGI response head");
        return;
    }
    if ex.write(&head.body_start).is_err() {
        return;
    }
    let mut buf = [0u8; 8192];
    loop {
        match stdout.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = ex.write(&buf[..n]) {
                    debug!(error = %e, "client went away during CGI output");
                    return;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                debug!(error = %e, "failed reading CGI output");
                ex.close_connection();
                break;
            }
        }
    }
    if let Err(e) = ex.finish() {
        debug!(error = %e, "failed to finish CGI response");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw: &str) -> Request {
        Request::parse(raw.as_bytes()).unwrap().0
    }

    fn var<'a>(env: &'a [String], key: &str) -> Option<&'a str> {
        env.iter()
            .find_map(|e| e.strip_prefix(key).and_then(|rest| rest.strip_prefix('=')))
    }

    #[test]
    fn environment_carries_request_metadata() {
        let config = Config {
            document_root: Some(PathBuf::from("/srv/www")),
            ..Config::default()
        };
        let req = request(
            "POST /cgi-bin/form.cgi?a=1 HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\n\
             Content-Length: 5\r\nX-Forwarded-For: 1.1.1.1\r\nX-Forwarded-For: 2.2.2.2\r\n\r\n",
        );
        let env = build_environment(&req, &config, Path::new("/srv/www/cgi-bin/form.cgi"));

        assert_eq!(var(&env, "GATEWAY_INTERFACE"), Some("CGI/1.1"));
        assert_eq!(var(&env, "REQUEST_METHOD"), Some("POST"));
        assert_eq!(var(&env, "QUERY_STRING"), Some("a=1"));
        assert_eq!(var(&env, "SCRIPT_NAME"), Some("/cgi-bin/form.cgi"));
        assert_eq!(var(&env, "SCRIPT_FILENAME"), Some("/srv/www/cgi-bin/form.cgi"));
        assert_eq!(var(&env, "DOCUMENT_ROOT"), Some("/srv/www"));
        assert_eq!(var(&env, "CONTENT_LENGTH"), Some("5"));
        assert_eq!(var(&env, "CONTENT_TYPE"), Some("text/plain"));
        assert_eq!(var(&env, "HTTPS"), Some("off"));
        assert_eq!(var(&env, "HTTP_HOST"), Some("x"));
        assert_eq!(var(&env, "HTTP_X_FORWARDED_FOR"), Some("1.1.1.1, 2.2.2.2"));
    }

    #[test]
    fn script_head_with_status() {
        let mut out: &[u8] = b"Status: 404 Gone Fishing\r\nContent-Type: text/plain\r\n\r\nbody";
        let head = read_script_head(&mut out, 1024).unwrap();
        assert_eq!(head.response.status(), 404);
        assert_eq!(head.response.reason(), "Gone Fishing");
        assert!(!head.response.headers().contains("status"));
        assert_eq!(head.body_start, b"body");
    }

    #[test]
    fn location_without_status_redirects() {
        let mut out: &[u8] = b"Location: /elsewhere\n\n";
        let head = read_script_head(&mut out, 1024).unwrap();
        assert_eq!(head.response.status(), 302);
        assert_eq!(head.response.headers().get("location"), Some("/elsewhere"));
    }

    #[test]
    fn plain_head_is_200() {
        let mut out: &[u8] = b"Content-Type: text/html\r\n\r\n<p>";
        let head = read_script_head(&mut out, 1024).unwrap();
        assert_eq!(head.response.status(), 200);
        assert_eq!(head.body_start, b"<p>");
    }

    #[test]
    fn malformed_heads_are_errors() {
        let mut out: &[u8] = b"no header block here";
        assert!(matches!(read_script_head(&mut out, 1024), Err(CgiError::TruncatedHead)));
        let mut out: &[u8] = b"Status: abc\r\n\r\n";
        assert!(matches!(read_script_head(&mut out, 1024), Err(CgiError::MalformedHead)));
        let big = vec![b'x'; 4096];
        let mut out: &[u8] = &big;
        assert!(matches!(read_script_head(&mut out, 1024), Err(CgiError::HeadTooLarge(1024))));
    }

    #[test]
    fn script_pattern() {
        let config = Config::default();
        assert!(is_script(&config, Path::new("/srv/www/run.cgi")));
        assert!(is_script(&config, Path::new("/srv/www/a/b.php")));
        assert!(!is_script(&config, Path::new("/srv/www/run.cgi.txt")));
        let config = Config {
            cgi_pattern: None,
            ..Config::default()
        };
        assert!(!is_script(&config, Path::new("/srv/www/run.cgi")));
    }

    #[cfg(unix)]
    #[test]
    fn command_spawner_runs_a_process() {
        let mut process = CommandSpawner
            .spawn(
                Path::new("/bin/sh"),
                &["-c".to_owned(), "read line; echo \"got $line $GREETING\"".to_owned()],
                &["GREETING=hi".to_owned()],
                Path::new("/"),
            )
            .unwrap();
        let mut stdin = process.stdin().unwrap();
        stdin.write_all(b"ping\n").unwrap();
        drop(stdin);
        let mut out = String::new();
        process.stdout().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "got ping hi\n");
        assert_eq!(process.wait().unwrap(), 0);
    }
}
