mod common;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::request;
use wharf::security::PasswordVerifier;
use wharf::{Config, Request, Server};

fn start(root: &Path, extra: &[(&str, String)]) -> Server {
    common::init_tracing();
    let mut options = vec![
        ("listening_ports", "127.0.0.1:0".to_owned()),
        ("num_threads", "2".to_owned()),
        ("document_root", root.display().to_string()),
    ];
    options.extend(extra.iter().cloned());
    let verifier: Arc<dyn PasswordVerifier> = Arc::new(|request: &Request, _: &str, _: &Path| {
        request.headers().get("authorization") == Some("Digest good")
    });
    Server::builder(Config::from_options(options).unwrap())
        .password_verifier(verifier)
        .start()
        .unwrap()
}

#[test]
fn directory_password_file_guards_its_files() {
    let root = tempfile::tempdir().unwrap();
    let private = root.path().join("private");
    fs::create_dir(&private).unwrap();
    fs::write(private.join(".htpasswd"), "user:realm:hash").unwrap();
    fs::write(private.join("doc.txt"), "classified").unwrap();
    let server = start(root.path(), &[("authentication_domain", "wharf.test".to_owned())]);
    let addr = server.ports()[0];

    let denied = request(addr, "GET /private/doc.txt HTTP/1.1\r\nHost: x\r\n\r\n");
    assert_eq!(denied.status(), 401);
    let challenge = denied.header("www-authenticate").unwrap();
    assert!(challenge.starts_with("Digest "));
    assert!(challenge.contains("realm=\"wharf.test\""));

    let allowed = request(
        addr,
        "GET /private/doc.txt HTTP/1.1\r\nHost: x\r\nAuthorization: Digest good\r\n\r\n",
    );
    assert_eq!(allowed.status(), 200);
    assert_eq!(allowed.text(), "classified");

    let hidden = request(
        addr,
        "GET /private/.htpasswd HTTP/1.1\r\nHost: x\r\nAuthorization: Digest good\r\n\r\n",
    );
    assert_eq!(hidden.status(), 404);
    server.stop();
}

#[test]
fn writes_need_credentials() {
    let root = tempfile::tempdir().unwrap();
    let passwords = root.path().join("put.passwd");
    fs::write(&passwords, "user:realm:hash").unwrap();
    let server = start(
        root.path(),
        &[("put_delete_auth_file", passwords.display().to_string())],
    );
    let addr = server.ports()[0];

    let anonymous = request(addr, "PUT /new.txt HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc");
    assert_eq!(anonymous.status(), 401);
    assert!(!root.path().join("new.txt").exists());

    let created = request(
        addr,
        "PUT /new.txt HTTP/1.1\r\nHost: x\r\nAuthorization: Digest good\r\nContent-Length: 3\r\n\r\nabc",
    );
    assert_eq!(created.status(), 201);
    assert_eq!(fs::read(root.path().join("new.txt")).unwrap(), b"abc");

    let replaced = request(
        addr,
        "PUT /new.txt HTTP/1.1\r\nHost: x\r\nAuthorization: Digest good\r\nContent-Length: 2\r\n\r\nxy",
    );
    assert_eq!(replaced.status(), 200);
    assert_eq!(fs::read(root.path().join("new.txt")).unwrap(), b"xy");

    let collection = request(
        addr,
        "MKCOL /dir HTTP/1.1\r\nHost: x\r\nAuthorization: Digest good\r\n\r\n",
    );
    assert_eq!(collection.status(), 201);
    assert!(root.path().join("dir").is_dir());

    let deleted = request(
        addr,
        "DELETE /new.txt HTTP/1.1\r\nHost: x\r\nAuthorization: Digest good\r\n\r\n",
    );
    assert_eq!(deleted.status(), 204);
    assert!(!root.path().join("new.txt").exists());

    let missing = request(
        addr,
        "DELETE /new.txt HTTP/1.1\r\nHost: x\r\nAuthorization: Digest good\r\n\r\n",
    );
    assert_eq!(missing.status(), 404);
    server.stop();
}

#[test]
fn writes_are_refused_without_a_put_file() {
    let root = tempfile::tempdir().unwrap();
    let server = start(root.path(), &[]);
    let reply = request(
        server.ports()[0],
        "PUT /x.txt HTTP/1.1\r\nHost: x\r\nContent-Length: 1\r\n\r\nx",
    );
    assert_eq!(reply.status(), 405);
    assert!(reply.header("allow").is_some());
    server.stop();
}
