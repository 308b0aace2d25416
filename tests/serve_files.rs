//! End-to-end file serving over a live proactor-mode server.

use clap::Parser;
use muon::library::{config::Config, db::Context, server::Server};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

const PAGE_BODY: &[u8] = b"<h1>it works</h1>\n";

fn doc_root() -> PathBuf {
    let root = std::env::temp_dir().join("muon-it-serve");
    let _ = std::fs::remove_dir_all(&root);
    std::fs::create_dir_all(root.join("sub")).unwrap();
    std::fs::write(root.join("index.html"), PAGE_BODY).unwrap();
    std::fs::write(root.join("data.txt"), b"0123456789").unwrap();
    std::fs::write(root.join("welcome.html"), b"welcome!").unwrap();
    std::fs::write(root.join("login.html"), b"please log in").unwrap();
    std::fs::write(root.join("login_error.html"), b"bad credentials").unwrap();
    std::fs::write(root.join("register_error.html"), b"name taken").unwrap();
    root
}

fn server_addr() -> SocketAddr {
    static ADDR: OnceLock<SocketAddr> = OnceLock::new();
    *ADDR.get_or_init(|| {
        let root = doc_root();
        let users = root.join("users.json");
        let cfg = Config::try_parse_from([
            "muon",
            "-p",
            "0",
            "--root",
            root.to_str().unwrap(),
            "--users",
            users.to_str().unwrap(),
            "-t",
            "2",
        ])
        .unwrap();
        let ctx = Arc::new(Context::new(
            cfg.doc_root.clone(),
            cfg.user_store.clone(),
            cfg.pool_size,
        ));
        ctx.preload().unwrap();
        let server = Server::bind(&cfg, ctx).unwrap();
        let addr = server.local_addr().unwrap();
        std::thread::spawn(move || server.run());
        addr
    })
}

fn connect() -> TcpStream {
    let addr = server_addr();
    let stream = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Reads one response: the full head, then exactly Content-Length body
/// bytes, so keep-alive connections are left positioned at the next
/// response boundary.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut raw: Vec<u8> = Vec::new();
    let mut byte = [0u8; 1];
    while !raw.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).expect("reading response head");
        assert!(n > 0, "connection closed mid-head: {raw:?}");
        raw.push(byte[0]);
    }
    let head = String::from_utf8(raw).unwrap();
    let content_length: usize = head
        .lines()
        .find_map(|l| l.strip_prefix("Content-Length:"))
        .map(|v| v.trim().parse().unwrap())
        .unwrap_or(0);
    let mut body = vec![0u8; content_length];
    stream.read_exact(&mut body).expect("reading response body");
    (head, body)
}

fn get(stream: &mut TcpStream, path: &str, keep_alive: bool) -> (String, Vec<u8>) {
    let connection = if keep_alive { "keep-alive" } else { "close" };
    write!(
        stream,
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: {connection}\r\n\r\n"
    )
    .unwrap();
    read_response(stream)
}

#[test]
fn get_serves_file_with_exact_content_length_and_reuses_connection() {
    let expected_len = std::fs::metadata(doc_root_path().join("data.txt"))
        .unwrap()
        .len() as usize;
    let mut stream = connect();

    let (head, body) = get(&mut stream, "/data.txt", true);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
    assert!(head.contains(&format!("Content-Length: {expected_len}\r\n")));
    assert!(head.contains("Connection: keep-alive\r\n"));
    assert_eq!(body, b"0123456789");

    // Same connection, second request: the slot reset back to the
    // request-line phase without losing the socket.
    let (head2, body2) = get(&mut stream, "/data.txt", true);
    assert!(head2.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body2, b"0123456789");
}

fn doc_root_path() -> PathBuf {
    // server_addr() created it; recompute the path without wiping it.
    server_addr();
    std::env::temp_dir().join("muon-it-serve")
}

#[test]
fn root_path_serves_index_html() {
    let mut stream = connect();
    let (head, body) = get(&mut stream, "/", false);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Type: text/html\r\n"));
    assert_eq!(body, PAGE_BODY);
}

#[test]
fn missing_file_yields_404_and_close_closes() {
    let mut stream = connect();
    let (head, _body) = get(&mut stream, "/not-here.html", false);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"), "head: {head}");
    assert!(head.contains("Connection: close\r\n"));
    // Orderly close after the response.
    let mut rest = Vec::new();
    let n = stream.read_to_end(&mut rest).unwrap();
    assert_eq!(n, 0);
}

#[test]
fn missing_file_with_keep_alive_leaves_connection_usable() {
    let mut stream = connect();
    let (head, _body) = get(&mut stream, "/not-here.html", true);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(head.contains("Connection: keep-alive\r\n"));
    let (head2, _body2) = get(&mut stream, "/data.txt", true);
    assert!(head2.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[test]
fn directory_yields_403() {
    let mut stream = connect();
    let (head, _body) = get(&mut stream, "/sub", false);
    assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"), "head: {head}");
}

#[test]
fn malformed_request_line_yields_400() {
    let mut stream = connect();
    stream.write_all(b"NONSENSE\r\n\r\n").unwrap();
    let (head, _body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"), "head: {head}");
}

#[test]
fn unsupported_method_yields_400() {
    let mut stream = connect();
    stream
        .write_all(b"DELETE /data.txt HTTP/1.1\r\nHost: x\r\n\r\n")
        .unwrap();
    let (head, _body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[test]
fn register_then_login_round_trip() {
    let mut stream = connect();
    let body = "user=it-user&password=it-pass";
    write!(
        stream,
        "POST /register HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .unwrap();
    let (head, page) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {head}");
    assert_eq!(page, b"please log in");

    write!(
        stream,
        "POST /login HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\
         Content-Length: {}\r\n\r\n{body}",
        body.len()
    )
    .unwrap();
    let (head2, page2) = read_response(&mut stream);
    assert!(head2.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(page2, b"welcome!");

    // Wrong password lands on the error page.
    let bad = "user=it-user&password=wrong";
    write!(
        stream,
        "POST /login HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\
         Content-Length: {}\r\n\r\n{bad}",
        bad.len()
    )
    .unwrap();
    let (_head3, page3) = read_response(&mut stream);
    assert_eq!(page3, b"bad credentials");
}

#[test]
fn split_delivery_of_one_request_still_resolves() {
    let mut stream = connect();
    let request: &[u8] =
        b"GET /data.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
    for chunk in request.chunks(7) {
        stream.write_all(chunk).unwrap();
        stream.flush().unwrap();
        std::thread::sleep(Duration::from_millis(10));
    }
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"0123456789");
}

#[test]
fn larger_binary_file_arrives_intact() {
    let root = doc_root_path();
    let blob: Vec<u8> = (0..64 * 1024u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(root.join("blob.bin"), &blob).unwrap();

    let mut stream = connect();
    let (head, body) = get(&mut stream, "/blob.bin", false);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Content-Type: application/octet-stream\r\n"));
    assert_eq!(body.len(), blob.len());
    assert_eq!(body, blob);
}
