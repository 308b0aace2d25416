//! Over-capacity connections get the busy response and are never
//! registered; closing an active connection frees its slot.

use clap::Parser;
use muon::library::{config::Config, db::Context, server::Server};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

fn server_addr() -> SocketAddr {
    static ADDR: OnceLock<SocketAddr> = OnceLock::new();
    *ADDR.get_or_init(|| {
        let root = std::env::temp_dir().join("muon-it-capacity");
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("index.html"), b"tiny").unwrap();
        let users = root.join("users.json");
        let cfg = Config::try_parse_from([
            "muon",
            "-p",
            "0",
            "--max-conns",
            "1",
            "-t",
            "2",
            "--root",
            root.to_str().unwrap(),
            "--users",
            users.to_str().unwrap(),
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
    let stream = TcpStream::connect(("127.0.0.1", server_addr().port())).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

#[test]
fn second_connection_is_refused_then_slot_frees_up() {
    // First client occupies the single slot. A byte of traffic guarantees
    // the dispatcher has registered it before we probe the cap.
    let mut first = connect();
    first.write_all(b"GET ").unwrap();
    std::thread::sleep(Duration::from_millis(300));

    // Second client must get the canned busy response and a closed socket.
    let mut second = connect();
    let mut refusal = Vec::new();
    second.read_to_end(&mut refusal).unwrap();
    let text = String::from_utf8_lossy(&refusal);
    assert!(
        text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"),
        "refusal: {text}"
    );
    assert!(text.ends_with("Server busy.\n"));

    // Release the slot and let the dispatcher notice the hangup.
    drop(first);
    std::thread::sleep(Duration::from_millis(300));

    // A fresh client now completes a whole request.
    let mut third = connect();
    third
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let mut response = Vec::new();
    third.read_to_end(&mut response).unwrap();
    let text = String::from_utf8_lossy(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "response: {text}");
    assert!(text.ends_with("tiny"));
}
