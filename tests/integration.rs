// tests/integration.rs
//
// End-to-end scenarios over real loopback sockets: a tempdir static root, an
// in-memory user store, and a server thread driven through plain TcpStreams.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use satie::sql::{MemoryUserStore, UserStore};
use satie::{Config, Server};
use tempfile::TempDir;

struct TestServer {
    port: u16,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    _root: TempDir,
}

impl TestServer {
    fn start(root: TempDir, store: Arc<dyn UserStore>, idle_timeout_ms: u64) -> Self {
        let mut cfg = Config::default();
        cfg.listen_port = 0;
        cfg.trigger_mode = 3;
        cfg.idle_timeout_ms = idle_timeout_ms;
        cfg.worker_threads = 4;
        cfg.src_dir = root.path().to_str().unwrap().to_string();

        let mut server = Server::new(&cfg, store).unwrap();
        let port = server.port();
        let shutdown = server.shutdown_handle();
        let handle = std::thread::spawn(move || {
            server.run().unwrap();
        });

        Self {
            port,
            shutdown,
            handle: Some(handle),
            _root: root,
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Wake the reactor out of epoll_wait.
        let _ = TcpStream::connect(("127.0.0.1", self.port));
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap();
        }
    }
}

fn static_root(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (name, contents) in files {
        std::fs::write(dir.path().join(name.trim_start_matches('/')), contents).unwrap();
    }
    dir
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read one response: headers up to the blank line, then exactly
/// Content-Length body bytes (works on keep-alive connections).
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut tmp).unwrap();
        assert!(n > 0, "connection closed before headers completed");
        buf.extend_from_slice(&tmp[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();

    let content_length = head
        .lines()
        .find_map(|l| {
            let (k, v) = l.split_once(':')?;
            if k.eq_ignore_ascii_case("Content-Length") {
                v.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut tmp).unwrap();
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&tmp[..n]);
    }
    body.truncate(content_length);
    (head, body)
}

#[test]
fn serves_index_for_root_path() {
    let root = static_root(&[("/index.html", "hi")]);
    let server = TestServer::start(root, Arc::new(MemoryUserStore::new()), 60_000);

    let mut stream = server.connect();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);

    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "head: {}", head);
    assert!(head.contains("Content-Length: 2"));
    assert!(head.contains("Content-Type: text/html"));
    assert!(head.contains("Connection: close"));
    assert_eq!(body, b"hi");

    // Connection: close means EOF follows the body.
    let mut tmp = [0u8; 16];
    assert_eq!(stream.read(&mut tmp).unwrap(), 0);

    server.stop();
}

#[test]
fn missing_file_yields_404_page_or_inline_body() {
    let root = static_root(&[("/404.html", "<h1>gone</h1>")]);
    let server = TestServer::start(root, Arc::new(MemoryUserStore::new()), 60_000);

    let mut stream = server.connect();
    stream
        .write_all(b"GET /missing.html HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert_eq!(body, b"<h1>gone</h1>");
    server.stop();

    // Without a 404 page the inline error body is substituted.
    let root = static_root(&[]);
    let server = TestServer::start(root, Arc::new(MemoryUserStore::new()), 60_000);
    let mut stream = server.connect();
    stream
        .write_all(b"GET /missing.html HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(String::from_utf8_lossy(&body).contains("404 : Not Found"));
    server.stop();
}

#[test]
fn forbidden_file_is_served_the_403_page() {
    use std::os::unix::fs::PermissionsExt;

    let root = static_root(&[("/secret.html", "top"), ("/403.html", "f")]);
    let secret = root.path().join("secret.html");
    std::fs::set_permissions(&secret, std::fs::Permissions::from_mode(0o640)).unwrap();
    let server = TestServer::start(root, Arc::new(MemoryUserStore::new()), 60_000);

    let mut stream = server.connect();
    stream
        .write_all(b"GET /secret.html HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"), "head: {}", head);
    assert_eq!(body, b"f");
    server.stop();
}

#[test]
fn unsupported_method_yields_400_page() {
    let root = static_root(&[("/index.html", "hi"), ("/400.html", "bad")]);
    let server = TestServer::start(root, Arc::new(MemoryUserStore::new()), 60_000);

    // The path resolves to a servable file, so the 400 survives the stat
    // decision and is served the canonical error page.
    let mut stream = server.connect();
    stream
        .write_all(b"PUT /index.html HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert_eq!(body, b"bad");
    server.stop();
}

#[test]
fn garbage_request_line_is_rejected_inline() {
    // Nothing parses to a path, so the rejection degrades through the stat
    // decision and the missing error pages to the inline 404 body.
    let root = static_root(&[]);
    let server = TestServer::start(root, Arc::new(MemoryUserStore::new()), 60_000);

    let mut stream = server.connect();
    stream.write_all(b"BOGUS\r\n\r\n").unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(String::from_utf8_lossy(&body).contains("404 : Not Found"));
    assert!(head.contains("Connection: close"));
    server.stop();
}

#[test]
fn dotdot_traversal_is_rejected() {
    let root = static_root(&[("/403.html", "f"), ("/index.html", "hi")]);
    let server = TestServer::start(root, Arc::new(MemoryUserStore::new()), 60_000);

    let mut stream = server.connect();
    stream
        .write_all(b"GET /../../etc/passwd HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"), "head: {}", head);
    assert_eq!(body, b"f");
    server.stop();
}

#[test]
fn login_rewrites_to_welcome_or_error() {
    let root = static_root(&[("/welcome.html", "w"), ("/error.html", "e")]);
    let store = Arc::new(MemoryUserStore::with_users(&[("alice", "secret")]));
    let server = TestServer::start(root, store, 60_000);

    let body = "username=alice&password=secret";
    let mut stream = server.connect();
    stream
        .write_all(
            format!(
                "POST /login.html HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .as_bytes(),
        )
        .unwrap();
    let (head, body) = read_response(&mut stream);
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"w");

    let body = "username=alice&password=wrong";
    let mut stream = server.connect();
    stream
        .write_all(
            format!(
                "POST /login.html HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .as_bytes(),
        )
        .unwrap();
    let (_, body) = read_response(&mut stream);
    assert_eq!(body, b"e");

    server.stop();
}

#[test]
fn register_creates_user_once() {
    let root = static_root(&[("/welcome.html", "w"), ("/error.html", "e")]);
    let store = Arc::new(MemoryUserStore::new());
    let server = TestServer::start(root, store.clone(), 60_000);

    let form = "username=bob&password=pw";
    for expected in [b"w" as &[u8], b"e"] {
        let mut stream = server.connect();
        stream
            .write_all(
                format!(
                    "POST /register.html HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    form.len(),
                    form
                )
                .as_bytes(),
            )
            .unwrap();
        let (_, body) = read_response(&mut stream);
        assert_eq!(body, expected);
    }

    // The registered credentials now pass a login.
    assert!(store.verify("bob", "pw", true));
    server.stop();
}

#[test]
fn keep_alive_serves_sequential_requests_in_order() {
    let root = static_root(&[("/index.html", "hi")]);
    let server = TestServer::start(root, Arc::new(MemoryUserStore::new()), 60_000);

    let mut stream = server.connect();
    for _ in 0..10 {
        stream
            .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: keep-alive"));
        assert!(head.contains("Keep-Alive: max=6, timeout=120"));
        assert_eq!(body, b"hi");
    }
    server.stop();
}

#[test]
fn concurrent_keep_alive_clients_see_no_interleaving() {
    let root = static_root(&[("/index.html", "hello world")]);
    let server = TestServer::start(root, Arc::new(MemoryUserStore::new()), 60_000);
    let port = server.port;

    let mut clients = Vec::new();
    for _ in 0..2 {
        clients.push(std::thread::spawn(move || {
            let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            for _ in 0..100 {
                stream
                    .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
                    .unwrap();
                let (head, body) = read_response(&mut stream);
                assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
                assert_eq!(body, b"hello world");
                std::thread::sleep(Duration::from_millis(1));
            }
        }));
    }
    for c in clients {
        c.join().unwrap();
    }
    server.stop();
}

#[test]
fn byte_at_a_time_request_gets_the_same_response() {
    let root = static_root(&[("/index.html", "hi")]);
    let server = TestServer::start(root, Arc::new(MemoryUserStore::new()), 60_000);

    let raw = b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";

    let mut whole = server.connect();
    whole.write_all(raw).unwrap();
    let (head_whole, body_whole) = read_response(&mut whole);

    let mut drip = server.connect();
    for &b in raw.iter() {
        drip.write_all(&[b]).unwrap();
        drip.flush().unwrap();
        std::thread::sleep(Duration::from_millis(1));
    }
    let (head_drip, body_drip) = read_response(&mut drip);

    assert_eq!(body_whole, b"hi");
    assert_eq!(body_whole, body_drip);
    // Identical apart from nothing: the status and headers match exactly.
    assert_eq!(head_whole, head_drip);

    server.stop();
}

#[test]
fn idle_connection_is_evicted_by_the_timer() {
    let root = static_root(&[("/index.html", "hi")]);
    let server = TestServer::start(root, Arc::new(MemoryUserStore::new()), 50);

    let mut stream = server.connect();
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    // Send nothing; the reactor should close us within the idle window.
    let mut tmp = [0u8; 16];
    let n = stream.read(&mut tmp).unwrap();
    assert_eq!(n, 0, "expected EOF from idle eviction");

    server.stop();
}

#[test]
fn active_connection_outlives_the_idle_window() {
    let root = static_root(&[("/index.html", "hi")]);
    let server = TestServer::start(root, Arc::new(MemoryUserStore::new()), 300);

    let mut stream = server.connect();
    // Keep the connection busy past several idle windows.
    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(100));
        stream
            .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let (head, body) = read_response(&mut stream);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body, b"hi");
    }
    server.stop();
}
