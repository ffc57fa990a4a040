//! Integration tests for the record-replay cycle
//!
//! A scripted upstream runs on a local socket; the proxy is started in record
//! or replay mode against it and driven over real HTTP.

use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{CONTENT_ENCODING, CONTENT_TYPE, DATE};
use hyper::{HeaderMap, Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

use tapedeck::config::Config;
use tapedeck::network::NetworkHandler;
use tapedeck::snapshot::FixtureCollection;
use tapedeck::storage::FixtureStore;

const HTML_PAGE: &str = "<html><body>\n  <p>Hello</p>\n</body></html>\n";

/// Scripted upstream server
struct Upstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

impl Upstream {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let _ = serve_upstream(stream, counter).await;
                });
            }
        });

        Self { addr, hits }
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

async fn serve_upstream(mut stream: TcpStream, hits: Arc<AtomicUsize>) -> std::io::Result<()> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        buffer.extend_from_slice(&chunk[..read]);
        if let Some(position) = find_subsequence(&buffer, b"\r\n\r\n") {
            break position + 4;
        }
    };

    let head = String::from_utf8_lossy(&buffer[..head_end]).into_owned();
    let header = |name: &str| {
        head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim().to_string())
        })
    };

    let content_length = header("content-length")
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(0);
    while buffer.len() < head_end + content_length {
        let read = stream.read(&mut chunk).await?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
    let body = String::from_utf8_lossy(&buffer[head_end..]).into_owned();

    let mut request_line = head.split_whitespace();
    let method = request_line.next().unwrap_or("GET").to_string();
    let target = request_line.next().unwrap_or("/").to_string();
    let (path, search) = target.split_once('?').unwrap_or((target.as_str(), ""));

    let count = hits.fetch_add(1, Ordering::SeqCst) + 1;

    let response = match path {
        "/api/users" => respond(
            "200 OK",
            &[
                ("Content-Type", "application/json".to_string()),
                ("Date", "Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
                ("Set-Cookie", "session=abc".to_string()),
                ("Set-Cookie", "theme=dark".to_string()),
            ],
            format!("{{\"search\":\"{search}\"}}").as_bytes(),
        ),
        "/counter" => respond(
            "200 OK",
            &[("Content-Type", "text/plain".to_string())],
            format!("hit {count}").as_bytes(),
        ),
        "/page" => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(HTML_PAGE.as_bytes())?;
            respond(
                "200 OK",
                &[
                    ("Content-Type", "text/html; charset=utf-8".to_string()),
                    ("Content-Encoding", "gzip".to_string()),
                ],
                &encoder.finish()?,
            )
        }
        "/old" => respond(
            "302 Found",
            &[("Location", "/api/users?page=1".to_string())],
            b"",
        ),
        "/echo" => respond(
            "201 Created",
            &[("Content-Type", "text/plain".to_string())],
            format!(
                "{method} host={} body={body}",
                header("host").unwrap_or_default()
            )
            .as_bytes(),
        ),
        "/deflate-cut" => {
            let payload: Vec<u8> = (0..20_000u32).map(|i| (i * 7 % 251) as u8).collect();
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&payload)?;
            let compressed = encoder.finish()?;
            respond(
                "200 OK",
                &[
                    ("Content-Type", "application/octet-stream".to_string()),
                    ("Content-Encoding", "deflate".to_string()),
                ],
                &compressed[..compressed.len() / 2],
            )
        }
        "/slow" => {
            tokio::time::sleep(Duration::from_millis(400)).await;
            respond(
                "200 OK",
                &[("Content-Type", "text/plain".to_string())],
                b"worth the wait",
            )
        }
        "/truncated" => b"HTTP/1.1 200 OK\r\n\
            Content-Type: text/plain\r\n\
            Content-Length: 100\r\n\r\nshort"
            .to_vec(),
        _ => respond("404 Not Found", &[], b"no such route"),
    };

    stream.write_all(&response).await?;
    stream.shutdown().await
}

fn respond(status: &str, headers: &[(&str, String)], body: &[u8]) -> Vec<u8> {
    let mut response = format!("HTTP/1.1 {status}\r\n");
    for (name, value) in headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str(&format!(
        "Content-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));

    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

/// A running proxy instance
struct Proxy {
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl Proxy {
    async fn start(out: &Path, upstream: SocketAddr, record: bool) -> Self {
        let config = Config::from_toml_str(&format!(
            r#"
            out = "{}"
            record = {record}

            [mock]
            host = "{upstream}"
            protocol = "http"

            [limits]
            upstream_timeout_ms = 5000
            "#,
            out.display()
        ))
        .unwrap();

        let handler = NetworkHandler::new(config).unwrap();
        let shutdown = handler.shutdown_sender();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(handler.run_with_listeners(listener, None));

        Self {
            addr,
            shutdown,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    async fn send(
        &self,
        method: Method,
        target: &str,
        headers: &[(&str, &str)],
        body: &str,
    ) -> (StatusCode, HeaderMap, Bytes) {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://{}{target}", self.addr));
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = builder.body(Full::new(Bytes::from(body.to_string()))).unwrap();

        let response = tokio::time::timeout(Duration::from_secs(10), self.client.request(request))
            .await
            .unwrap()
            .unwrap();
        let (parts, body) = response.into_parts();
        let body = body.collect().await.unwrap().to_bytes();

        (parts.status, parts.headers, body)
    }

    async fn get(&self, target: &str) -> (StatusCode, HeaderMap, Bytes) {
        self.send(Method::GET, target, &[], "").await
    }

    fn stop(&self) {
        self.shutdown.send(()).ok();
    }
}

fn fixture_file(out: &Path, upstream: SocketAddr, pathname: &str) -> std::path::PathBuf {
    FixtureStore::new(out.to_path_buf()).fixture_path(&upstream.to_string(), pathname)
}

async fn load_fixture(out: &Path, upstream: SocketAddr, pathname: &str) -> FixtureCollection {
    FixtureStore::new(out.to_path_buf())
        .load(&upstream.to_string(), pathname)
        .await
        .unwrap()
        .expect("fixture should exist")
}

fn without_date(headers: &HeaderMap) -> Vec<(String, String)> {
    let mut pairs: Vec<_> = headers
        .iter()
        .filter(|(name, _)| *name != DATE)
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    pairs.sort();
    pairs
}

#[tokio::test]
async fn test_record_then_replay_round_trip() {
    let dir = TempDir::new().unwrap();
    let upstream = Upstream::start().await;

    let recorder = Proxy::start(dir.path(), upstream.addr, true).await;
    let (status, recorded_headers, recorded_body) = recorder.get("/api/users?page=1").await;
    recorder.stop();

    assert_eq!(status, StatusCode::OK);
    assert_eq!(&recorded_body[..], br#"{"search":"page=1"}"#);
    assert!(fixture_file(dir.path(), upstream.addr, "/api/users").exists());

    let collection = load_fixture(dir.path(), upstream.addr, "/api/users").await;
    assert_eq!(collection.len(), 1);
    let snapshot = &collection.snapshots()[0];
    assert_eq!(snapshot.method, "GET");
    assert_eq!(snapshot.protocol, "http:");
    assert_eq!(snapshot.search, "page=1");
    assert!(!snapshot.headers.contains_key("date"));

    let hits_after_recording = upstream.hits();
    let replayer = Proxy::start(dir.path(), upstream.addr, false).await;
    let (status, replayed_headers, replayed_body) = replayer.get("/api/users?page=1").await;
    replayer.stop();

    assert_eq!(status, StatusCode::OK);
    assert_eq!(replayed_body, recorded_body);
    assert_eq!(without_date(&replayed_headers), without_date(&recorded_headers));
    assert_eq!(
        replayed_headers.get_all("set-cookie").iter().count(),
        2,
        "repeated headers survive the round trip"
    );
    assert_eq!(upstream.hits(), hits_after_recording, "replay never calls upstream");
}

#[tokio::test]
async fn test_search_selects_snapshot() {
    let dir = TempDir::new().unwrap();
    let upstream = Upstream::start().await;

    let recorder = Proxy::start(dir.path(), upstream.addr, true).await;
    recorder.get("/api/users?page=1").await;
    recorder.get("/api/users?page=2").await;
    recorder.stop();

    let collection = load_fixture(dir.path(), upstream.addr, "/api/users").await;
    assert_eq!(collection.len(), 2);

    let replayer = Proxy::start(dir.path(), upstream.addr, false).await;
    let (_, _, page_two) = replayer.get("/api/users?page=2").await;
    let (_, _, page_one) = replayer.get("/api/users?page=1").await;
    let (missing, _, _) = replayer.get("/api/users?page=3").await;
    replayer.stop();

    assert_eq!(&page_two[..], br#"{"search":"page=2"}"#);
    assert_eq!(&page_one[..], br#"{"search":"page=1"}"#);
    assert_eq!(missing, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_rerecording_updates_in_place() {
    let dir = TempDir::new().unwrap();
    let upstream = Upstream::start().await;

    let recorder = Proxy::start(dir.path(), upstream.addr, true).await;
    recorder.get("/counter").await;
    let (_, _, second) = recorder.get("/counter").await;
    recorder.stop();

    let collection = load_fixture(dir.path(), upstream.addr, "/counter").await;
    assert_eq!(collection.len(), 1);
    assert_eq!(
        collection.snapshots()[0].body.as_deref(),
        Some(&second[..]),
        "latest exchange replaces the earlier one"
    );
}

#[tokio::test]
async fn test_gzip_is_transparent_and_html_stored_as_text() {
    let dir = TempDir::new().unwrap();
    let upstream = Upstream::start().await;

    let recorder = Proxy::start(dir.path(), upstream.addr, true).await;
    let (status, headers, body) = recorder
        .send(Method::GET, "/page", &[("accept-encoding", "gzip, br")], "")
        .await;
    recorder.stop();

    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], HTML_PAGE.as_bytes());
    assert!(!headers.contains_key(CONTENT_ENCODING));
    assert_eq!(headers[CONTENT_TYPE], "text/html; charset=utf-8");

    let file = std::fs::read_to_string(fixture_file(dir.path(), upstream.addr, "/page")).unwrap();
    assert!(file.contains("body: !!str |2-"));
    assert!(file.contains("    <p>Hello</p>"));
    assert!(!file.contains("content-encoding"));
}

#[tokio::test]
async fn test_json_stored_as_binary() {
    let dir = TempDir::new().unwrap();
    let upstream = Upstream::start().await;

    let recorder = Proxy::start(dir.path(), upstream.addr, true).await;
    recorder.get("/api/users").await;
    recorder.stop();

    let file =
        std::fs::read_to_string(fixture_file(dir.path(), upstream.addr, "/api/users")).unwrap();
    assert!(file.contains("body: !!binary |"));
}

#[tokio::test]
async fn test_redirects_are_followed() {
    let dir = TempDir::new().unwrap();
    let upstream = Upstream::start().await;

    let recorder = Proxy::start(dir.path(), upstream.addr, true).await;
    let (status, _, body) = recorder.get("/old").await;
    recorder.stop();

    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], br#"{"search":"page=1"}"#);

    let collection = load_fixture(dir.path(), upstream.addr, "/old").await;
    assert_eq!(collection.snapshots()[0].status_code, 200);
}

#[tokio::test]
async fn test_request_retargeted_and_form_reencoded() {
    let dir = TempDir::new().unwrap();
    let upstream = Upstream::start().await;

    let recorder = Proxy::start(dir.path(), upstream.addr, true).await;
    let (status, _, body) = recorder
        .send(
            Method::POST,
            "/echo?v=1",
            &[("content-type", "application/x-www-form-urlencoded")],
            "name=Jane+Doe&city=Oslo",
        )
        .await;
    recorder.stop();

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        String::from_utf8(body.to_vec()).unwrap(),
        format!("POST host={} body=name=Jane%20Doe&city=Oslo", upstream.addr)
    );

    let collection = load_fixture(dir.path(), upstream.addr, "/echo").await;
    assert_eq!(collection.snapshots()[0].method, "POST");
    assert_eq!(collection.snapshots()[0].search, "v=1");
}

#[tokio::test]
async fn test_replay_miss_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let upstream = Upstream::start().await;

    let replayer = Proxy::start(dir.path(), upstream.addr, false).await;
    let (status, _, _) = replayer.get("/never/recorded").await;
    replayer.stop();

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(upstream.hits(), 0);
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn test_truncated_upstream_persists_nothing() {
    let dir = TempDir::new().unwrap();
    let upstream = Upstream::start().await;

    let recorder = Proxy::start(dir.path(), upstream.addr, true).await;
    let (status, _, body) = recorder.get("/truncated").await;
    recorder.stop();

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(String::from_utf8_lossy(&body).starts_with("Internal server error\n\n"));
    assert!(!fixture_file(dir.path(), upstream.addr, "/truncated").exists());
}

#[tokio::test]
async fn test_record_mode_replaces_malformed_fixture() {
    let dir = TempDir::new().unwrap();
    let upstream = Upstream::start().await;

    let path = fixture_file(dir.path(), upstream.addr, "/counter");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "method: [not yaml\n").unwrap();

    let recorder = Proxy::start(dir.path(), upstream.addr, true).await;
    let (status, _, _) = recorder.get("/counter").await;
    recorder.stop();

    assert_eq!(status, StatusCode::OK);
    let collection = load_fixture(dir.path(), upstream.addr, "/counter").await;
    assert_eq!(collection.len(), 1);
}

#[tokio::test]
async fn test_truncated_deflate_persists_nothing() {
    let dir = TempDir::new().unwrap();
    let upstream = Upstream::start().await;

    let recorder = Proxy::start(dir.path(), upstream.addr, true).await;
    let (status, _, _) = recorder
        .send(Method::GET, "/deflate-cut", &[("accept-encoding", "deflate")], "")
        .await;
    recorder.stop();

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!fixture_file(dir.path(), upstream.addr, "/deflate-cut").exists());
}

#[tokio::test]
async fn test_client_disconnect_does_not_abort_recording() {
    let dir = TempDir::new().unwrap();
    let upstream = Upstream::start().await;
    let recorder = Proxy::start(dir.path(), upstream.addr, true).await;

    let mut stream = TcpStream::connect(recorder.addr).await.unwrap();
    stream
        .write_all(b"GET /slow?q=1 HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    drop(stream);

    let path = fixture_file(dir.path(), upstream.addr, "/slow");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !path.exists() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    recorder.stop();

    assert_eq!(upstream.hits(), 1);
    let collection = load_fixture(dir.path(), upstream.addr, "/slow").await;
    let snapshot = &collection.snapshots()[0];
    assert_eq!(snapshot.search, "q=1");
    assert_eq!(snapshot.body.as_deref(), Some(&b"worth the wait"[..]));
}
