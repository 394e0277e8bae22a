//! End-to-end behaviour over real sockets: a client talks to the proxy, the
//! proxy talks to an origin built from the same `Server`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use swrproxy::cache::{CacheStore, DiskStore, Generation, MemoryStore};
use swrproxy::context::Context;
use swrproxy::fetch::{Fetch, Forward, HttpFetcher};
use swrproxy::http::{Response, StatusCode};
use swrproxy::interceptor::{EligibilityFilter, Interceptor, fallback};
use swrproxy::middleware::{LoggerMiddleware, Pipeline};
use swrproxy::server::Server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl Reply {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Sends one request with `Connection: close` and reads the whole reply.
async fn send(addr: SocketAddr, method: &str, path: &str, body: &str) -> Reply {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.unwrap();
    let text = String::from_utf8(raw).unwrap();
    let (head, body) = text.split_once("\r\n\r\n").unwrap();
    let mut lines = head.split("\r\n");
    let status = lines.next().unwrap().split(' ').nth(1).unwrap().parse().unwrap();
    let headers = lines
        .filter_map(|line| line.split_once(": "))
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect();
    Reply {
        status,
        headers,
        body: body.to_string(),
    }
}

/// Origin that numbers its responses: `/missing` is a 404, everything else
/// answers `<method> <path> #<n>`.
async fn spawn_origin() -> (Url, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("http://{}/", server.local_addr())).unwrap();

    tokio::spawn(server.run(move |ctx: Context| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            let request = ctx.request();
            let status = if request.path() == "/missing" {
                StatusCode::NOT_FOUND
            } else {
                StatusCode::OK
            };
            Response::new(status)
                .header("Content-Type", "text/plain")
                .body(format!("{} {} #{n}", request.method(), request.path()))
        }
    }));

    (url, calls)
}

/// An address nothing listens on.
async fn dead_origin() -> Url {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    Url::parse(&format!("http://{addr}/")).unwrap()
}

async fn spawn_proxy(origin: Url, store: Arc<dyn CacheStore>) -> (SocketAddr, Interceptor) {
    let fetcher: Arc<dyn Fetch> = Arc::new(HttpFetcher::new(origin.clone()).unwrap());
    let interceptor = Interceptor::builder(
        store,
        Arc::clone(&fetcher),
        origin,
        Generation::new("static-v2").unwrap(),
    )
    .filter(EligibilityFilter::new().exclude(regex::Regex::new("^/browser-sync/").unwrap()))
    .build();
    interceptor.activate().await;

    let handler = Pipeline::new()
        .layer(LoggerMiddleware)
        .layer(interceptor.clone())
        .layer(Forward::new(fetcher))
        .into_handler();
    let server = Server::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(server.run(handler));

    (addr, interceptor)
}

#[tokio::test]
async fn serves_stale_then_revalidated_copy() {
    let (origin, calls) = spawn_origin().await;
    let (proxy, interceptor) = spawn_proxy(origin, Arc::new(MemoryStore::new(64))).await;

    let first = send(proxy, "GET", "/app.js", "").await;
    assert_eq!(first.status, 200);
    assert_eq!(first.body, "GET /app.js #1");
    assert_eq!(first.header("x-cache"), Some("miss"));
    interceptor.shutdown().await;

    let second = send(proxy, "GET", "/app.js", "").await;
    assert_eq!(second.body, "GET /app.js #1");
    assert_eq!(second.header("x-cache"), Some("hit"));
    assert_eq!(second.header("content-type"), Some("text/plain"));
    interceptor.shutdown().await;

    let third = send(proxy, "GET", "/app.js", "").await;
    assert_eq!(third.body, "GET /app.js #2");
    assert_eq!(third.header("x-cache"), Some("hit"));
    interceptor.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn head_passes_through_with_origin_length() {
    let (origin, _calls) = spawn_origin().await;
    let (proxy, interceptor) = spawn_proxy(origin, Arc::new(MemoryStore::new(64))).await;

    let reply = send(proxy, "HEAD", "/page", "").await;
    interceptor.shutdown().await;

    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("x-cache"), None);
    assert_eq!(reply.header("content-length"), Some("HEAD /page #1".len().to_string().as_str()));
    assert!(reply.body.is_empty());
}

#[tokio::test]
async fn unsafe_and_excluded_requests_pass_straight_through() {
    let (origin, calls) = spawn_origin().await;
    let store = Arc::new(MemoryStore::new(64));
    let (proxy, interceptor) = spawn_proxy(origin, store.clone()).await;

    for _ in 0..2 {
        let post = send(proxy, "POST", "/form", "a=1").await;
        assert!(post.body.starts_with("POST /form"));
        assert_eq!(post.header("x-cache"), None);

        let excluded = send(proxy, "GET", "/browser-sync/client.js", "").await;
        assert!(excluded.body.starts_with("GET /browser-sync/client.js"));
        assert_eq!(excluded.header("x-cache"), None);
    }
    interceptor.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(store.entry_count("static-v2"), 0);
}

#[tokio::test]
async fn error_responses_are_relayed_but_never_cached() {
    let (origin, calls) = spawn_origin().await;
    let store = Arc::new(MemoryStore::new(64));
    let (proxy, interceptor) = spawn_proxy(origin, store.clone()).await;

    for n in 1..=2 {
        let reply = send(proxy, "GET", "/missing", "").await;
        interceptor.shutdown().await;
        assert_eq!(reply.status, 404);
        assert_eq!(reply.body, format!("GET /missing #{n}"));
        assert_eq!(reply.header("x-cache"), Some("miss"));
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.entry_count("static-v2"), 0);
}

#[tokio::test]
async fn unreachable_origin_with_empty_cache_yields_503() {
    let (proxy, _interceptor) = spawn_proxy(dead_origin().await, Arc::new(MemoryStore::new(8))).await;

    let reply = send(proxy, "GET", "/index.html", "").await;
    assert_eq!(reply.status, 503);
    assert_eq!(reply.body, fallback::UNAVAILABLE_BODY);
    assert_eq!(reply.header("x-cache"), Some("fallback"));

    let post = send(proxy, "POST", "/form", "a=1").await;
    assert_eq!(post.status, 502);
}

#[tokio::test]
async fn disk_store_survives_restart_and_prunes_old_generations() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("static-v1")).unwrap();
    std::fs::write(dir.path().join("static-v1").join("stale.entry"), b"x").unwrap();

    let (origin, calls) = spawn_origin().await;
    {
        let store = Arc::new(DiskStore::open(dir.path()).await.unwrap());
        let (proxy, interceptor) = spawn_proxy(origin.clone(), store).await;
        assert!(!dir.path().join("static-v1").exists());

        let reply = send(proxy, "GET", "/logo.svg", "").await;
        assert_eq!(reply.header("x-cache"), Some("miss"));
        interceptor.shutdown().await;
    }

    let store = Arc::new(DiskStore::open(dir.path()).await.unwrap());
    let (proxy, interceptor) = spawn_proxy(origin, store).await;
    let reply = send(proxy, "GET", "/logo.svg", "").await;
    interceptor.shutdown().await;

    assert_eq!(reply.header("x-cache"), Some("hit"));
    assert_eq!(reply.body, "GET /logo.svg #1");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_requests_for_one_resource_store_one_entry() {
    let dir = tempfile::tempdir().unwrap();
    let (origin, _calls) = spawn_origin().await;
    let store = Arc::new(DiskStore::open(dir.path()).await.unwrap());
    let (proxy, interceptor) = spawn_proxy(origin, store).await;

    let requests: Vec<_> = (0..8)
        .map(|_| tokio::spawn(send(proxy, "GET", "/shared.css", "")))
        .collect();
    for request in requests {
        assert_eq!(request.await.unwrap().status, 200);
    }
    interceptor.shutdown().await;

    let entries: Vec<_> = std::fs::read_dir(dir.path().join("static-v2"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(entries.len(), 1);
}
