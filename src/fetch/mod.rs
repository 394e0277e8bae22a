//! Outbound HTTP client used to reach the origin.
//!
//! [`Fetch`] is the seam the cache talks to; [`HttpFetcher`] is the real
//! implementation, built on a [`reqwest::Client`] that never follows
//! redirects, so a `3xx` from the origin reaches the browser as-is.
//! [`Forward`] is the terminal middleware that sends requests the cache does
//! not handle straight to the origin.
//!
//! Only transport-level problems are errors here. A `404` or `500` from the
//! origin is a perfectly good [`Response`].

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::context::Context;
use crate::http::{Headers, Method, Request, Response, ResponseKind, StatusCode};
use crate::middleware::{Middleware, Next};

/// Headers that describe a single connection and are never forwarded or stored.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest origin response body we are willing to buffer (64 MiB).
const MAX_RESPONSE_SIZE: usize = 64 * 1024 * 1024;

/// Transport-level failures talking to the origin.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("cannot resolve request target {target:?}: {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported URL scheme `{0}` (only http is proxied)")]
    UnsupportedScheme(String),

    #[error("URL has no host: {0}")]
    MissingHost(Url),

    #[error("method `{0}` cannot be sent upstream")]
    InvalidMethod(String),

    #[error("origin request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("origin sent an invalid status code {0}")]
    InvalidStatus(u16),

    #[error("origin response exceeds {max_bytes} bytes")]
    TooLarge { max_bytes: usize },
}

/// Returns `true` for headers that must not cross the proxy.
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Resolves the absolute URL a request refers to.
///
/// Absolute-form targets are taken as-is; origin-form targets are joined onto
/// `origin`. The fragment is always dropped.
///
/// # Errors
///
/// Returns [`FetchError::InvalidTarget`] when the target cannot be parsed.
pub fn resolve_url(origin: &Url, request: &Request) -> Result<Url, FetchError> {
    let target = request.target();
    let parsed = if request.is_absolute_form() {
        Url::parse(&target)
    } else {
        origin.join(&target)
    };
    let mut url = parsed.map_err(|source| FetchError::InvalidTarget { target, source })?;
    url.set_fragment(None);
    Ok(url)
}

/// Something that can turn a request into an origin response.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Performs the network exchange for `request`.
    ///
    /// Non-success status codes are returned as `Ok`; only a failure to obtain
    /// any response at all is an `Err`.
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// HTTP client bound to one origin.
///
/// Clones share the underlying connection pool.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    origin: Url,
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Creates a client for `origin` (e.g. `http://127.0.0.1:3000/`).
    ///
    /// # Errors
    ///
    /// Returns an error for non-`http` origins, origins without a host, or
    /// when the HTTP client cannot be initialised.
    pub fn new(origin: Url) -> Result<Self, FetchError> {
        if origin.scheme() != "http" {
            return Err(FetchError::UnsupportedScheme(origin.scheme().to_owned()));
        }
        if origin.host_str().is_none() {
            return Err(FetchError::MissingHost(origin));
        }
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self { origin, client })
    }

    /// The origin requests are resolved against.
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    fn classify(&self, url: &Url, headers: &Headers) -> ResponseKind {
        if url.origin() == self.origin.origin() {
            return ResponseKind::Basic;
        }
        let ours = self.origin.origin().ascii_serialization();
        match headers.get("access-control-allow-origin") {
            Some(allowed) if allowed.trim() == "*" || allowed.trim() == ours => ResponseKind::Cors,
            _ => ResponseKind::Opaque,
        }
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        let url = resolve_url(&self.origin, request)?;
        if url.scheme() != "http" {
            return Err(FetchError::UnsupportedScheme(url.scheme().to_owned()));
        }
        let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
            .map_err(|_| FetchError::InvalidMethod(request.method().to_string()))?;

        let mut outbound = self.client.request(method, url.clone());
        for (name, value) in request.headers().iter() {
            if is_hop_by_hop(name)
                || name.eq_ignore_ascii_case("host")
                || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            outbound = outbound.header(name, value);
        }
        if !request.body().is_empty() {
            outbound = outbound.body(request.body().clone());
        }

        let mut upstream = outbound.send().await?;
        let code = upstream.status().as_u16();
        let status = StatusCode::from_u16(code).map_err(|_| FetchError::InvalidStatus(code))?;
        let bodiless = request.method() == &Method::Head
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;

        let headers = relayed_headers(upstream.headers(), bodiless);
        let body = if bodiless {
            Bytes::new()
        } else {
            read_body(&mut upstream).await?
        };
        let kind = self.classify(&url, &headers);

        debug!(
            url = %url,
            status = status.as_u16(),
            kind = kind.as_str(),
            bytes = body.len(),
            "origin responded"
        );

        Ok(Response::from_parts(status, headers, body)
            .with_kind(kind)
            .bodiless(bodiless))
    }
}

/// Copies origin headers minus the per-connection ones. Every relayed payload
/// is re-framed, so the origin `Content-Length` survives only when no body
/// follows.
fn relayed_headers(raw: &reqwest::header::HeaderMap, bodiless: bool) -> Headers {
    let mut headers = Headers::with_capacity(raw.len());
    for (name, value) in raw {
        let name = name.as_str();
        if is_hop_by_hop(name) || (!bodiless && name.eq_ignore_ascii_case("content-length")) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            headers.insert(name, value);
        }
    }
    headers
}

async fn read_body(upstream: &mut reqwest::Response) -> Result<Bytes, FetchError> {
    let too_large = FetchError::TooLarge {
        max_bytes: MAX_RESPONSE_SIZE,
    };
    if upstream
        .content_length()
        .is_some_and(|len| len > MAX_RESPONSE_SIZE as u64)
    {
        return Err(too_large);
    }
    let mut body = BytesMut::new();
    while let Some(chunk) = upstream.chunk().await? {
        if body.len() + chunk.len() > MAX_RESPONSE_SIZE {
            return Err(too_large);
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

/// Terminal middleware: sends the request to the origin and returns whatever
/// comes back. A transport failure becomes `502 Bad Gateway`.
pub struct Forward {
    fetcher: Arc<dyn Fetch>,
}

impl Forward {
    pub fn new(fetcher: Arc<dyn Fetch>) -> Self {
        Self { fetcher }
    }
}

impl Middleware for Forward {
    fn handle(
        &self,
        ctx: Context,
        _next: Next,
    ) -> Pin<Box<dyn std::future::Future<Output = Response> + Send>> {
        let fetcher = Arc::clone(&self.fetcher);
        Box::pin(async move {
            let request = ctx.into_request();
            match fetcher.fetch(&request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(path = %request.path(), error = %e, "origin unreachable on pass-through");
                    Response::new(StatusCode::BAD_GATEWAY).body("Bad Gateway\n")
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn origin() -> Url {
        Url::parse("http://app.local:8000/").unwrap()
    }

    #[test]
    fn resolves_origin_form_against_origin() {
        let req = Request::new(Method::Get, "/assets/app.js?v=3");
        let url = resolve_url(&origin(), &req).unwrap();
        assert_eq!(url.as_str(), "http://app.local:8000/assets/app.js?v=3");
    }

    #[test]
    fn keeps_absolute_form_and_drops_fragment() {
        let req = Request::new(Method::Get, "http://cdn.local/lib.js#frag");
        let url = resolve_url(&origin(), &req).unwrap();
        assert_eq!(url.as_str(), "http://cdn.local/lib.js");
    }

    #[test]
    fn rejects_https_origin() {
        let err = HttpFetcher::new(Url::parse("https://app.local/").unwrap()).unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedScheme(s) if s == "https"));
    }

    #[test]
    fn classifies_by_origin_and_cors() {
        let fetcher = HttpFetcher::new(origin()).unwrap();
        let same = Url::parse("http://app.local:8000/x").unwrap();
        let other = Url::parse("http://cdn.local/x").unwrap();

        assert_eq!(fetcher.classify(&same, &Headers::new()), ResponseKind::Basic);
        assert_eq!(fetcher.classify(&other, &Headers::new()), ResponseKind::Opaque);

        let mut cors = Headers::new();
        cors.insert("Access-Control-Allow-Origin", "*");
        assert_eq!(fetcher.classify(&other, &cors), ResponseKind::Cors);
    }

    /// Serves `reply` to the first connection and hands back the request head
    /// it received.
    async fn raw_origin(reply: &'static [u8]) -> (Url, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (seen_tx, seen_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut chunk = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&chunk[..n]);
            }
            let _ = seen_tx.send(String::from_utf8_lossy(&head).into_owned());
            socket.write_all(reply).await.unwrap();
            let _ = socket.shutdown().await;
        });
        (Url::parse(&format!("http://{addr}/")).unwrap(), seen_rx)
    }

    #[tokio::test]
    async fn forwards_end_to_end_headers_only() {
        let (url, seen) =
            raw_origin(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;
        let fetcher = HttpFetcher::new(url.clone()).unwrap();
        let req = Request::new(Method::Get, "/a?b=1")
            .header("Host", "proxy.local")
            .header("Proxy-Authorization", "Basic abc")
            .header("Accept", "text/html");
        fetcher.fetch(&req).await.unwrap();

        let head = seen.await.unwrap().to_ascii_lowercase();
        let port = url.port().unwrap();
        assert!(head.starts_with("get /a?b=1 http/1.1\r\n"));
        assert!(head.contains(&format!("host: 127.0.0.1:{port}\r\n")));
        assert!(head.contains("accept: text/html\r\n"));
        assert!(!head.contains("proxy.local"));
        assert!(!head.contains("proxy-authorization"));
    }

    #[tokio::test]
    async fn reads_content_length_body() {
        let (url, _) = raw_origin(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\nhello",
        )
        .await;
        let fetcher = HttpFetcher::new(url).unwrap();
        let response = fetcher.fetch(&Request::new(Method::Get, "/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.kind(), ResponseKind::Basic);
        assert_eq!(response.body_ref().as_ref(), b"hello");
        assert_eq!(response.headers().get("content-type"), Some("text/plain"));
        assert!(!response.headers().contains("connection"));
        assert!(!response.headers().contains("content-length"));
    }

    #[tokio::test]
    async fn reads_chunked_body() {
        let (url, _) = raw_origin(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .await;
        let fetcher = HttpFetcher::new(url).unwrap();
        let response = fetcher.fetch(&Request::new(Method::Get, "/")).await.unwrap();
        assert_eq!(response.body_ref().as_ref(), b"Wikipedia");
        assert!(!response.headers().contains("transfer-encoding"));
    }

    #[tokio::test]
    async fn head_response_keeps_origin_length() {
        let (url, _) = raw_origin(
            b"HTTP/1.1 200 OK\r\nContent-Length: 1234\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n",
        )
        .await;
        let fetcher = HttpFetcher::new(url).unwrap();
        let response = fetcher.fetch(&Request::new(Method::Head, "/big.html")).await.unwrap();
        assert!(response.body_ref().is_empty());

        let wire = response.into_bytes();
        let text = std::str::from_utf8(&wire).unwrap();
        assert!(text.contains("Content-Length: 1234\r\n"));
        assert_eq!(text.matches("Content-Length:").count(), 1);
    }

    #[tokio::test]
    async fn redirects_are_relayed_not_followed() {
        let (url, _) = raw_origin(
            b"HTTP/1.1 302 Found\r\nLocation: /elsewhere\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let fetcher = HttpFetcher::new(url).unwrap();
        let response = fetcher.fetch(&Request::new(Method::Get, "/old")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get("location"), Some("/elsewhere"));
    }

    #[tokio::test]
    async fn error_statuses_are_responses() {
        let (url, _) = raw_origin(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 7\r\nConnection: close\r\n\r\nmissing",
        )
        .await;
        let fetcher = HttpFetcher::new(url).unwrap();
        let response = fetcher.fetch(&Request::new(Method::Get, "/gone")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.body_ref().as_ref(), b"missing");
    }

    #[tokio::test]
    async fn unreachable_origin_is_a_transport_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let fetcher = HttpFetcher::new(Url::parse(&format!("http://127.0.0.1:{port}/")).unwrap()).unwrap();
        let err = fetcher.fetch(&Request::new(Method::Get, "/")).await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(e) if e.is_connect()));
    }
}
