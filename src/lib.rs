//! # swrproxy
//!
//! A stale-while-revalidate caching reverse proxy built on a from-scratch
//! async HTTP/1.1 stack.
//!
//! Eligible requests are answered from the current cache generation when a
//! stored copy exists, while the origin is queried concurrently and the
//! stored copy refreshed in the background. Old generations are deleted once
//! when the proxy starts.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use swrproxy::cache::{Generation, MemoryStore};
//! use swrproxy::fetch::{Fetch, Forward, HttpFetcher};
//! use swrproxy::interceptor::Interceptor;
//! use swrproxy::middleware::{LoggerMiddleware, Pipeline};
//! use swrproxy::server::Server;
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let origin = Url::parse("http://127.0.0.1:3000/")?;
//!     let fetcher: Arc<dyn Fetch> = Arc::new(HttpFetcher::new(origin.clone())?);
//!     let interceptor = Interceptor::builder(
//!         Arc::new(MemoryStore::new(1024)),
//!         Arc::clone(&fetcher),
//!         origin,
//!         Generation::new("static-v1")?,
//!     )
//!     .build();
//!     interceptor.activate().await;
//!
//!     let handler = Pipeline::new()
//!         .layer(LoggerMiddleware)
//!         .layer(interceptor)
//!         .layer(Forward::new(fetcher))
//!         .into_handler();
//!
//!     Server::bind("127.0.0.1:8080").await?.run(handler).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod fetch;
pub mod http;
pub mod interceptor;
pub mod middleware;
pub mod server;
pub mod telemetry;

pub use http::{Headers, Method, Request, Response, StatusCode};
pub use interceptor::{CacheOutcome, Interceptor};
pub use server::{Server, ServerError};
