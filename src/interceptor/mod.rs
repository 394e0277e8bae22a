//! The caching interceptor: a [`Middleware`] that answers eligible requests
//! from the current cache generation while refreshing them from the origin.
//!
//! Requests the [`EligibilityFilter`] rejects, or whose identity cannot be
//! derived, are passed to the next layer untouched. Everything else goes
//! through the stale-while-revalidate [`RefreshStrategy`](strategy) and comes
//! back with an `X-Cache` header naming the [`CacheOutcome`].
//!
//! Generation cleanup runs exactly once per interceptor, before the first
//! store access.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

use crate::cache::{ActivationReport, CacheStore, Generation, GenerationManager, RequestIdentity};
use crate::context::Context;
use crate::fetch::Fetch;
use crate::http::Response;
use crate::middleware::{Middleware, Next};

mod eligibility;
pub mod fallback;
mod strategy;

pub use eligibility::{EligibilityError, EligibilityFilter};
pub use strategy::{CacheOutcome, is_cacheable};

use strategy::RefreshStrategy;

/// Response header carrying the [`CacheOutcome`].
pub const CACHE_STATUS_HEADER: &str = "X-Cache";

/// Largest body stored by default (8 MiB).
pub const DEFAULT_MAX_ENTRY_BYTES: usize = 8 * 1024 * 1024;

/// Cheaply cloneable handle; clones share the store, the activation state and
/// the background-write tracker.
#[derive(Clone)]
pub struct Interceptor {
    inner: Arc<Inner>,
}

struct Inner {
    origin: Url,
    filter: EligibilityFilter,
    key_headers: Vec<String>,
    manager: GenerationManager,
    activation: OnceCell<ActivationReport>,
    strategy: RefreshStrategy,
}

/// Configures an [`Interceptor`].
pub struct InterceptorBuilder {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetch>,
    origin: Url,
    generation: Generation,
    filter: EligibilityFilter,
    key_headers: Vec<String>,
    max_entry_bytes: usize,
}

impl InterceptorBuilder {
    #[must_use]
    pub fn filter(mut self, filter: EligibilityFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Request headers whose values become part of the cache key.
    #[must_use]
    pub fn key_headers(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.key_headers = names
            .into_iter()
            .map(|name| name.into().to_ascii_lowercase())
            .collect();
        self
    }

    #[must_use]
    pub fn max_entry_bytes(mut self, max: usize) -> Self {
        self.max_entry_bytes = max;
        self
    }

    pub fn build(self) -> Interceptor {
        let manager = GenerationManager::new(Arc::clone(&self.store), self.generation.clone());
        let strategy = RefreshStrategy::new(
            self.store,
            self.fetcher,
            self.generation,
            self.max_entry_bytes,
        );
        Interceptor {
            inner: Arc::new(Inner {
                origin: self.origin,
                filter: self.filter,
                key_headers: self.key_headers,
                manager,
                activation: OnceCell::new(),
                strategy,
            }),
        }
    }
}

impl Interceptor {
    /// Starts configuring an interceptor that stores into `generation` of
    /// `store` and reaches the network through `fetcher`. Origin-form request
    /// targets are resolved against `origin`.
    pub fn builder(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetch>,
        origin: Url,
        generation: Generation,
    ) -> InterceptorBuilder {
        InterceptorBuilder {
            store,
            fetcher,
            origin,
            generation,
            filter: EligibilityFilter::new(),
            key_headers: Vec::new(),
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
        }
    }

    pub fn generation(&self) -> &Generation {
        self.inner.manager.current()
    }

    /// Deletes every stale generation. Only the first call does any work;
    /// later and concurrent callers wait for it and get the same report.
    pub async fn activate(&self) -> ActivationReport {
        self.inner
            .activation
            .get_or_init(|| self.inner.manager.activate())
            .await
            .clone()
    }

    /// Handles a request, consulting the cache only when it is eligible.
    pub async fn intercept(&self, ctx: Context, next: Next) -> Response {
        let inner = &self.inner;
        if !inner.filter.is_eligible(ctx.request()) {
            return next.run(ctx).await;
        }
        let identity =
            match RequestIdentity::from_request(ctx.request(), &inner.origin, &inner.key_headers) {
                Ok(identity) => identity,
                Err(e) => {
                    debug!(path = %ctx.request().path(), error = %e, "no cache identity; passing through");
                    return next.run(ctx).await;
                }
            };

        self.activate().await;

        let (mut response, outcome) = inner.strategy.handle(ctx.into_request(), identity).await;
        response.set_header(CACHE_STATUS_HEADER, outcome.as_str());
        response
    }

    /// Waits for in-flight background cache writes. Requests served after
    /// this call still work but their writes are not awaited by anyone.
    pub async fn shutdown(&self) {
        self.inner.strategy.drain().await;
    }
}

impl Middleware for Interceptor {
    fn handle(&self, ctx: Context, next: Next) -> Pin<Box<dyn Future<Output = Response> + Send>> {
        let interceptor = self.clone();
        Box::pin(async move { interceptor.intercept(ctx, next).await })
    }
}
