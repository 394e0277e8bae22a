//! Stale-while-revalidate: race the store against the origin.

use std::fmt;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::fallback;
use crate::cache::{CacheStore, CachedEntry, Generation, RequestIdentity};
use crate::fetch::Fetch;
use crate::http::{Request, Response, ResponseKind};

/// Which path produced the response handed to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Served from the current generation.
    Hit,
    /// Nothing stored; served the origin response.
    Miss,
    /// The origin answered before the store did.
    Refresh,
    /// Neither the store nor the origin produced a response.
    Fallback,
}

impl CacheOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Miss => "miss",
            Self::Refresh => "refresh",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an origin response may be written to the store.
pub fn is_cacheable(response: &Response, max_entry_bytes: usize) -> bool {
    !response.status().is_error()
        && response.kind() == ResponseKind::Basic
        && response.body_ref().len() <= max_entry_bytes
}

enum First {
    Lookup(Option<CachedEntry>),
    Network(Option<Response>),
}

pub(crate) struct RefreshStrategy {
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetch>,
    generation: Generation,
    max_entry_bytes: usize,
    tracker: TaskTracker,
}

impl RefreshStrategy {
    pub(crate) fn new(
        store: Arc<dyn CacheStore>,
        fetcher: Arc<dyn Fetch>,
        generation: Generation,
        max_entry_bytes: usize,
    ) -> Self {
        Self {
            store,
            fetcher,
            generation,
            max_entry_bytes,
            tracker: TaskTracker::new(),
        }
    }

    /// Serves `request` from whichever of the store and the origin answers
    /// acceptably first.
    ///
    /// The origin fetch always runs to completion on its own task and, when
    /// cacheable, overwrites the stored entry after the caller has been
    /// answered.
    pub(crate) async fn handle(
        &self,
        request: Request,
        identity: RequestIdentity,
    ) -> (Response, CacheOutcome) {
        let mut network = self.spawn_refresh(request, identity.clone());
        let lookup = self.lookup(&identity);
        tokio::pin!(lookup);

        let first = tokio::select! {
            biased;
            cached = &mut lookup => First::Lookup(cached),
            fetched = &mut network => First::Network(fetched.ok().flatten()),
        };

        match first {
            First::Lookup(Some(entry)) => {
                debug!(identity = %identity, "cache hit");
                (entry.to_response(), CacheOutcome::Hit)
            }
            First::Lookup(None) => {
                debug!(identity = %identity, "cache miss; waiting for origin");
                match network.await.ok().flatten() {
                    Some(response) => (response, CacheOutcome::Miss),
                    None => serve_fallback(&identity),
                }
            }
            First::Network(Some(response)) => {
                debug!(identity = %identity, "origin answered before the store");
                (response, CacheOutcome::Refresh)
            }
            First::Network(None) => match lookup.await {
                Some(entry) => {
                    debug!(identity = %identity, "origin failed; serving cached copy");
                    (entry.to_response(), CacheOutcome::Hit)
                }
                None => serve_fallback(&identity),
            },
        }
    }

    /// Stops accepting background work and waits for pending cache writes.
    pub(crate) async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    async fn lookup(&self, identity: &RequestIdentity) -> Option<CachedEntry> {
        match self.store.lookup(&self.generation, identity).await {
            Ok(found) => found,
            Err(e) => {
                warn!(store = self.store.name(), identity = %identity, error = %e, "cache lookup failed; treating as miss");
                None
            }
        }
    }

    /// Starts the origin fetch. The receiver yields `None` on transport failure.
    fn spawn_refresh(
        &self,
        request: Request,
        identity: RequestIdentity,
    ) -> oneshot::Receiver<Option<Response>> {
        let (tx, rx) = oneshot::channel();
        let store = Arc::clone(&self.store);
        let fetcher = Arc::clone(&self.fetcher);
        let generation = self.generation.clone();
        let max_entry_bytes = self.max_entry_bytes;

        self.tracker.spawn(async move {
            let response = match fetcher.fetch(&request).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(identity = %identity, error = %e, "origin fetch failed");
                    let _ = tx.send(None);
                    return;
                }
            };

            // The caller may already have been served; a closed channel is fine.
            let _ = tx.send(Some(response.clone()));

            if !is_cacheable(&response, max_entry_bytes) {
                debug!(
                    identity = %identity,
                    status = response.status().as_u16(),
                    kind = response.kind().as_str(),
                    "response not cacheable"
                );
                return;
            }

            let entry = CachedEntry::from_response(identity.url().as_str(), &response);
            match store.write(&generation, &identity, entry).await {
                Ok(()) => debug!(identity = %identity, generation = %generation, "cache updated"),
                Err(e) => {
                    warn!(store = store.name(), identity = %identity, error = %e, "cache write failed")
                }
            }
        });

        rx
    }
}

fn serve_fallback(identity: &RequestIdentity) -> (Response, CacheOutcome) {
    warn!(identity = %identity, "no cached copy and origin unavailable; serving fallback");
    (fallback::unavailable(), CacheOutcome::Fallback)
}
