//! Per-request context handed through the middleware pipeline.

use std::net::SocketAddr;

use tokio::time::Instant;

use crate::Request;

/// Per-request context: the parsed request plus connection facts.
#[derive(Debug)]
pub struct Context {
    request: Request,
    peer: Option<SocketAddr>,
    received_at: Instant,
}

impl Context {
    /// Create a new context from a request
    pub fn new(request: Request) -> Self {
        Self {
            request,
            peer: None,
            received_at: Instant::now(),
        }
    }

    /// Records the address of the client that sent the request.
    #[must_use]
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// When the request was handed to the pipeline.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn into_request(self) -> Request {
        self.request
    }
}
