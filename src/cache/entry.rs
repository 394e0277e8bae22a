//! Stored responses.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::http::{Headers, Response, StatusCode};

/// A response as held by a [`CacheStore`](super::CacheStore).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    /// URL the response was fetched from.
    pub url: String,
    pub status: StatusCode,
    pub headers: Headers,
    pub body: Bytes,
    /// Unix seconds at which the entry was created.
    pub stored_at: u64,
}

impl CachedEntry {
    pub fn new(url: impl Into<String>, status: StatusCode, headers: Headers, body: Bytes) -> Self {
        Self {
            url: url.into(),
            status,
            headers,
            body,
            stored_at: unix_now(),
        }
    }

    /// Captures `response` for storage. The body is shared, not copied.
    pub fn from_response(url: impl Into<String>, response: &Response) -> Self {
        Self::new(
            url,
            response.status(),
            response.headers().clone(),
            response.body_ref().clone(),
        )
    }

    /// Rebuilds a servable response.
    pub fn to_response(&self) -> Response {
        // Origin framing is stripped before storage except on bodiless
        // responses, whose Content-Length must survive.
        let bodiless = self.body.is_empty() && self.headers.contains("content-length");
        Response::from_parts(self.status, self.headers.clone(), self.body.clone())
            .bodiless(bodiless)
    }

    pub(crate) fn meta(&self) -> EntryMeta {
        EntryMeta {
            url: self.url.clone(),
            status: self.status.as_u16(),
            headers: self.headers.clone().into(),
            body_len: self.body.len(),
            stored_at: self.stored_at,
        }
    }
}

/// Serialized header of an on-disk entry; the body follows it verbatim.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct EntryMeta {
    pub url: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body_len: usize,
    pub stored_at: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
