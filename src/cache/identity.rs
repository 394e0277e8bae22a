//! Request identity: what a cached response is keyed by.

use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::fetch::{FetchError, resolve_url};
use crate::http::{Method, Request};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("method {0} has side effects and cannot key a cache entry")]
    UnsafeMethod(Method),

    #[error(transparent)]
    Target(#[from] FetchError),
}

/// The (method, absolute URL, selected headers) tuple a response is stored under.
///
/// Only safe methods can form an identity. Selected header names are
/// lowercased and the pairs kept sorted, so two requests that differ only in
/// header order or name casing share an identity.
///
/// ```
/// use swrproxy::cache::RequestIdentity;
/// use swrproxy::http::{Method, Request};
/// use url::Url;
///
/// let origin = Url::parse("http://app.local/").unwrap();
/// let req = Request::new(Method::Get, "/index.html").header("Accept-Language", "fr");
/// let id = RequestIdentity::from_request(&req, &origin, &["accept-language".into()]).unwrap();
///
/// assert_eq!(id.url().as_str(), "http://app.local/index.html");
/// assert_eq!(id.digest().len(), 64);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
    method: Method,
    url: Url,
    headers: Vec<(String, String)>,
}

impl RequestIdentity {
    /// Builds an identity from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`IdentityError::UnsafeMethod`] for methods with side effects.
    pub fn new(method: Method, mut url: Url) -> Result<Self, IdentityError> {
        if !method.is_safe() {
            return Err(IdentityError::UnsafeMethod(method));
        }
        url.set_fragment(None);
        Ok(Self {
            method,
            url,
            headers: Vec::new(),
        })
    }

    /// Adds a header value that changes how the resource is interpreted.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers
            .push((name.to_ascii_lowercase(), value.trim().to_owned()));
        self.headers.sort();
        self
    }

    /// Derives the identity of `request`, resolving its target against `origin`
    /// and picking up the values of `key_headers` that are present.
    ///
    /// # Errors
    ///
    /// Fails for unsafe methods and for targets that cannot be resolved.
    pub fn from_request(
        request: &Request,
        origin: &Url,
        key_headers: &[String],
    ) -> Result<Self, IdentityError> {
        let url = resolve_url(origin, request)?;
        let mut identity = Self::new(request.method().clone(), url)?;
        for name in key_headers {
            let values: Vec<&str> = request.headers().get_all(name).collect();
            if !values.is_empty() {
                identity = identity.with_header(name, &values.join(", "));
            }
        }
        Ok(identity)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Stable textual form: request line followed by one `name: value` line per key header.
    pub fn canonical(&self) -> String {
        let mut out = format!("{} {}", self.method, self.url);
        for (name, value) in &self.headers {
            out.push('\n');
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
        }
        out
    }

    /// Hex SHA-256 of [`canonical`](Self::canonical); the storage address of an entry.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical().as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

impl fmt::Display for RequestIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}
