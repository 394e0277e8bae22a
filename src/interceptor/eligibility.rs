//! Which requests the cache participates in.

use regex::Regex;
use thiserror::Error;
use url::Url;

use crate::http::{Method, Request};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EligibilityError {
    #[error("method {0} cannot be cached; only GET and HEAD are allowed")]
    UncacheableMethod(Method),

    #[error("at least one cacheable method is required")]
    NoMethods,
}

/// Synchronous per-request policy: method allow-list, path exclusion and scope.
///
/// ```
/// use regex::Regex;
/// use swrproxy::http::{Method, Request};
/// use swrproxy::interceptor::EligibilityFilter;
///
/// let filter = EligibilityFilter::new().exclude(Regex::new("^/livereload").unwrap());
///
/// assert!(filter.is_eligible(&Request::new(Method::Get, "/app.js")));
/// assert!(!filter.is_eligible(&Request::new(Method::Post, "/app.js")));
/// assert!(!filter.is_eligible(&Request::new(Method::Get, "/livereload.js")));
/// ```
#[derive(Debug, Clone)]
pub struct EligibilityFilter {
    methods: Vec<Method>,
    exclude: Option<Regex>,
    scope: String,
}

impl Default for EligibilityFilter {
    fn default() -> Self {
        Self {
            methods: vec![Method::Get],
            exclude: None,
            scope: "/".to_owned(),
        }
    }
}

impl EligibilityFilter {
    /// `GET` only, no exclusion, whole-site scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the allowed methods.
    ///
    /// # Errors
    ///
    /// Refuses an empty list and anything other than `GET` or `HEAD`.
    pub fn with_methods(
        mut self,
        methods: impl IntoIterator<Item = Method>,
    ) -> Result<Self, EligibilityError> {
        let methods: Vec<Method> = methods.into_iter().collect();
        if methods.is_empty() {
            return Err(EligibilityError::NoMethods);
        }
        if let Some(other) = methods
            .iter()
            .find(|m| !matches!(m, Method::Get | Method::Head))
        {
            return Err(EligibilityError::UncacheableMethod(other.clone()));
        }
        self.methods = methods;
        Ok(self)
    }

    /// Requests whose path matches `pattern` always bypass the cache.
    #[must_use]
    pub fn exclude(mut self, pattern: Regex) -> Self {
        self.exclude = Some(pattern);
        self
    }

    /// Only paths starting with `scope` are eligible.
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn is_eligible(&self, request: &Request) -> bool {
        if !self.methods.contains(request.method()) {
            return false;
        }
        let Some(path) = request_path(request) else {
            return false;
        };
        if !path.starts_with(self.scope.as_str()) {
            return false;
        }
        !self.exclude.as_ref().is_some_and(|re| re.is_match(&path))
    }
}

/// Path component of the request target, for absolute-form targets too.
fn request_path(request: &Request) -> Option<String> {
    if request.is_absolute_form() {
        Url::parse(request.path()).ok().map(|url| url.path().to_owned())
    } else {
        Some(request.path().to_owned())
    }
}
