//! Cache generations and the activation-time cleanup pass.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::store::CacheStore;

const MAX_GENERATION_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generation name is empty")]
    Empty,

    #[error("generation name is {len} bytes, the limit is {}", MAX_GENERATION_LEN)]
    TooLong { len: usize },

    #[error("generation name contains {ch:?}; only ASCII letters, digits, '-', '_' and '.' are allowed")]
    InvalidChar { ch: char },

    #[error("generation name {0:?} is reserved")]
    Reserved(String),
}

/// A validated generation name.
///
/// Names double as directory names for the disk store, so they are limited to
/// a conservative character set.
///
/// ```
/// use swrproxy::cache::Generation;
///
/// let current = Generation::new("static-cache-v-d040c9ff").unwrap();
/// assert_eq!(current.as_str(), "static-cache-v-d040c9ff");
/// assert!(Generation::new("../etc").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(String);

impl Generation {
    /// # Errors
    ///
    /// Returns a [`GenerationError`] describing why `name` is not acceptable.
    pub fn new(name: impl Into<String>) -> Result<Self, GenerationError> {
        let name = name.into();
        if name.is_empty() {
            return Err(GenerationError::Empty);
        }
        if name.len() > MAX_GENERATION_LEN {
            return Err(GenerationError::TooLong { len: name.len() });
        }
        if let Some(ch) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(GenerationError::InvalidChar { ch });
        }
        if name == "." || name == ".." || name.starts_with('.') {
            return Err(GenerationError::Reserved(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Generation {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What an activation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Stale generations that were removed.
    pub deleted: Vec<String>,
    /// Stale generations whose removal failed, with the error text.
    pub failed: Vec<(String, String)>,
}

impl ActivationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Owns the current generation and prunes every other one.
///
/// This is the only component that deletes generations.
pub struct GenerationManager {
    store: Arc<dyn CacheStore>,
    current: Generation,
}

impl GenerationManager {
    pub fn new(store: Arc<dyn CacheStore>, current: Generation) -> Self {
        Self { store, current }
    }

    pub fn current(&self) -> &Generation {
        &self.current
    }

    /// Deletes every stored generation other than the current one.
    ///
    /// Deletions run concurrently and independently: a failure is logged and
    /// recorded in the report without stopping the others. Returns once every
    /// deletion has finished.
    pub async fn activate(&self) -> ActivationReport {
        let names = match self.store.list_generations().await {
            Ok(names) => names,
            Err(e) => {
                warn!(store = self.store.name(), error = %e, "could not list cache generations; skipping cleanup");
                return ActivationReport::default();
            }
        };

        let stale: Vec<String> = names
            .into_iter()
            .filter(|name| name != self.current.as_str())
            .collect();

        if stale.is_empty() {
            debug!(current = %self.current, "no out-of-date cache generations");
            return ActivationReport::default();
        }

        let deletions = stale.into_iter().map(|name| {
            let store = Arc::clone(&self.store);
            async move {
                info!(generation = %name, "deleting out-of-date cache generation");
                let outcome = store.delete_generation(&name).await;
                (name, outcome)
            }
        });

        let mut report = ActivationReport::default();
        for (name, outcome) in join_all(deletions).await {
            match outcome {
                Ok(_) => report.deleted.push(name),
                Err(e) => {
                    warn!(generation = %name, error = %e, "failed to delete cache generation");
                    report.failed.push((name, e.to_string()));
                }
            }
        }

        info!(
            current = %self.current,
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "cache generations reconciled"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachedEntry, MemoryStore, RequestIdentity, StoreError};
    use crate::http::{Headers, Method, StatusCode};
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use url::Url;

    fn entry(body: &'static str) -> CachedEntry {
        CachedEntry::new("http://app.local/", StatusCode::OK, Headers::new(), body.into())
    }

    fn identity() -> RequestIdentity {
        RequestIdentity::new(Method::Get, Url::parse("http://app.local/").unwrap()).unwrap()
    }

    #[test]
    fn names_are_validated() {
        assert_eq!(Generation::new(""), Err(GenerationError::Empty));
        assert_eq!(
            Generation::new("a/b"),
            Err(GenerationError::InvalidChar { ch: '/' })
        );
        assert!(matches!(
            Generation::new(".."),
            Err(GenerationError::Reserved(_))
        ));
        assert!(matches!(
            Generation::new("x".repeat(129)),
            Err(GenerationError::TooLong { len: 129 })
        ));
        assert!(Generation::new("v1.2_build-7").is_ok());
    }

    #[tokio::test]
    async fn activation_keeps_only_current() {
        let store = Arc::new(MemoryStore::new(16));
        let a = Generation::new("A").unwrap();
        let b = Generation::new("B").unwrap();
        store.write(&a, &identity(), entry("old")).await.unwrap();
        store.write(&b, &identity(), entry("new")).await.unwrap();

        let manager = GenerationManager::new(store.clone(), b.clone());
        let report = manager.activate().await;

        assert_eq!(report.deleted, vec!["A".to_string()]);
        assert!(report.is_clean());
        let remaining = store.list_generations().await.unwrap();
        assert_eq!(remaining, BTreeSet::from(["B".to_string()]));
        let kept = store.lookup(&b, &identity()).await.unwrap().unwrap();
        assert_eq!(kept.body.as_ref(), b"new");
    }

    /// Lists a fixed set and refuses to delete one of them.
    struct Stubborn;

    #[async_trait]
    impl CacheStore for Stubborn {
        async fn lookup(
            &self,
            _: &Generation,
            _: &RequestIdentity,
        ) -> Result<Option<CachedEntry>, StoreError> {
            Ok(None)
        }
        async fn write(
            &self,
            _: &Generation,
            _: &RequestIdentity,
            _: CachedEntry,
        ) -> Result<(), StoreError> {
            Ok(())
        }
        async fn list_generations(&self) -> Result<BTreeSet<String>, StoreError> {
            Ok(BTreeSet::from([
                "old-1".to_string(),
                "locked".to_string(),
                "old-2".to_string(),
                "current".to_string(),
            ]))
        }
        async fn delete_generation(&self, name: &str) -> Result<bool, StoreError> {
            if name == "locked" {
                Err(StoreError::Unavailable("generation is locked".into()))
            } else {
                Ok(true)
            }
        }
        fn name(&self) -> &'static str {
            "stubborn"
        }
    }

    #[tokio::test]
    async fn one_failed_deletion_does_not_stop_the_rest() {
        let manager = GenerationManager::new(Arc::new(Stubborn), Generation::new("current").unwrap());
        let report = manager.activate().await;

        assert_eq!(report.deleted, vec!["old-1".to_string(), "old-2".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "locked");
        assert!(!report.is_clean());
    }
}
