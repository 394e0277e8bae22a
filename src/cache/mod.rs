//! Response storage partitioned into generations.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheStore`] | Async trait every backend implements |
//! | [`MemoryStore`] | In-process store with per-generation LRU bounds |
//! | [`DiskStore`] | Durable store, one directory per generation |
//! | [`RequestIdentity`] | Method + URL + selected headers; the cache key |
//! | [`CachedEntry`] | A stored status, header set and body |
//! | [`Generation`] | Validated generation name |
//! | [`GenerationManager`] | Deletes every generation except the current one |
//!
//! A miss is `Ok(None)`, never an error. Store errors are reserved for the
//! store itself being unusable; callers in the request path treat them as
//! misses.

use std::path::{Path, PathBuf};

use thiserror::Error;

mod disk;
mod entry;
mod generation;
mod identity;
mod store;

pub use disk::DiskStore;
pub use entry::CachedEntry;
pub use generation::{ActivationReport, Generation, GenerationError, GenerationManager};
pub use identity::{IdentityError, RequestIdentity};
pub use store::{CacheStore, MemoryStore};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt cache entry at {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}
