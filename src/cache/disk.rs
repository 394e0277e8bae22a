//! Durable store on the local filesystem.
//!
//! Layout: `<root>/<generation>/<identity digest>.entry`. An entry file is one
//! line of JSON metadata followed by the raw body bytes. Writes land in a
//! dot-prefixed [`tempfile::NamedTempFile`] that is persisted over the final
//! path, so a reader sees either the previous entry or the new one and
//! concurrent writers of the same identity leave exactly one complete file
//! behind. A failed write never leaves its temporary file around.

use std::collections::BTreeSet;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::debug;

use super::entry::{CachedEntry, EntryMeta};
use super::generation::Generation;
use super::identity::RequestIdentity;
use super::store::CacheStore;
use super::StoreError;
use crate::http::StatusCode;

const ENTRY_EXT: &str = "entry";

pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|source| StoreError::io(&root, source))?;
        Ok(Self { root })
    }

    fn generation_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn entry_path(&self, generation: &Generation, identity: &RequestIdentity) -> PathBuf {
        self.generation_dir(generation.as_str())
            .join(format!("{}.{ENTRY_EXT}", identity.digest()))
    }
}

fn encode(entry: &CachedEntry) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = serde_json::to_vec(&entry.meta())?;
    out.push(b'\n');
    out.extend_from_slice(&entry.body);
    Ok(out)
}

/// Writes `bytes` next to `path` and renames it into place. The temporary
/// file is deleted when dropped, which covers every failure below.
fn persist_entry(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut temp = tempfile::Builder::new()
        .prefix(".")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|source| StoreError::io(dir, source))?;
    temp.write_all(bytes)
        .and_then(|()| temp.as_file().sync_data())
        .map_err(|source| StoreError::io(temp.path(), source))?;
    temp.persist(path)
        .map_err(|err| StoreError::io(path, err.error))?;
    Ok(())
}

fn decode(path: &Path, raw: Vec<u8>) -> Result<CachedEntry, StoreError> {
    let corrupt = |reason: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };
    let split = raw
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| corrupt("missing metadata line".into()))?;
    let meta: EntryMeta =
        serde_json::from_slice(&raw[..split]).map_err(|e| corrupt(e.to_string()))?;

    let mut body = Bytes::from(raw);
    let body = body.split_off(split + 1);
    if body.len() != meta.body_len {
        return Err(corrupt(format!(
            "body is {} bytes, metadata says {}",
            body.len(),
            meta.body_len
        )));
    }
    let status = StatusCode::from_u16(meta.status).map_err(|e| corrupt(e.to_string()))?;

    Ok(CachedEntry {
        url: meta.url,
        status,
        headers: meta.headers.into(),
        body,
        stored_at: meta.stored_at,
    })
}

#[async_trait]
impl CacheStore for DiskStore {
    async fn lookup(
        &self,
        generation: &Generation,
        identity: &RequestIdentity,
    ) -> Result<Option<CachedEntry>, StoreError> {
        let path = self.entry_path(generation, identity);
        match fs::read(&path).await {
            Ok(raw) => decode(&path, raw).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    async fn write(
        &self,
        generation: &Generation,
        identity: &RequestIdentity,
        entry: CachedEntry,
    ) -> Result<(), StoreError> {
        let dir = self.generation_dir(generation.as_str());
        fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::io(&dir, source))?;

        let path = self.entry_path(generation, identity);
        let bytes = encode(&entry).map_err(|e| StoreError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        tokio::task::spawn_blocking(move || persist_entry(&dir, &path, &bytes))
            .await
            .map_err(|e| StoreError::Unavailable(format!("cache write task failed: {e}")))?
    }

    async fn list_generations(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut names = BTreeSet::new();
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(StoreError::io(&self.root, e)),
        };
        while let Some(item) = dir
            .next_entry()
            .await
            .map_err(|source| StoreError::io(&self.root, source))?
        {
            let is_dir = item
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            let Some(name) = item.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if is_dir && Generation::new(name.as_str()).is_ok() {
                names.insert(name);
            } else {
                debug!(entry = %item.path().display(), "ignoring non-generation entry in cache root");
            }
        }
        Ok(names)
    }

    async fn delete_generation(&self, name: &str) -> Result<bool, StoreError> {
        let generation = Generation::new(name)?;
        let dir = self.generation_dir(generation.as_str());
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&dir, e)),
        }
    }

    fn name(&self) -> &'static str {
        "disk"
    }
}
