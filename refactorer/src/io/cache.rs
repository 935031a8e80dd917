//! Cache stores for memoized steps.
//!
//! Durable entries are stored at `{cache_dir}/{scope}/{step}/{fingerprint}.json`. Entries
//! never expire; deleting the directory is the only way to invalidate them.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Location of a cache entry: the step's namespace plus its input fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Slash-separated scope path ending with the step name (e.g. `run/plan`).
    pub namespace: String,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub namespace: String,
    pub fingerprint: String,
    pub created_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub output: serde_json::Value,
    pub metadata: EntryMetadata,
}

/// Minimal persistence interface behind the step framework.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;
    fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()>;
    fn has(&self, key: &CacheKey) -> Result<bool>;
}

/// Process-local store; contents are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory cache lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory cache lock poisoned"))?;
        entries.insert(key.clone(), entry.clone());
        Ok(())
    }

    fn has(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// Filesystem store that survives process restarts.
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the on-disk path for an entry.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.namespace.split('/').filter(|s| !s.is_empty()) {
            path.push(sanitize_segment(segment));
        }
        path.join(format!("{}.json", key.fingerprint))
    }
}

impl CacheStore for FileCache {
    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        debug!(path = %path.display(), "loading cached entry");
        let content =
            fs::read_to_string(&path).with_context(|| format!("read cache {}", path.display()))?;
        let entry: CacheEntry = serde_json::from_str(&content)
            .with_context(|| format!("parse cache {}", path.display()))?;
        Ok(Some(entry))
    }

    fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create cache dir {}", parent.display()))?;
        }
        debug!(path = %path.display(), "saving entry to cache");
        let mut content = serde_json::to_string_pretty(entry).context("serialize cache entry")?;
        content.push('\n');
        // Write to a sibling temp file first so a crash never leaves a truncated entry.
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, content)
            .with_context(|| format!("write cache {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path).with_context(|| format!("replace cache {}", path.display()))
    }

    fn has(&self, key: &CacheKey) -> Result<bool> {
        Ok(self.entry_path(key).exists())
    }
}

/// Keep namespace segments safe as directory names (file paths contain `/` and `.`).
fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
