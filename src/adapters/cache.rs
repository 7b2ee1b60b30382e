//! On-disk cache of successful generations, keyed by request content.

use crate::domain::model::{GenerationOptions, TokenUsage};
use crate::utils::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const CACHE_FILE_NAME: &str = "responses.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub text: String,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    pub model: String,
    pub stored_at: DateTime<Utc>,
}

/// Size of the cache as seen on disk plus unsaved entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub path: PathBuf,
    pub entries: usize,
    pub file_bytes: u64,
    pub unsaved: bool,
}

/// Entries live in memory and reach disk on [`ResponseCache::flush`] or drop.
#[derive(Debug)]
pub struct ResponseCache {
    path: PathBuf,
    entries: BTreeMap<String, CacheEntry>,
    dirty: bool,
}

impl ResponseCache {
    /// Loads `<dir>/responses.json`. An unreadable cache file is ignored and
    /// replaced on the next store.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(CACHE_FILE_NAME);

        let entries = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "⚠️ response cache is corrupt, starting empty");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(path = %path.display(), entries = entries.len(), "📦 response cache loaded");
        Ok(Self {
            path,
            entries,
            dirty: false,
        })
    }

    /// SHA-256 over everything that influences the generated text.
    pub fn key(prompt: &str, options: &GenerationOptions) -> String {
        let mut hasher = Sha256::new();
        hasher.update(options.model.as_bytes());
        hasher.update([0u8]);
        hasher.update(options.temperature.to_le_bytes());
        hasher.update(options.max_tokens.to_le_bytes());
        hasher.update([u8::from(options.json_mode)]);
        hasher.update(prompt.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn store(&mut self, key: String, entry: CacheEntry) {
        self.entries.insert(key, entry);
        self.dirty = true;
    }

    /// Rewrites the cache file atomically if anything changed since the last flush.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.save()?;
        self.dirty = false;
        tracing::debug!(path = %self.path.display(), entries = self.entries.len(), "response cache saved");
        Ok(())
    }

    /// Drops every entry and removes the cache file.
    pub fn clear(&mut self) -> Result<usize> {
        let removed = self.entries.len();
        self.entries.clear();
        self.dirty = false;
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(path = %self.path.display(), removed, "🧹 response cache cleared");
        Ok(removed)
    }

    pub fn info(&self) -> CacheInfo {
        CacheInfo {
            path: self.path.clone(),
            entries: self.entries.len(),
            file_bytes: fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
            unsaved: self.dirty,
        }
    }

    fn save(&self) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut staging = tempfile::Builder::new()
            .prefix(".responses-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        serde_json::to_writer_pretty(staging.as_file_mut(), &self.entries)?;
        staging.as_file_mut().flush()?;
        staging.persist(&self.path)?;
        Ok(())
    }
}

impl Drop for ResponseCache {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(path = %self.path.display(), error = %e, "⚠️ could not save response cache");
        }
    }
}
