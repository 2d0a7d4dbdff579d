//! Tiling cache: memory memo with optional JSON persistence.
//!
//! Records are keyed by platform fingerprint and by the serialized request,
//! so a cached record is only reused on the same device description.
//!
//! Default file: `~/.cache/conv-tiling/tilings.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::TilingResult;
use crate::tiling::record::TilingRecord;
use crate::tiling::TilingRequest;

/// Bump when the planner's decisions change; stale files are discarded on load.
pub const CACHE_VERSION: &str = "2";

type Entries = BTreeMap<String, BTreeMap<String, TilingRecord>>;

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: String,
    entries: Entries,
}

/// platform fingerprint -> (request key -> record)
#[derive(Debug, Clone, Default)]
pub struct TilingCache {
    entries: Entries,
    /// File path for persistence (None = memory-only)
    path: Option<PathBuf>,
    /// Whether entries changed since the last save
    dirty: bool,
}

impl TilingCache {
    /// Memory-only cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty cache that saves to `path`.
    pub fn with_path(path: PathBuf) -> Self {
        TilingCache { path: Some(path), ..Default::default() }
    }

    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".cache").join("conv-tiling").join("tilings.json")
    }

    /// Load from disk. A missing, corrupt or stale file yields an empty cache
    /// bound to the same path.
    pub fn load(path: &Path) -> Self {
        let mut cache = Self::with_path(path.to_path_buf());
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return cache,
        };
        match serde_json::from_str::<CacheFile>(&content) {
            Ok(file) if file.version == CACHE_VERSION => {
                cache.entries = file.entries;
                log::info!("Loaded {} cached tilings from {:?}", cache.len(), path);
            }
            Ok(file) => {
                log::warn!("Discarding tiling cache version {} (want {})", file.version, CACHE_VERSION);
            }
            Err(e) => {
                log::warn!("Failed to parse tiling cache {:?}: {}", path, e);
            }
        }
        cache
    }

    pub fn load_default() -> Self {
        Self::load(&Self::default_path())
    }

    /// Stable key of a request.
    pub fn request_key(req: &TilingRequest) -> TilingResult<String> {
        Ok(serde_json::to_string(req)?)
    }

    pub fn get(&self, fingerprint: &str, req: &TilingRequest) -> Option<&TilingRecord> {
        let key = Self::request_key(req).ok()?;
        self.entries.get(fingerprint).and_then(|m| m.get(&key))
    }

    pub fn put(&mut self, fingerprint: &str, req: &TilingRequest, record: TilingRecord) -> TilingResult<()> {
        let key = Self::request_key(req)?;
        self.entries.entry(fingerprint.to_string()).or_default().insert(key, record);
        self.dirty = true;
        Ok(())
    }

    /// Write to disk if bound to a path and modified.
    pub fn save(&mut self) -> TilingResult<()> {
        let path = match (&self.path, self.dirty) {
            (Some(p), true) => p.clone(),
            _ => return Ok(()),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = CacheFile { version: CACHE_VERSION.to_string(), entries: self.entries.clone() };
        std::fs::write(&path, serde_json::to_string_pretty(&file)?)?;
        self.dirty = false;
        log::info!("Saved {} cached tilings to {:?}", self.len(), path);
        Ok(())
    }

    /// Number of records across all platforms.
    pub fn len(&self) -> usize {
        self.entries.values().map(|m| m.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record of one platform.
    pub fn clear_platform(&mut self, fingerprint: &str) {
        if self.entries.remove(fingerprint).is_some() {
            self.dirty = true;
        }
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.dirty = true;
        }
    }
}
