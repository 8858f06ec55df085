/*
 * SPDX-FileCopyrightText: 2026 Unifeed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::errors::ProtocolError;
use crate::http_fetch::{FetchRequest, Transport};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Entries older than this are considered stale and re-fetched on demand.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(4 * 7 * 24 * 3600);

const DEFAULT_MAX_ENTRIES: usize = 1024;

#[derive(Clone)]
struct CacheEntry {
    path: PathBuf,
    fetched_at: SystemTime,
}

/// Bounded, time-expiring cache of avatar images, keyed by source URL and
/// stored as content-hash-named files. Plugins reach it through the
/// dispatcher context rather than downloading avatars themselves.
#[derive(Clone)]
pub struct AvatarCache {
    dir: PathBuf,
    transport: Arc<dyn Transport>,
    freshness: Duration,
    max_entries: usize,
    index: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl AvatarCache {
    pub fn new(dir: impl Into<PathBuf>, transport: Arc<dyn Transport>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create avatar dir: {}", dir.display()))?;
        Ok(Self {
            dir,
            transport,
            freshness: DEFAULT_FRESHNESS,
            max_entries: DEFAULT_MAX_ENTRIES,
            index: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    /// Local cache path for an avatar URL.
    pub fn cache_path(&self, url: &str) -> PathBuf {
        use sha2::Digest as _;
        let mut h = sha2::Sha256::new();
        h.update(url.as_bytes());
        self.dir.join(hex::encode(&h.finalize()[..20]))
    }

    /// Return the cached file for `url`, downloading it when absent or older
    /// than the freshness window.
    pub async fn get_or_fetch(&self, url: &str) -> Result<PathBuf, ProtocolError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(ProtocolError::Permanent("empty avatar url".to_string()));
        }
        let path = self.cache_path(url);

        if let Some(entry) = self.fresh_entry(url) {
            return Ok(entry.path);
        }
        // A previous process run may have left a usable file behind.
        if let Some(mtime) = file_mtime(&path) {
            if age_of(mtime) < self.freshness {
                self.remember(url, path.clone(), mtime);
                return Ok(path);
            }
        }

        debug!(url, "fetching avatar");
        let resp = self
            .transport
            .fetch(FetchRequest::get(url))
            .await
            .map_err(ProtocolError::from)?;
        if !resp.is_success() {
            return Err(ProtocolError::from_status(resp.status, resp.retry_after));
        }

        let body = resp.body;
        let write_path = path.clone();
        tokio::task::spawn_blocking(move || std::fs::write(&write_path, &body))
            .await
            .map_err(|e| ProtocolError::Permanent(e.to_string()))?
            .map_err(|e| ProtocolError::Permanent(format!("write avatar: {e}")))?;

        self.remember(url, path.clone(), SystemTime::now());
        Ok(path)
    }

    /// Evict every cached avatar older than `older_than`, on disk and in the
    /// index. Returns the number of files removed.
    pub async fn expire_older_than(&self, older_than: Duration) -> Result<u64> {
        let dir = self.dir.clone();
        let removed = tokio::task::spawn_blocking(move || sweep_dir(&dir, older_than)).await??;

        let mut index = self.index.lock().unwrap();
        index.retain(|_, entry| entry.path.exists());
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fresh_entry(&self, url: &str) -> Option<CacheEntry> {
        let index = self.index.lock().unwrap();
        let entry = index.get(url)?;
        if age_of(entry.fetched_at) < self.freshness && entry.path.exists() {
            Some(entry.clone())
        } else {
            None
        }
    }

    fn remember(&self, url: &str, path: PathBuf, fetched_at: SystemTime) {
        let mut index = self.index.lock().unwrap();
        index.insert(url.to_string(), CacheEntry { path, fetched_at });
        while index.len() > self.max_entries {
            let Some(oldest) = index
                .iter()
                .min_by_key(|(_, e)| e.fetched_at)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            if let Some(entry) = index.remove(&oldest) {
                let _ = std::fs::remove_file(&entry.path);
            }
        }
    }
}

fn age_of(t: SystemTime) -> Duration {
    SystemTime::now().duration_since(t).unwrap_or_default()
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    let meta = std::fs::metadata(path).ok()?;
    if meta.len() == 0 {
        return None;
    }
    meta.modified().ok()
}

fn sweep_dir(dir: &Path, older_than: Duration) -> Result<u64> {
    let mut removed = 0u64;
    for ent in std::fs::read_dir(dir).context("read avatar dir")? {
        let ent = ent?;
        let path = ent.path();
        if !path.is_file() {
            continue;
        }
        let mtime = ent
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        if age_of(mtime) >= older_than {
            // Already-gone files lost a race with another sweep; ignore.
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to expire {}: {e}", path.display()),
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::http_fetch::FetchResponse;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CannedTransport {
        fetches: AtomicUsize,
        status: u16,
    }

    impl CannedTransport {
        fn ok() -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                status: 200,
            }
        }
    }

    #[async_trait]
    impl Transport for CannedTransport {
        async fn fetch(&self, _req: FetchRequest) -> Result<FetchResponse, TransportError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(FetchResponse {
                status: self.status,
                body: bytes::Bytes::from_static(b"image-bytes"),
                retry_after: None,
            })
        }
    }

    #[tokio::test]
    async fn second_lookup_hits_the_cache() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(CannedTransport::ok());
        let cache = AvatarCache::new(dir.path(), transport.clone()).unwrap();

        let first = cache
            .get_or_fetch("http://example.invalid/a.png")
            .await
            .unwrap();
        let second = cache
            .get_or_fetch("http://example.invalid/a.png")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read(&first).unwrap(), b"image-bytes");
    }

    #[tokio::test]
    async fn zero_freshness_always_refetches() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(CannedTransport::ok());
        let cache = AvatarCache::new(dir.path(), transport.clone())
            .unwrap()
            .with_freshness(Duration::ZERO);

        cache
            .get_or_fetch("http://example.invalid/a.png")
            .await
            .unwrap();
        cache
            .get_or_fetch("http://example.invalid/a.png")
            .await
            .unwrap();
        assert_eq!(transport.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_status_is_classified() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(CannedTransport {
            fetches: AtomicUsize::new(0),
            status: 404,
        });
        let cache = AvatarCache::new(dir.path(), transport).unwrap();
        let err = cache
            .get_or_fetch("http://example.invalid/missing.png")
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Permanent(_)));
    }

    #[tokio::test]
    async fn expire_sweeps_disk_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(CannedTransport::ok());
        let cache = AvatarCache::new(dir.path(), transport).unwrap();

        cache
            .get_or_fetch("http://example.invalid/a.png")
            .await
            .unwrap();
        cache
            .get_or_fetch("http://example.invalid/b.png")
            .await
            .unwrap();
        assert_eq!(cache.len(), 2);

        // Everything is older than a zero threshold.
        let removed = cache.expire_older_than(Duration::ZERO).await.unwrap();
        assert_eq!(removed, 2);
        assert!(cache.is_empty());
    }
}
