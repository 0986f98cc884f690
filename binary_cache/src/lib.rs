// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! BinaryCache: on-disk, TTL-bounded store of downloaded file bodies, keyed by remote path.
//!
//! The per-path download singleton is grounded directly on the teacher's `fs/store/src/local.rs`
//! use of `async-oncecell::OnceCell`: concurrent callers share one in-flight download, and an
//! `OnceCell` whose init future returns `Err` stays uninitialized, so a failed download doesn't
//! poison the path for subsequent attempts.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use async_oncecell::OnceCell;
use bytes::Bytes;
use parking_lot::Mutex;
use path_key::PathKey;
use rq_error::{Error, Result};
use share_bus::{ShareBus, ShareEvent};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
pub struct BinaryCacheEntry {
    pub local_path: PathBuf,
    pub remote_last_modified: SystemTime,
    pub fetched_at: Instant,
    pub size: u64,
}

pub struct BinaryCache {
    root: PathBuf,
    bin_ttl: Duration,
    bus: ShareBus,
    entries: Mutex<HashMap<PathKey, BinaryCacheEntry>>,
    in_flight: Mutex<HashMap<PathKey, Arc<OnceCell<BinaryCacheEntry>>>>,
    bytes_on_disk: AtomicU64,
}

impl BinaryCache {
    pub fn new(root: impl Into<PathBuf>, bin_ttl: Duration, bus: ShareBus) -> Self {
        BinaryCache {
            root: root.into(),
            bin_ttl,
            bus,
            entries: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            bytes_on_disk: AtomicU64::new(0),
        }
    }

    fn local_path(&self, path: &PathKey) -> PathBuf {
        let mut out = self.root.clone();
        for segment in path.as_str().split('/').filter(|s| !s.is_empty()) {
            out.push(segment);
        }
        out
    }

    fn fresh_entry(&self, path: &PathKey, remote_last_modified: SystemTime) -> Option<BinaryCacheEntry> {
        let mut entries = self.entries.lock();
        match entries.get(path) {
            Some(e)
                if e.fetched_at.elapsed() <= self.bin_ttl && remote_last_modified <= e.remote_last_modified =>
            {
                Some(e.clone())
            }
            Some(_) => {
                entries.remove(path);
                None
            }
            None => None,
        }
    }

    fn in_flight_cell(&self, path: &PathKey) -> Arc<OnceCell<BinaryCacheEntry>> {
        self.in_flight
            .lock()
            .entry(path.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    fn forget_in_flight_cell(&self, path: &PathKey, cell: &Arc<OnceCell<BinaryCacheEntry>>) {
        let mut guard = self.in_flight.lock();
        if let Some(current) = guard.get(path) {
            if Arc::ptr_eq(current, cell) {
                guard.remove(path);
            }
        }
    }

    /// Returns a usable local file for `path`. If the cached copy is stale or missing, `fetch` is
    /// invoked — exactly once, regardless of how many concurrent callers are waiting — and its
    /// result is persisted before being handed back.
    pub async fn checkout<F, Fut>(&self, path: &PathKey, remote_last_modified: SystemTime, fetch: F) -> Result<PathBuf>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        if let Some(entry) = self.fresh_entry(path, remote_last_modified) {
            return Ok(entry.local_path);
        }

        let cell = self.in_flight_cell(path);
        let result = cell
            .get_or_try_init(self.download(path, remote_last_modified, fetch))
            .await;
        self.forget_in_flight_cell(path, &cell);
        result.map(|entry| entry.local_path.clone())
    }

    async fn download<F, Fut>(&self, path: &PathKey, remote_last_modified: SystemTime, fetch: F) -> Result<BinaryCacheEntry>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        log::debug!("binary_cache: downloading {path}");
        let bytes = fetch().await?;
        let local_path = self.local_path(path);
        let dir = local_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::io("cache path has no parent directory"))?;
        tokio::fs::create_dir_all(&dir).await.map_err(Error::from)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".hybridfs-dl-")
            .tempfile_in(&dir)
            .map_err(Error::from)?;
        {
            let file = tmp.as_file_mut();
            let mut async_file = tokio::fs::File::from_std(file.try_clone().map_err(Error::from)?);
            async_file.write_all(&bytes).await.map_err(Error::from)?;
            async_file.flush().await.map_err(Error::from)?;
        }
        tmp.persist(&local_path)
            .map_err(|e| Error::io(format!("failed to publish download to {local_path:?}: {e}")))?;

        let entry = BinaryCacheEntry {
            local_path,
            remote_last_modified,
            fetched_at: Instant::now(),
            size: bytes.len() as u64,
        };
        self.entries.lock().insert(path.clone(), entry.clone());
        self.bytes_on_disk.fetch_add(entry.size, Ordering::SeqCst);
        self.emit_cache_size(false);
        Ok(entry)
    }

    /// Updates the cached entry's freshness watermark without re-downloading, used after a
    /// successful upload whose new remote `lastModified` is already known.
    pub fn touch(&self, path: &PathKey, new_last_modified: SystemTime) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(path)
            .ok_or_else(|| Error::corruption(format!("touch on uncached path {path}")))?;
        entry.remote_last_modified = new_last_modified;
        entry.fetched_at = Instant::now();
        Ok(())
    }

    pub async fn evict(&self, path: &PathKey, forced: bool) -> Result<()> {
        let removed = self.entries.lock().remove(path);
        if let Some(entry) = removed {
            match tokio::fs::remove_file(&entry.local_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            self.bytes_on_disk.fetch_sub(entry.size, Ordering::SeqCst);
            self.emit_cache_size(forced);
        }
        Ok(())
    }

    pub fn bytes_on_disk(&self) -> u64 {
        self.bytes_on_disk.load(Ordering::SeqCst)
    }

    fn emit_cache_size(&self, forced: bool) {
        self.bus.publish(ShareEvent::CacheSize {
            bytes: self.bytes_on_disk(),
            forced,
        });
    }
}
