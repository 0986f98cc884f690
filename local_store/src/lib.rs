// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! LocalStore: byte-level local filesystem ops plus the cache-info sidecar namespace.
//! Grounded on `fs/store/src/local.rs`'s shape in the teacher crate — an async trait over the
//! underlying storage, a concrete implementation that does its blocking I/O via
//! `task_executor::Executor::spawn_blocking`, and atomic publish-by-rename for writes — but
//! simplified to a single on-disk tree with no content-addressed dedup layer underneath it.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use model::{CacheInfo, EntityKind, EntityMetadata};
use path_key::PathKey;
use rq_error::{Error, Result};
use task_executor::Executor;
use tokio::io::AsyncWriteExt;

/// How a caller intends to use a file obtained via `LocalStore::open`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

/// The port that `HybridTree` (C8) depends on. Never touches the network; every method operates
/// purely in terms of the local cache root and its `.work/` cache-info sidecar tree.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn exists(&self, path: &PathKey) -> Result<bool>;
    async fn stat(&self, path: &PathKey) -> Result<EntityMetadata>;
    async fn list(&self, path: &PathKey) -> Result<Vec<(String, EntityMetadata)>>;

    async fn create_file(&self, path: &PathKey) -> Result<()>;
    async fn create_directory(&self, path: &PathKey) -> Result<()>;

    async fn read(&self, path: &PathKey) -> Result<Bytes>;
    /// Overwrites the full contents of `path`, publishing atomically (write to a temp file in
    /// the same directory, then rename over the destination).
    async fn write(&self, path: &PathKey, contents: Bytes) -> Result<()>;
    async fn truncate(&self, path: &PathKey, len: u64) -> Result<()>;

    async fn delete(&self, path: &PathKey) -> Result<()>;
    async fn delete_directory(&self, path: &PathKey, allow_non_empty: bool) -> Result<()>;

    /// Renames `from` to `to`, atomically replacing `to` if it already exists.
    async fn rename(&self, from: &PathKey, to: &PathKey) -> Result<()>;

    async fn get_cache_info(&self, path: &PathKey) -> Result<Option<CacheInfo>>;
    async fn set_cache_info(&self, path: &PathKey, info: &CacheInfo) -> Result<()>;
    async fn delete_cache_info(&self, path: &PathKey) -> Result<()>;

    /// True iff `path` has no `CacheInfo` at all, i.e. it was created locally and never
    /// confirmed against the remote.
    async fn is_created_locally(&self, path: &PathKey) -> Result<bool> {
        Ok(self.get_cache_info(path).await?.is_none())
    }

    /// False iff the local mtime has drifted past `CacheInfo.remoteLastModified` by more than
    /// the configured threshold, i.e. there are local modifications not yet persisted remotely.
    async fn can_delete(&self, path: &PathKey) -> Result<bool>;
}

/// Real-filesystem `LocalStore`. `root` holds the cached file bodies; `work_root` mirrors that
/// tree one-for-one with a `.json` sidecar per cached file holding its `CacheInfo`.
#[derive(Clone)]
pub struct FsLocalStore {
    root: PathBuf,
    work_root: PathBuf,
    executor: Executor,
    drift_threshold: Duration,
}

impl FsLocalStore {
    pub fn new(root: impl Into<PathBuf>, executor: Executor, drift_threshold: Duration) -> Self {
        let root = root.into();
        let work_root = root.join(".work");
        FsLocalStore {
            root,
            work_root,
            executor,
            drift_threshold,
        }
    }

    fn fs_path(&self, path: &PathKey) -> PathBuf {
        join_relative(&self.root, path)
    }

    fn sidecar_path(&self, path: &PathKey) -> PathBuf {
        let mut p = join_relative(&self.work_root, path);
        let mut name = p
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push_str(".cacheinfo.json");
        p.set_file_name(name);
        p
    }
}

fn join_relative(root: &Path, path: &PathKey) -> PathBuf {
    let mut out = root.to_path_buf();
    for segment in path.as_str().split('/').filter(|s| !s.is_empty()) {
        out.push(segment);
    }
    out
}

fn metadata_to_entity(meta: &std::fs::Metadata) -> EntityMetadata {
    let kind = if meta.is_dir() {
        EntityKind::Folder
    } else {
        EntityKind::File
    };
    let created = meta.created().unwrap_or(SystemTime::UNIX_EPOCH);
    let last_modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    EntityMetadata {
        kind,
        size: if kind == EntityKind::Folder { 0 } else { meta.len() },
        created,
        last_modified,
        read_only: meta.permissions().readonly(),
        checked_out_by: None,
        etag: None,
    }
}

#[async_trait]
impl LocalStore for FsLocalStore {
    async fn exists(&self, path: &PathKey) -> Result<bool> {
        let fs_path = self.fs_path(path);
        let exists = self
            .executor
            .spawn_blocking(move || fs_path.exists(), |_| false)
            .await;
        Ok(exists)
    }

    async fn stat(&self, path: &PathKey) -> Result<EntityMetadata> {
        let fs_path = self.fs_path(path);
        let meta = self
            .executor
            .spawn_blocking(
                move || std::fs::metadata(&fs_path).map_err(Error::from),
                |_| Err(Error::io("stat task panicked")),
            )
            .await?;
        Ok(metadata_to_entity(&meta))
    }

    async fn list(&self, path: &PathKey) -> Result<Vec<(String, EntityMetadata)>> {
        let fs_path = self.fs_path(path);
        let entries = self
            .executor
            .spawn_blocking(
                move || -> std::result::Result<Vec<(String, EntityMetadata)>, Error> {
                    let mut out = Vec::new();
                    for entry in std::fs::read_dir(&fs_path)? {
                        let entry = entry?;
                        let name = entry.file_name().to_string_lossy().into_owned();
                        let meta = entry.metadata()?;
                        out.push((name, metadata_to_entity(&meta)));
                    }
                    Ok(out)
                },
                |_| Err(Error::io("list task panicked")),
            )
            .await?;
        Ok(entries)
    }

    async fn create_file(&self, path: &PathKey) -> Result<()> {
        let fs_path = self.fs_path(path);
        self.executor
            .spawn_blocking(
                move || -> std::result::Result<(), Error> {
                    if let Some(parent) = fs_path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::OpenOptions::new()
                        .create_new(true)
                        .write(true)
                        .open(&fs_path)
                        .map(|_| ())
                        .map_err(Error::from)
                },
                |_| Err(Error::io("create_file task panicked")),
            )
            .await
    }

    async fn create_directory(&self, path: &PathKey) -> Result<()> {
        let fs_path = self.fs_path(path);
        self.executor
            .spawn_blocking(
                move || std::fs::create_dir_all(&fs_path).map_err(Error::from),
                |_| Err(Error::io("create_directory task panicked")),
            )
            .await
    }

    async fn read(&self, path: &PathKey) -> Result<Bytes> {
        let fs_path = self.fs_path(path);
        let bytes = tokio::fs::read(&fs_path).await.map_err(Error::from)?;
        Ok(Bytes::from(bytes))
    }

    async fn write(&self, path: &PathKey, contents: Bytes) -> Result<()> {
        let fs_path = self.fs_path(path);
        let dir = fs_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::io("path has no parent directory"))?;
        tokio::fs::create_dir_all(&dir).await.map_err(Error::from)?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".hybridfs-tmp-")
            .tempfile_in(&dir)
            .map_err(Error::from)?;
        {
            let file = tmp.as_file_mut();
            let mut async_file = tokio::fs::File::from_std(file.try_clone().map_err(Error::from)?);
            async_file.write_all(&contents).await.map_err(Error::from)?;
            async_file.flush().await.map_err(Error::from)?;
        }
        tmp.persist(&fs_path)
            .map_err(|e| Error::io(format!("failed to publish write to {fs_path:?}: {e}")))?;
        Ok(())
    }

    async fn truncate(&self, path: &PathKey, len: u64) -> Result<()> {
        let fs_path = self.fs_path(path);
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&fs_path)
            .await
            .map_err(Error::from)?;
        file.set_len(len).await.map_err(Error::from)?;
        Ok(())
    }

    async fn delete(&self, path: &PathKey) -> Result<()> {
        let fs_path = self.fs_path(path);
        match tokio::fs::remove_file(&fs_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.delete_cache_info(path).await
    }

    async fn delete_directory(&self, path: &PathKey, allow_non_empty: bool) -> Result<()> {
        let fs_path = self.fs_path(path);
        if allow_non_empty {
            match tokio::fs::remove_dir_all(&fs_path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        } else {
            match tokio::fs::remove_dir(&fs_path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) if e.raw_os_error() == Some(39) /* ENOTEMPTY */ => {
                    Err(Error::conflict(format!("{path} is not empty")))
                }
                Err(e) => Err(e.into()),
            }
        }
    }

    async fn rename(&self, from: &PathKey, to: &PathKey) -> Result<()> {
        let from_fs = self.fs_path(from);
        let to_fs = self.fs_path(to);
        if let Some(parent) = to_fs.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::from)?;
        }
        // `rename(2)` atomically replaces `to_fs` if it exists; no separate remove needed.
        tokio::fs::rename(&from_fs, &to_fs).await.map_err(Error::from)?;

        if let Some(info) = self.get_cache_info(from).await? {
            self.set_cache_info(to, &info).await?;
        }
        self.delete_cache_info(from).await?;
        Ok(())
    }

    async fn get_cache_info(&self, path: &PathKey) -> Result<Option<CacheInfo>> {
        let sidecar = self.sidecar_path(path);
        match tokio::fs::read(&sidecar).await {
            Ok(bytes) => {
                let info: CacheInfo = serde_json::from_slice(&bytes).map_err(|e| {
                    log::warn!("local_store: malformed cache-info sidecar at {sidecar:?}: {e}");
                    Error::corruption(format!("malformed cache-info at {sidecar:?}: {e}"))
                })?;
                Ok(Some(info))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn set_cache_info(&self, path: &PathKey, info: &CacheInfo) -> Result<()> {
        let sidecar = self.sidecar_path(path);
        if let Some(parent) = sidecar.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::from)?;
        }
        let bytes = serde_json::to_vec(info)
            .map_err(|e| Error::io(format!("failed to serialize cache-info: {e}")))?;
        tokio::fs::write(&sidecar, bytes).await.map_err(Error::from)?;
        Ok(())
    }

    async fn delete_cache_info(&self, path: &PathKey) -> Result<()> {
        let sidecar = self.sidecar_path(path);
        match tokio::fs::remove_file(&sidecar).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn can_delete(&self, path: &PathKey) -> Result<bool> {
        let Some(info) = self.get_cache_info(path).await? else {
            // Never confirmed on remote: local deletion can't conflict with a remote copy.
            return Ok(true);
        };
        let local_meta = match self.stat(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == rq_error::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e),
        };
        let local_mtime = local_meta.last_modified;
        let drift = local_mtime
            .duration_since(info.remote_last_modified)
            .unwrap_or(Duration::ZERO);
        Ok(drift <= self.drift_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> PathKey {
        PathKey::new(s, hybridfs_config::UnicodeNormalizeForm::Nfc)
    }

    fn store() -> (tempfile::TempDir, FsLocalStore) {
        let dir = tempfile::tempdir().unwrap();
        let executor = Executor::new();
        let store = FsLocalStore::new(dir.path(), executor, Duration::from_secs(1));
        (dir, store)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (_dir, store) = store();
        let path = key("/a.txt");
        store.write(&path, Bytes::from_static(b"hi")).await.unwrap();
        let got = store.read(&path).await.unwrap();
        assert_eq!(got, Bytes::from_static(b"hi"));
    }

    #[tokio::test]
    async fn created_locally_without_cache_info() {
        let (_dir, store) = store();
        let path = key("/new.txt");
        store.write(&path, Bytes::from_static(b"x")).await.unwrap();
        assert!(store.is_created_locally(&path).await.unwrap());
    }

    #[tokio::test]
    async fn cache_info_round_trips_and_survives_rename() {
        let (_dir, store) = store();
        let path = key("/cached.txt");
        store.write(&path, Bytes::from_static(b"x")).await.unwrap();
        let now = SystemTime::now();
        let info = CacheInfo::for_download("/remote/cached.txt", now, now);
        store.set_cache_info(&path, &info).await.unwrap();
        assert!(!store.is_created_locally(&path).await.unwrap());

        let dest = key("/renamed.txt");
        store.rename(&path, &dest).await.unwrap();
        assert!(store.get_cache_info(&path).await.unwrap().is_none());
        assert!(store.get_cache_info(&dest).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn can_delete_false_when_local_mtime_drifted_past_remote() {
        let (_dir, store) = store();
        let path = key("/stale.txt");
        store.write(&path, Bytes::from_static(b"x")).await.unwrap();
        let ancient = SystemTime::UNIX_EPOCH;
        let info = CacheInfo::for_download("/remote/stale.txt", ancient, ancient);
        store.set_cache_info(&path, &info).await.unwrap();
        assert!(!store.can_delete(&path).await.unwrap());
    }

    #[tokio::test]
    async fn delete_nonempty_directory_without_allow_flag_is_conflict() {
        let (_dir, store) = store();
        let dir = key("/d");
        let file = key("/d/f.txt");
        store.create_directory(&dir).await.unwrap();
        store.write(&file, Bytes::from_static(b"x")).await.unwrap();
        let err = store.delete_directory(&dir, false).await.unwrap_err();
        assert_eq!(err.kind(), rq_error::ErrorKind::Conflict);
    }
}
