// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! The public entry point: wires C1-C10 together into one mounted `Share`, the facade a front
//! end (e.g. an SMB `Tree` implementation, out of scope here) drives.
//!
//! Grounded on the teacher's top-level `src/rust/engine/src/lib.rs`/`fs` crate, which assembles
//! a `Store` plus its supporting caches and an `Executor` behind one constructor and exposes a
//! narrow public surface over many internal collaborators.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use binary_cache::BinaryCache;
use bytes::Bytes;
use content_cache::ContentCache;
use hybrid_tree::HybridTree;
use hybridfs_config::Config;
use local_store::{FsLocalStore, LocalStore};
use model::{DirectoryListing, EntityMetadata};
use path_key::{PathKey, TempPredicate};
use processor::Processor;
use remote_share::RemoteShare;
use remote_transport::HttpTransport;
use request_queue::RequestQueue;
use rq_error::Result;
use share_bus::ShareBus;
use tokio::sync::broadcast::Receiver as BusReceiver;

/// Where a mounted share keeps its state on disk: a cache tree of real files plus a work area
/// for the queue database and downloaded binaries.
pub struct MountPaths {
    pub cache_root: PathBuf,
    pub work_root: PathBuf,
}

impl MountPaths {
    pub fn new(cache_root: impl Into<PathBuf>, work_root: impl Into<PathBuf>) -> Self {
        MountPaths { cache_root: cache_root.into(), work_root: work_root.into() }
    }

    fn queue_root(&self) -> PathBuf {
        self.work_root.join("queue")
    }

    fn binary_cache_root(&self) -> PathBuf {
        self.work_root.join("bin")
    }
}

/// A mounted, live share: the merged namespace plus its background processor.
pub struct Share {
    tree: Arc<HybridTree>,
    processor: Arc<Processor>,
    bus: ShareBus,
    executor: task_executor::Executor,
    handle: tokio::sync::Mutex<Option<processor::ProcessorHandle>>,
}

impl Share {
    /// Opens (creating if absent) the on-disk cache and queue under `paths`, and starts the
    /// background processor against `config.remote`.
    pub fn open(config: Config, paths: MountPaths, temp_predicate: TempPredicate) -> Result<Share> {
        let executor = task_executor::Executor::new_owned(2, 8, || {})
            .map_err(rq_error::Error::io)?;
        let bus = ShareBus::new();
        let config = Arc::new(config);

        let local: Arc<dyn LocalStore> = Arc::new(FsLocalStore::new(
            paths.cache_root.clone(),
            executor.clone(),
            Duration::from_secs(2),
        ));

        let content_cache = Arc::new(ContentCache::new(
            Duration::from_millis(config.content_cache_ttl_ms),
            Duration::from_millis(config.all_cache_ttl_ms),
            config.unicode_normalize_form,
        ));
        let binary_cache = Arc::new(BinaryCache::new(
            paths.binary_cache_root(),
            Duration::from_millis(config.bin_cache_ttl_ms),
            bus.clone(),
        ));
        let transport = Arc::new(HttpTransport::new(config.max_sockets)?);
        let remote = Arc::new(RemoteShare::new(
            transport,
            content_cache,
            binary_cache.clone(),
            config.clone(),
            bus.clone(),
        ));
        let queue = Arc::new(RequestQueue::open(&paths.queue_root(), bus.clone(), config.unicode_normalize_form)?);

        let tree = Arc::new(HybridTree::new(
            local.clone(),
            remote.clone(),
            queue.clone(),
            bus.clone(),
            config.clone(),
            temp_predicate,
            PathKey::root(),
            PathKey::root(),
        ));

        let processor = Processor::new(local, remote, binary_cache, queue, bus.clone(), config);
        let handle = processor.spawn(&executor);

        Ok(Share { tree, processor, bus, executor, handle: tokio::sync::Mutex::new(Some(handle)) })
    }

    pub async fn exists(&self, path: &PathKey) -> Result<bool> {
        self.tree.exists(path).await
    }

    pub async fn read(&self, path: &PathKey) -> Result<Bytes> {
        self.tree.read(path).await
    }

    pub async fn write(&self, path: &PathKey, contents: Bytes) -> Result<()> {
        self.tree.write(path, contents).await
    }

    pub async fn create_file(&self, parent: &PathKey, name: &str) -> Result<()> {
        self.tree.create_file(parent, name).await
    }

    pub async fn create_directory(&self, parent: &PathKey, name: &str) -> Result<()> {
        self.tree.create_directory(parent, name).await
    }

    pub async fn delete(&self, path: &PathKey) -> Result<()> {
        self.tree.delete(path).await
    }

    pub async fn delete_directory(&self, path: &PathKey, allow_non_empty: bool) -> Result<()> {
        self.tree.delete_directory(path, allow_non_empty).await
    }

    pub async fn rename(&self, from: &PathKey, to: &PathKey, replace: bool) -> Result<()> {
        self.tree.rename(from, to, replace).await
    }

    pub async fn list(&self, path: &PathKey) -> Result<DirectoryListing> {
        self.tree.list(path).await
    }

    pub async fn stat(&self, path: &PathKey) -> Result<EntityMetadata> {
        self.tree.stat(path).await
    }

    pub async fn clear_cache(&self, path: &PathKey) -> Result<()> {
        self.tree.clear_cache(path).await
    }

    /// Forces an immediate, single-entry sync of `path` ahead of the processor's normal cadence.
    pub async fn sync_path(&self, path: &PathKey) -> Result<()> {
        self.processor.sync_path(path).await
    }

    /// Subscribes to the share's observable event stream (progress, conflict, purge, ...).
    pub fn subscribe(&self) -> BusReceiver<share_bus::ShareEvent> {
        self.bus.subscribe()
    }

    /// Stops the background processor, aborting in-flight uploads/downloads, and waits up to
    /// `timeout` before giving up and leaking the tasks.
    pub async fn shutdown(&self, timeout: Duration) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.shutdown(timeout).await;
        }
        self.executor.shutdown(timeout);
    }
}

/// Convenience constructor for a config loaded from a JSON file, as a host process would do at
/// startup.
pub fn load_config(path: &Path) -> Result<Config> {
    let bytes = std::fs::read(path).map_err(rq_error::Error::from)?;
    serde_json::from_slice(&bytes).map_err(|e| rq_error::Error::corruption(format!("malformed config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybridfs_config::{Auth, Protocol, ProcessorConfig, RemoteApi, UnicodeNormalizeForm};
    use wiremock::matchers::{method, path as wm_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn key(s: &str) -> PathKey {
        PathKey::new(s, UnicodeNormalizeForm::Nfc)
    }

    fn config(base: &str) -> Config {
        let url: reqwest::Url = base.parse().unwrap();
        Config {
            remote: RemoteApi {
                host: url.host_str().unwrap().to_string(),
                port: url.port_or_known_default().unwrap(),
                protocol: Protocol::Http,
                base_path: String::new(),
            },
            auth: Auth::Bearer { bearer: "token".to_string() },
            max_sockets: 32,
            all_cache_ttl_ms: 1_800_000,
            content_cache_ttl_ms: 0,
            bin_cache_ttl_ms: 300_000,
            chunk_upload_size_mb: 10,
            processor: ProcessorConfig { expiration_ms: 0, max_retries: 3, retry_delay_ms: 50, frequency_ms: 20 },
            unicode_normalize_form: UnicodeNormalizeForm::Nfc,
            allow_non_empty_dir_delete: false,
            preserve_cache_files: Vec::new(),
        }
    }

    #[tokio::test]
    async fn create_write_and_drain_reaches_the_remote() {
        let _ = env_logger::try_init();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(wm_path("/a.txt.json"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(wm_path("/.createasset.html"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let cache_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let share = Share::open(
            config(&server.uri()),
            MountPaths::new(cache_dir.path(), work_dir.path()),
            TempPredicate::never(),
        )
        .unwrap();

        share.create_file(&key("/"), "a.txt").await.unwrap();
        share.write(&key("/a.txt"), Bytes::from_static(b"hi")).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        share.shutdown(Duration::from_millis(200)).await;
        server.verify().await;
    }
}
