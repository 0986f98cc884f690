// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! HybridTree: the merged namespace over a `LocalStore` and a `RemoteShare`, routing every
//! operation to one or both and recording mutations into a `RequestQueue`.
//!
//! Grounded on the teacher's `Store` composition in `fs/store/src/lib.rs` (a facade holding a
//! local layer and a remote layer behind trait objects, resolving reads by trying local first)
//! generalized from a content-addressed local/remote pair to a path-addressed one, with a third
//! collaborator (the request queue) the teacher's `Store` has no analogue of.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use hybridfs_config::Config;
use local_store::LocalStore;
use model::{CacheInfo, DirectoryListing, EntityMetadata};
use path_key::{PathKey, TempPredicate};
use remote_share::{RemoteContent, RemoteShare};
use request_queue::{Method, RequestQueue};
use rq_error::{Error, Result};
use share_bus::{ShareBus, ShareEvent};

pub struct HybridTree {
    local: Arc<dyn LocalStore>,
    remote: Arc<RemoteShare>,
    queue: Arc<RequestQueue>,
    bus: ShareBus,
    config: Arc<Config>,
    temp_predicate: TempPredicate,
    local_prefix: PathKey,
    remote_prefix: PathKey,
}

impl HybridTree {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<RemoteShare>,
        queue: Arc<RequestQueue>,
        bus: ShareBus,
        config: Arc<Config>,
        temp_predicate: TempPredicate,
        local_prefix: PathKey,
        remote_prefix: PathKey,
    ) -> Self {
        HybridTree {
            local,
            remote,
            queue,
            bus,
            config,
            temp_predicate,
            local_prefix,
            remote_prefix,
        }
    }

    fn unicode_form(&self) -> hybridfs_config::UnicodeNormalizeForm {
        self.config.unicode_normalize_form
    }

    fn queued_method(&self, path: &PathKey) -> Option<Method> {
        self.queue.get(&path.parent(), path.name()).map(|e| e.method)
    }

    /// True iff `exists` should ignore the local view entirely because a local copy exists but a
    /// `Delete` for it is already queued — i.e. the client deleted it and the processor hasn't
    /// acted yet, but the local byte copy lingers until the delete completes.
    pub async fn exists(&self, path: &PathKey) -> Result<bool> {
        if self.local.exists(path).await? {
            return Ok(true);
        }
        if self.queued_method(path) == Some(Method::Delete) {
            return Ok(false);
        }
        Ok(self.remote.get_content(path, false).await?.is_some())
    }

    /// Returns the bytes at `path`, serving the local copy if one exists and downloading from
    /// the remote (persisting into the local store as a new cache entry) otherwise.
    pub async fn read(&self, path: &PathKey) -> Result<Bytes> {
        if self.local.exists(path).await? {
            return self.local.read(path).await;
        }

        let content = self
            .remote
            .get_content(path, false)
            .await?
            .ok_or_else(|| Error::not_found(format!("{path} does not exist locally or remotely")))?;
        let metadata = match content {
            RemoteContent::Entity(meta) => meta,
            RemoteContent::Listing(meta, _) => meta,
        };
        if metadata.is_folder() {
            return Err(Error::not_supported(format!("{path} is a folder")));
        }

        let now = SystemTime::now();
        let local_path = self.remote.fetch_binary(path, metadata.last_modified).await?;
        let bytes = tokio::fs::read(&local_path).await.map_err(Error::from)?;
        self.local.write(path, Bytes::from(bytes.clone())).await?;
        self.local
            .set_cache_info(path, &CacheInfo::for_download(path.as_str(), metadata.last_modified, now))
            .await?;
        Ok(Bytes::from(bytes))
    }

    /// Creates an empty local file, deferring the remote create to the processor.
    pub async fn create_file(&self, parent: &PathKey, name: &str) -> Result<()> {
        let path = parent.child(name, self.unicode_form());
        self.local.create_file(&path).await?;
        self.queue.enqueue(
            parent.clone(),
            name.to_string(),
            Method::Post,
            self.local_prefix.clone(),
            self.remote_prefix.clone(),
            SystemTime::now(),
        )?;
        self.remote.invalidate_parent_listing(&path);
        Ok(())
    }

    /// Creates a directory locally and on the remote synchronously; directories are never
    /// deferred since the remote create must succeed before children can be created under it.
    pub async fn create_directory(&self, parent: &PathKey, name: &str) -> Result<()> {
        let path = parent.child(name, self.unicode_form());
        self.local.create_directory(&path).await?;
        self.remote.create_folder(parent, name).await?;
        Ok(())
    }

    /// Overwrites `path`'s contents locally and enqueues the update.
    pub async fn write(&self, path: &PathKey, contents: Bytes) -> Result<()> {
        self.local.write(path, contents).await?;
        let created_locally = self.local.is_created_locally(path).await?;
        let method = if created_locally { Method::Post } else { Method::Put };
        self.queue.enqueue(
            path.parent(),
            path.name().to_string(),
            method,
            self.local_prefix.clone(),
            self.remote_prefix.clone(),
            SystemTime::now(),
        )?;
        self.remote.invalidate_parent_listing(path);
        Ok(())
    }

    /// Deletes a file locally and enqueues the remote delete.
    pub async fn delete(&self, path: &PathKey) -> Result<()> {
        self.local.delete(path).await?;
        self.queue.enqueue(
            path.parent(),
            path.name().to_string(),
            Method::Delete,
            self.local_prefix.clone(),
            self.remote_prefix.clone(),
            SystemTime::now(),
        )?;
        self.remote.invalidate_parent_listing(path);
        Ok(())
    }

    /// Deletes a directory locally and removes it on the remote synchronously (directories must
    /// already be empty remotely, so there is nothing useful to defer), purging every queued
    /// entry underneath it.
    pub async fn delete_directory(&self, path: &PathKey, allow_non_empty: bool) -> Result<()> {
        self.local.delete_directory(path, allow_non_empty).await?;
        self.remote.delete(path).await?;
        self.queue.remove_path(path);
        self.remote.invalidate_parent_listing(path);
        self.remote.invalidate(path, true);
        Ok(())
    }

    /// Renames `from` to `to`. `src_is_temp`/`dst_is_temp` classify each endpoint's last segment
    /// against the host's temp-file predicate, driving the temp-boundary special cases in the
    /// queue's coalescing matrix.
    pub async fn rename(&self, from: &PathKey, to: &PathKey, replace: bool) -> Result<()> {
        if !replace && self.exists(to).await? {
            return Err(Error::already_exists(format!("{to} already exists")));
        }
        let is_directory = self.stat(from).await.map(|m| m.is_folder()).unwrap_or(false);
        self.local.rename(from, to).await?;

        let now = SystemTime::now();
        let src_is_temp = self.temp_predicate.is_temp(from.name());
        let dst_is_temp = self.temp_predicate.is_temp(to.name());
        self.queue.enqueue_rename(
            from.parent(),
            from.name().to_string(),
            to.parent(),
            to.name().to_string(),
            replace,
            src_is_temp,
            dst_is_temp,
            self.local_prefix.clone(),
            self.remote_prefix.clone(),
            now,
        )?;
        if is_directory {
            self.queue.rename_path(from, to, now);
        }

        self.remote.invalidate_parent_listing(from);
        self.remote.invalidate_parent_listing(to);
        Ok(())
    }

    /// The three-phase merge: remote listing minus temp/queued-delete entries, with local
    /// entries laid on top.
    pub async fn list(&self, path: &PathKey) -> Result<DirectoryListing> {
        let mut listing = DirectoryListing::new();
        let mut local_only = false;

        match self.remote.get_content(path, true).await {
            Ok(Some(RemoteContent::Listing(_, remote_listing))) => {
                for (name, meta) in remote_listing.children {
                    if self.temp_predicate.is_temp(&name) {
                        continue;
                    }
                    if self.queue.get(path, &name).map(|e| e.method) == Some(Method::Delete) {
                        continue;
                    }
                    listing.insert(name, meta);
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::debug!("hybrid_tree: remote listing for {path} unavailable ({e}), serving local only");
                local_only = true;
            }
        }

        let local_entries = self.local.list(path).await.unwrap_or_default();
        for (name, meta) in local_entries {
            if self.temp_predicate.is_temp(&name) {
                continue;
            }
            let child = path.child(&name, self.unicode_form());
            if local_only || listing.get(&name).is_some() {
                listing.insert(name, meta);
                continue;
            }

            if self.local.is_created_locally(&child).await? {
                listing.insert(name, meta);
            } else if self.local.can_delete(&child).await? {
                self.local.delete(&child).await?;
            } else {
                listing.insert(name, meta);
                self.bus.publish(ShareEvent::SyncConflict { path: child });
            }
        }

        Ok(listing)
    }

    pub async fn stat(&self, path: &PathKey) -> Result<EntityMetadata> {
        if self.local.exists(path).await? {
            return self.local.stat(path).await;
        }
        match self.remote.get_content(path, false).await? {
            Some(RemoteContent::Entity(meta)) => Ok(meta),
            Some(RemoteContent::Listing(meta, _)) => Ok(meta),
            None => Err(Error::not_found(format!("{path} does not exist"))),
        }
    }

    /// Recursively deletes the local cache tree at `path`, skipping (and retaining) any file
    /// whose `canDelete` check fails and emitting a conflict for each one retained.
    pub async fn clear_cache(&self, path: &PathKey) -> Result<()> {
        let entries = self.local.list(path).await.unwrap_or_default();
        for (name, meta) in entries {
            let child = path.child(&name, self.unicode_form());
            if meta.is_folder() {
                Box::pin(self.clear_cache(&child)).await?;
                continue;
            }
            if self.local.can_delete(&child).await? {
                self.local.delete(&child).await?;
            } else {
                self.bus.publish(ShareEvent::SyncConflict { path: child });
            }
        }
        if path.is_root() {
            return Ok(());
        }
        match self.local.can_delete(path).await? {
            true => self.local.delete_directory(path, true).await.or(Ok(())),
            false => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybridfs_config::{Auth, Protocol, RemoteApi, UnicodeNormalizeForm};
    use remote_transport::HttpTransport;
    use std::time::Duration;
    use task_executor::Executor;
    use wiremock::matchers::{method, path as wm_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn key(s: &str) -> PathKey {
        PathKey::new(s, UnicodeNormalizeForm::Nfc)
    }

    fn config(base: &str) -> Arc<Config> {
        let url: reqwest::Url = base.parse().unwrap();
        Arc::new(Config {
            remote: RemoteApi {
                host: url.host_str().unwrap().to_string(),
                port: url.port_or_known_default().unwrap(),
                protocol: Protocol::Http,
                base_path: String::new(),
            },
            auth: Auth::Bearer { bearer: "token".to_string() },
            max_sockets: 32,
            all_cache_ttl_ms: 1_800_000,
            content_cache_ttl_ms: 30_000,
            bin_cache_ttl_ms: 300_000,
            chunk_upload_size_mb: 10,
            processor: Default::default(),
            unicode_normalize_form: UnicodeNormalizeForm::Nfc,
            allow_non_empty_dir_delete: false,
            preserve_cache_files: Vec::new(),
        })
    }

    fn tree(base: &str, local_root: &std::path::Path, queue_root: &std::path::Path) -> HybridTree {
        let bus = ShareBus::new();
        let cfg = config(base);
        let local = Arc::new(local_store::FsLocalStore::new(
            local_root,
            Executor::new(),
            Duration::from_secs(1),
        ));
        let remote = Arc::new(RemoteShare::new(
            Arc::new(HttpTransport::with_client(reqwest::Client::new())),
            Arc::new(content_cache::ContentCache::new(
                Duration::from_millis(0),
                Duration::from_secs(3600),
                UnicodeNormalizeForm::Nfc,
            )),
            Arc::new(binary_cache::BinaryCache::new(
                queue_root.join("bin"),
                Duration::from_secs(300),
                bus.clone(),
            )),
            cfg.clone(),
            bus.clone(),
        ));
        let queue = Arc::new(RequestQueue::open(&queue_root.join("queue"), bus.clone(), UnicodeNormalizeForm::Nfc).unwrap());
        HybridTree::new(
            local,
            remote,
            queue,
            bus,
            cfg,
            TempPredicate::never(),
            key("/local"),
            key("/remote"),
        )
    }

    #[tokio::test]
    async fn create_then_write_enqueues_post() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree("http://unused.invalid", dir.path(), dir.path());
        t.create_file(&key("/"), "a.txt").await.unwrap();
        t.write(&key("/a.txt"), Bytes::from_static(b"hi")).await.unwrap();
        let entry = t.queue.get(&key("/"), "a.txt").unwrap();
        assert_eq!(entry.method, Method::Post);
    }

    #[tokio::test]
    async fn create_then_delete_leaves_no_queue_entry() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree("http://unused.invalid", dir.path(), dir.path());
        t.create_file(&key("/"), "b.txt").await.unwrap();
        t.delete(&key("/b.txt")).await.unwrap();
        assert!(t.queue.get(&key("/"), "b.txt").is_none());
    }

    #[tokio::test]
    async fn rename_destination_exists_without_replace_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(wm_path("/d2.txt.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "class": "asset",
                "properties": {"name": "d2.txt", "jcr:created": 0, "jcr:lastModified": 0, "asset:size": 1, "asset:readonly": false}
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let t = tree(&server.uri(), dir.path(), dir.path());
        t.create_file(&key("/"), "d1.txt").await.unwrap();
        let err = t.rename(&key("/d1.txt"), &key("/d2.txt"), false).await.unwrap_err();
        assert_eq!(err.kind(), rq_error::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn renaming_a_directory_carries_its_queued_children_to_the_new_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree("http://unused.invalid", dir.path(), dir.path());
        t.create_directory(&key("/"), "folder").await.unwrap();
        t.create_file(&key("/folder"), "a.txt").await.unwrap();
        t.write(&key("/folder/a.txt"), Bytes::from_static(b"hi")).await.unwrap();
        assert!(t.queue.get(&key("/folder"), "a.txt").is_some());

        t.rename(&key("/folder"), &key("/renamed"), false).await.unwrap();

        assert!(t.queue.get(&key("/folder"), "a.txt").is_none());
        assert!(t.queue.get(&key("/renamed"), "a.txt").is_some());
    }

    #[tokio::test]
    async fn list_merges_remote_and_local_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(wm_path("/.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "class": "folder",
                "properties": {"name": "", "jcr:created": 0, "jcr:lastModified": 0},
                "entities": [{
                    "class": "asset",
                    "properties": {"name": "remote.txt", "jcr:created": 0, "jcr:lastModified": 0, "asset:size": 2, "asset:readonly": false}
                }]
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let t = tree(&server.uri(), dir.path(), dir.path());
        t.create_file(&key("/"), "local.txt").await.unwrap();
        let listing = t.list(&key("/")).await.unwrap();
        assert!(listing.get("remote.txt").is_some());
        assert!(listing.get("local.txt").is_some());
    }
}
