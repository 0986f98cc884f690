// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! Processor: the background coroutine that drains `RequestQueue` entries against the remote
//! share.
//!
//! Grounded on the teacher's `nailgun`/`process_execution` worker-loop shape — a task that polls
//! for ready work, executes it, and reacts to external cancellation — generalized from a
//! subprocess-execution loop to an upload/delete drain loop, with the per-path abort-on-mutation
//! map grounded on `fs/store/src/local.rs`'s in-flight coordination.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use hybridfs_config::{Config, UnicodeNormalizeForm};
use local_store::LocalStore;
use parking_lot::Mutex;
use path_key::PathKey;
use remote_share::RemoteContent;
use request_queue::{Method, QueueEntry, RequestQueue};
use rq_error::{ErrorKind, Result};
use share_bus::{ShareBus, ShareEvent};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct Processor {
    local: Arc<dyn LocalStore>,
    remote: Arc<remote_share::RemoteShare>,
    binary_cache: Arc<binary_cache::BinaryCache>,
    queue: Arc<RequestQueue>,
    bus: ShareBus,
    config: Arc<Config>,
    active_uploads: Mutex<HashMap<String, CancellationToken>>,
}

impl Processor {
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Arc<remote_share::RemoteShare>,
        binary_cache: Arc<binary_cache::BinaryCache>,
        queue: Arc<RequestQueue>,
        bus: ShareBus,
        config: Arc<Config>,
    ) -> Arc<Self> {
        Arc::new(Processor {
            local,
            remote,
            binary_cache,
            queue,
            bus,
            config,
            active_uploads: Mutex::new(HashMap::new()),
        })
    }

    fn unicode_form(&self) -> UnicodeNormalizeForm {
        self.config.unicode_normalize_form
    }

    fn path_of(&self, entry: &QueueEntry) -> PathKey {
        entry.parent_path.child(&entry.name, self.unicode_form())
    }

    /// Spawns the drain loop and the bus-watching abort task onto `executor`, returning a handle
    /// that stops both on `shutdown`.
    pub fn spawn(self: &Arc<Self>, executor: &task_executor::Executor) -> ProcessorHandle {
        let stop = CancellationToken::new();

        let drain_me = self.clone();
        let drain_stop = stop.clone();
        let drain_join = executor.native_spawn(async move { drain_me.drain_loop(drain_stop).await });

        let watch_me = self.clone();
        let watch_stop = stop.clone();
        let watch_join = executor.native_spawn(async move { watch_me.watch_bus(watch_stop).await });

        ProcessorHandle {
            stop,
            drain_join,
            watch_join,
        }
    }

    async fn drain_loop(&self, stop: CancellationToken) {
        let frequency = Duration::from_millis(self.config.processor.frequency_ms);
        loop {
            if stop.is_cancelled() {
                break;
            }
            let now = SystemTime::now();
            let candidate = self.queue.next_ready(now, self.config.processor.max_retries);
            let processed = match candidate {
                Some(entry) if self.is_expired(&entry, now) => {
                    self.process_entry(entry).await;
                    true
                }
                _ => false,
            };

            let purged = self.queue.purge_exceeded(self.config.processor.max_retries);
            if !purged.is_empty() {
                let paths = purged.iter().map(|e| self.path_of(e)).collect();
                self.bus.publish(ShareEvent::SyncPurged { paths });
            }

            if !processed {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(frequency) => {}
                }
            }
        }
    }

    fn is_expired(&self, entry: &QueueEntry, now: SystemTime) -> bool {
        let expiration = Duration::from_millis(self.config.processor.expiration_ms);
        now.duration_since(entry.enqueued_at).unwrap_or(Duration::ZERO) >= expiration
    }

    /// Watches the bus for mutations landing on a path with an active upload/delete and aborts it.
    async fn watch_bus(&self, stop: CancellationToken) {
        let mut events = self.bus.subscribe();
        loop {
            let event = tokio::select! {
                _ = stop.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(ShareEvent::ItemUpdated { path }) => self.abort_matching(&path),
                Ok(ShareEvent::PathUpdated { prefix }) => self.abort_under(&prefix),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn abort_matching(&self, path: &PathKey) {
        if let Some(token) = self.active_uploads.lock().get(path.as_str()) {
            log::debug!("processor: aborting active transfer for {path} (itemUpdated)");
            token.cancel();
        }
    }

    fn abort_under(&self, prefix: &PathKey) {
        let active = self.active_uploads.lock();
        for (remote_path, token) in active.iter() {
            if PathKey::new(remote_path, self.unicode_form()).is_under_or_equal(prefix) {
                log::debug!("processor: aborting active transfer under {prefix} (pathUpdated)");
                token.cancel();
            }
        }
    }

    async fn process_entry(&self, entry: QueueEntry) {
        let path = self.path_of(&entry);
        let method = self.resolve_method(&entry, &path).await;

        let outcome = match method {
            None => {
                // Remote already absent for a queued delete: nothing to do.
                Ok(())
            }
            Some(Method::Delete) => self.run_delete(&path).await,
            Some(method) => self.run_upload(&entry, &path, method).await,
        };

        match outcome {
            Ok(()) => {
                let _ = self.queue.complete(entry.id);
                if let Ok(meta) = self.local.stat(&path).await {
                    if let Err(e) = self.binary_cache.touch(&path, meta.last_modified) {
                        log::debug!("processor: skipping binary cache touch for {path}: {e}");
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::Aborted => {
                self.bus.publish(ShareEvent::SyncFileAbort { path: path.clone() });
                let delay = Duration::from_millis(self.config.processor.retry_delay_ms);
                let _ = self.queue.increment_retries(entry.id, delay, SystemTime::now());
            }
            Err(e) if e.kind().is_retryable() => {
                let delay = Duration::from_millis(self.config.processor.retry_delay_ms);
                let _ = self.queue.increment_retries(entry.id, delay, SystemTime::now());
            }
            Err(_) => {
                let _ = self.queue.complete(entry.id);
            }
        }
    }

    /// Checks the remote's current state and swaps `Put`/`Post` where needed; returns `None` for
    /// a `Delete` against an already-absent remote (complete without a call).
    async fn resolve_method(&self, entry: &QueueEntry, path: &PathKey) -> Option<Method> {
        let remote_exists = matches!(self.remote.get_content(path, false).await, Ok(Some(_)));
        match entry.method {
            Method::Put if !remote_exists => Some(Method::Post),
            Method::Post if remote_exists => Some(Method::Put),
            Method::Delete if !remote_exists => None,
            other => Some(other),
        }
    }

    async fn run_upload(&self, entry: &QueueEntry, path: &PathKey, method: Method) -> Result<()> {
        let contents = self.local.read(path).await?;
        let token = CancellationToken::new();
        self.active_uploads.lock().insert(path.as_str().to_string(), token.clone());
        let result = self
            .remote
            .put_file_with_progress(
                &entry.parent_path,
                &entry.name,
                contents,
                method == Method::Put,
                None,
                token,
            )
            .await;
        self.active_uploads.lock().remove(path.as_str());
        result
    }

    async fn run_delete(&self, path: &PathKey) -> Result<()> {
        let token = CancellationToken::new();
        self.active_uploads.lock().insert(path.as_str().to_string(), token.clone());
        let result = self.remote.delete_with_cancellation(path, token).await;
        self.active_uploads.lock().remove(path.as_str());
        result
    }

    /// Runs exactly one queued entry for `path`, or — if none is queued — performs a direct
    /// best-effort upload/delete without touching the queue. Used for an explicit "sync this one
    /// path now" request, bypassing the drain loop's polling cadence.
    pub async fn sync_path(&self, path: &PathKey) -> Result<()> {
        if let Some(entry) = self.queue.get(&path.parent(), path.name()) {
            let method = self.resolve_method(&entry, path).await;
            let result = match method {
                None => Ok(()),
                Some(Method::Delete) => self.run_delete(path).await,
                Some(method) => self.run_upload(&entry, path, method).await,
            };
            if result.is_ok() {
                let _ = self.queue.complete(entry.id);
            }
            return result;
        }

        match self.remote.get_content(path, false).await? {
            Some(RemoteContent::Entity(_)) | Some(RemoteContent::Listing(..)) => {
                let contents = self.local.read(path).await?;
                self.remote
                    .put_file(&path.parent(), path.name(), contents, true)
                    .await
            }
            None => {
                let contents = self.local.read(path).await?;
                self.remote.put_file(&path.parent(), path.name(), contents, false).await
            }
        }
    }
}

pub struct ProcessorHandle {
    stop: CancellationToken,
    drain_join: JoinHandle<()>,
    watch_join: JoinHandle<()>,
}

impl ProcessorHandle {
    /// Aborts every active transfer, stops both background tasks, and waits up to `timeout` for
    /// them to finish before giving up and leaking them.
    pub async fn shutdown(self, timeout: Duration) {
        self.stop.cancel();
        let join_both = async {
            let _ = self.drain_join.await;
            let _ = self.watch_join.await;
        };
        if tokio::time::timeout(timeout, join_both).await.is_err() {
            log::warn!("processor shutdown took unexpectedly long: tasks were likely leaked!");
        }
    }
}
