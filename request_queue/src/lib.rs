// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! RequestQueue: durable, append-with-coalescing log of pending remote mutations.
//!
//! Persistence is grounded on `sharded_lmdb::ShardedLmdb`'s environment-and-transaction shape,
//! simplified to a single unsharded `lmdb::Environment` (this queue is sized for one mounted
//! share's pending work, not a shared content-addressed cache) with one database holding the
//! serialized entries. The `(parentPath, name)` and `readyAt` indices are kept in-memory,
//! rebuilt from the database at open, the way `local.rs`'s in-memory `OnceCell` maps sit in
//! front of its on-disk store.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::{Duration, SystemTime};

use lmdb::{Cursor, Database, DatabaseFlags, Environment, Transaction, WriteFlags};
use log::{debug, trace};
use parking_lot::Mutex;
use path_key::PathKey;
use rq_error::{Error, Result};
use serde::{Deserialize, Serialize};
use share_bus::{ShareBus, ShareEvent};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum Method {
    Put,
    Post,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: u64,
    pub method: Method,
    pub parent_path: PathKey,
    pub name: String,
    pub dest_parent_path: Option<PathKey>,
    pub dest_name: Option<String>,
    pub local_prefix: PathKey,
    pub remote_prefix: PathKey,
    pub enqueued_at: SystemTime,
    pub ready_at: SystemTime,
    pub retries: u32,
    pub replace: bool,
}

type Key = (PathKey, String);

fn ready_order_key(entry: &QueueEntry) -> (u128, u64) {
    let nanos = entry
        .ready_at
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    (nanos, entry.id)
}

struct State {
    by_key: HashMap<Key, QueueEntry>,
    by_ready: BTreeMap<(u128, u64), Key>,
    next_id: u64,
}

impl State {
    fn insert(&mut self, key: Key, entry: QueueEntry) {
        if let Some(old) = self.by_key.get(&key) {
            self.by_ready.remove(&ready_order_key(old));
        }
        self.by_ready.insert(ready_order_key(&entry), key.clone());
        self.by_key.insert(key, entry);
    }

    fn remove(&mut self, key: &Key) -> Option<QueueEntry> {
        let entry = self.by_key.remove(key)?;
        self.by_ready.remove(&ready_order_key(&entry));
        Some(entry)
    }
}

/// Persists `QueueEntry` rows in a single LMDB database keyed by an 8-byte big-endian id.
struct Lmdb {
    env: Environment,
    db: Database,
}

impl Lmdb {
    fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(Error::from)?;
        let env = Environment::new()
            .set_map_size(1 << 30)
            .set_max_dbs(1)
            .open(root)
            .map_err(Error::from)?;
        let db = env
            .create_db(Some("entries"), DatabaseFlags::empty())
            .map_err(Error::from)?;
        Ok(Lmdb { env, db })
    }

    fn load_all(&self) -> Result<Vec<QueueEntry>> {
        let txn = self.env.begin_ro_txn().map_err(Error::from)?;
        let mut cursor = txn.open_ro_cursor(self.db).map_err(Error::from)?;
        let mut out = Vec::new();
        for key_res in cursor.iter() {
            let (_key, value) = key_res.map_err(Error::from)?;
            let entry: QueueEntry = serde_json::from_slice(value)
                .map_err(|e| Error::corruption(format!("malformed queue entry: {e}")))?;
            out.push(entry);
        }
        Ok(out)
    }

    fn put(&self, entry: &QueueEntry) -> Result<()> {
        let mut txn = self.env.begin_rw_txn().map_err(Error::from)?;
        let bytes = serde_json::to_vec(entry).map_err(|e| Error::io(format!("serialize queue entry: {e}")))?;
        txn.put(self.db, &entry.id.to_be_bytes(), &bytes, WriteFlags::empty())
            .map_err(Error::from)?;
        txn.commit().map_err(Error::from)?;
        Ok(())
    }

    fn delete(&self, id: u64) -> Result<()> {
        let mut txn = self.env.begin_rw_txn().map_err(Error::from)?;
        match txn.del(self.db, &id.to_be_bytes(), None) {
            Ok(()) => {}
            Err(lmdb::Error::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
        txn.commit().map_err(Error::from)?;
        Ok(())
    }
}

pub struct RequestQueue {
    lmdb: Lmdb,
    state: Mutex<State>,
    bus: ShareBus,
    unicode_form: hybridfs_config::UnicodeNormalizeForm,
}

fn key_of(entry: &QueueEntry) -> Key {
    (entry.parent_path.clone(), entry.name.clone())
}

impl RequestQueue {
    pub fn open(root: &Path, bus: ShareBus, unicode_form: hybridfs_config::UnicodeNormalizeForm) -> Result<Self> {
        let lmdb = Lmdb::open(root)?;
        let loaded = lmdb.load_all()?;
        let mut state = State {
            by_key: HashMap::new(),
            by_ready: BTreeMap::new(),
            next_id: 1,
        };
        for entry in loaded {
            state.next_id = state.next_id.max(entry.id + 1);
            let key = key_of(&entry);
            state.insert(key, entry);
        }
        debug!("request_queue: recovered {} entries from {:?}", state.by_key.len(), root);
        Ok(RequestQueue {
            lmdb,
            state: Mutex::new(state),
            bus,
            unicode_form,
        })
    }

    fn next_id(state: &mut State) -> u64 {
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    fn any_segment_dotted(parent: &PathKey, name: &str) -> bool {
        parent.any_segment_dotted() || name.starts_with('.')
    }

    /// Applies the coalescing matrix cell for `(existing, incoming)`.
    fn coalesce(existing: Option<&Method>, incoming: Method) -> Coalesced {
        use Method::*;
        match (existing, incoming) {
            (None, Put) => Coalesced::Write(Post, true),
            (None, Post) => Coalesced::Write(Post, true),
            (None, Delete) => Coalesced::Write(Delete, true),

            (Some(Post), Put) => Coalesced::Write(Post, false),
            (Some(Post), Post) => Coalesced::Write(Post, false),
            (Some(Post), Delete) => Coalesced::Remove,

            (Some(Put), Put) => Coalesced::Write(Post, false),
            (Some(Put), Post) => Coalesced::Write(Put, false),
            (Some(Put), Delete) => Coalesced::Write(Delete, true),

            (Some(Delete), Put) => Coalesced::Write(Post, true),
            (Some(Delete), Post) => Coalesced::Write(Post, true),
            (Some(Delete), Delete) => Coalesced::Write(Delete, false),
        }
    }

    fn apply(
        &self,
        state: &mut State,
        key: Key,
        incoming: Method,
        now: SystemTime,
        local_prefix: &PathKey,
        remote_prefix: &PathKey,
        replace: bool,
        dest: Option<(PathKey, String)>,
    ) -> bool {
        let existing = state.by_key.get(&key).map(|e| e.method);
        match Self::coalesce(existing.as_ref(), incoming) {
            Coalesced::Remove => {
                if let Some(old) = state.remove(&key) {
                    let _ = self.lmdb.delete(old.id);
                }
                true
            }
            Coalesced::Write(method, fresh) => {
                let prior = state.by_key.get(&key).cloned();
                let id = match &prior {
                    Some(p) => p.id,
                    None => Self::next_id(state),
                };
                let enqueued_at = if fresh {
                    now
                } else {
                    prior.as_ref().map(|p| p.enqueued_at).unwrap_or(now)
                };
                let (dest_parent_path, dest_name) = match dest {
                    Some((p, n)) => (Some(p), Some(n)),
                    None => prior
                        .as_ref()
                        .map(|p| (p.dest_parent_path.clone(), p.dest_name.clone()))
                        .unwrap_or((None, None)),
                };
                let entry = QueueEntry {
                    id,
                    method,
                    parent_path: key.0.clone(),
                    name: key.1.clone(),
                    dest_parent_path,
                    dest_name,
                    local_prefix: local_prefix.clone(),
                    remote_prefix: remote_prefix.clone(),
                    enqueued_at,
                    ready_at: now,
                    retries: 0,
                    replace,
                };
                let touch_only = !fresh && existing == Some(method);
                let _ = self.lmdb.put(&entry);
                state.insert(key, entry);
                !touch_only
            }
        }
    }

    /// Enqueues a plain `Put`/`Post`/`Delete` for `(parentPath, name)`.
    pub fn enqueue(
        &self,
        parent_path: PathKey,
        name: String,
        method: Method,
        local_prefix: PathKey,
        remote_prefix: PathKey,
        now: SystemTime,
    ) -> Result<()> {
        if Self::any_segment_dotted(&parent_path, &name) {
            return Err(Error::not_supported(format!("dotted path rejected: {parent_path}/{name}")));
        }
        let event_path = parent_path.child(&name, self.unicode_form);
        let key = (parent_path, name);
        let mut state = self.state.lock();
        let meaningfully_changed = self.apply(&mut state, key, method, now, &local_prefix, &remote_prefix, false, None);
        drop(state);
        if meaningfully_changed {
            self.bus.publish(ShareEvent::ItemUpdated { path: event_path });
        }
        self.bus.publish(ShareEvent::QueueChanged);
        Ok(())
    }

    /// Decomposes a rename into source/destination coalescing applications per the matrix, honoring
    /// the temp-boundary special cases.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_rename(
        &self,
        src_parent: PathKey,
        src_name: String,
        dst_parent: PathKey,
        dst_name: String,
        replace: bool,
        src_is_temp: bool,
        dst_is_temp: bool,
        local_prefix: PathKey,
        remote_prefix: PathKey,
        now: SystemTime,
    ) -> Result<()> {
        if Self::any_segment_dotted(&dst_parent, &dst_name) {
            return Err(Error::not_supported(format!("dotted destination rejected: {dst_parent}/{dst_name}")));
        }
        let src_key = (src_parent.clone(), src_name.clone());
        let dst_key = (dst_parent.clone(), dst_name.clone());
        let mut state = self.state.lock();

        match (src_is_temp, dst_is_temp) {
            (false, false) => {
                self.apply(
                    &mut state,
                    src_key,
                    Method::Delete,
                    now,
                    &local_prefix,
                    &remote_prefix,
                    false,
                    None,
                );
                self.apply(
                    &mut state,
                    dst_key,
                    if replace { Method::Put } else { Method::Post },
                    now,
                    &local_prefix,
                    &remote_prefix,
                    replace,
                    Some((dst_parent, dst_name)),
                );
            }
            (false, true) => {
                trace!("enqueue_rename: {src_parent}/{src_name} renamed to temp-named destination, queuing Delete at source only");
                self.apply(
                    &mut state,
                    src_key,
                    Method::Delete,
                    now,
                    &local_prefix,
                    &remote_prefix,
                    false,
                    None,
                );
            }
            (true, false) => {
                trace!("enqueue_rename: temp-named source renamed to {dst_parent}/{dst_name}, queuing Post at destination only");
                self.apply(
                    &mut state,
                    dst_key,
                    if replace { Method::Put } else { Method::Post },
                    now,
                    &local_prefix,
                    &remote_prefix,
                    replace,
                    Some((dst_parent, dst_name)),
                );
            }
            (true, true) => {
                trace!("enqueue_rename: both endpoints temp-named, neither side is remote-relevant");
            }
        }
        drop(state);
        self.bus.publish(ShareEvent::RequestChanged {
            path: src_parent.child(&src_name, self.unicode_form),
            method: None,
            timestamp: None,
            removed: false,
        });
        self.bus.publish(ShareEvent::QueueChanged);
        Ok(())
    }

    /// Mirrors every entry under `old_prefix` to the corresponding key under `new_prefix`,
    /// enqueuing a `Post` at each mirrored key. The originals under `old_prefix` are untouched.
    pub fn copy_path(&self, old_prefix: &PathKey, new_prefix: &PathKey, now: SystemTime) {
        let mut state = self.state.lock();
        let matching: Vec<Key> = state
            .by_key
            .keys()
            .filter(|(parent, _)| parent.is_under_or_equal(old_prefix))
            .cloned()
            .collect();
        for (parent, name) in matching {
            let entry = state.by_key.get(&(parent.clone(), name.clone())).unwrap();
            let suffix = &parent.as_str()[old_prefix.as_str().len()..];
            let new_parent = PathKey::new(&format!("{}{}", new_prefix.as_str(), suffix), self.unicode_form);
            let local_prefix = entry.local_prefix.clone();
            let remote_prefix = entry.remote_prefix.clone();
            let new_key = (new_parent.clone(), name.clone());
            self.apply(
                &mut state,
                new_key,
                Method::Post,
                now,
                &local_prefix,
                &remote_prefix,
                false,
                Some((new_parent, name)),
            );
        }
        drop(state);
        self.bus.publish(ShareEvent::QueueChanged);
    }

    pub fn get(&self, parent_path: &PathKey, name: &str) -> Option<QueueEntry> {
        self.state.lock().by_key.get(&(parent_path.clone(), name.to_string())).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically rewrites every entry whose `parentPath` equals or is under `old_prefix`,
    /// publishing a `requestChanged` for each rewritten entry at its new path.
    pub fn rename_path(&self, old_prefix: &PathKey, new_prefix: &PathKey, now: SystemTime) {
        let mut state = self.state.lock();
        let matching: Vec<Key> = state
            .by_key
            .keys()
            .filter(|(parent, _)| parent.is_under_or_equal(old_prefix))
            .cloned()
            .collect();
        let mut changed = Vec::with_capacity(matching.len());
        for key in matching {
            let mut entry = state.by_key.get(&key).unwrap().clone();
            let suffix = &entry.parent_path.as_str()[old_prefix.as_str().len()..];
            let new_parent = PathKey::new(
                &format!("{}{}", new_prefix.as_str(), suffix),
                self.unicode_form,
            );
            entry.parent_path = new_parent.clone();
            entry.ready_at = now;
            let _ = self.lmdb.delete(entry.id);
            state.remove(&key);
            let new_key = (new_parent, entry.name.clone());
            changed.push(entry.parent_path.child(&entry.name, self.unicode_form));
            let _ = self.lmdb.put(&entry);
            state.insert(new_key, entry);
        }
        drop(state);
        for path in changed {
            self.bus.publish(ShareEvent::RequestChanged {
                path,
                method: None,
                timestamp: None,
                removed: false,
            });
        }
        self.bus.publish(ShareEvent::QueueChanged);
    }

    /// Deletes every entry under `prefix`, publishing a `requestChanged(removed=true)` per entry.
    pub fn remove_path(&self, prefix: &PathKey) {
        let mut state = self.state.lock();
        let matching: Vec<Key> = state
            .by_key
            .keys()
            .filter(|(parent, _)| parent.is_under_or_equal(prefix))
            .cloned()
            .collect();
        for key in matching {
            if let Some(entry) = state.remove(&key) {
                let _ = self.lmdb.delete(entry.id);
                self.bus.publish(ShareEvent::RequestChanged {
                    path: entry.parent_path.child(&entry.name, self.unicode_form),
                    method: None,
                    timestamp: None,
                    removed: true,
                });
            }
        }
        drop(state);
        self.bus.publish(ShareEvent::QueueChanged);
    }

    /// Returns the lowest-`readyAt` entry with `readyAt <= now` and `retries < max_retries`.
    pub fn next_ready(&self, now: SystemTime, max_retries: u32) -> Option<QueueEntry> {
        let state = self.state.lock();
        let now_key = now
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos();
        for (&(nanos, _), key) in state.by_ready.iter() {
            if nanos > now_key {
                break;
            }
            if let Some(entry) = state.by_key.get(key) {
                if entry.retries < max_retries {
                    return Some(entry.clone());
                }
            }
        }
        None
    }

    pub fn complete(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock();
        let key = state
            .by_key
            .iter()
            .find(|(_, e)| e.id == id)
            .map(|(k, _)| k.clone());
        if let Some(key) = key {
            state.remove(&key);
        }
        self.lmdb.delete(id)
    }

    pub fn increment_retries(&self, id: u64, delay: Duration, now: SystemTime) -> Result<()> {
        let mut state = self.state.lock();
        let key = state
            .by_key
            .iter()
            .find(|(_, e)| e.id == id)
            .map(|(k, _)| k.clone());
        if let Some(key) = key {
            let mut entry = state.by_key.get(&key).unwrap().clone();
            entry.retries += 1;
            entry.ready_at = now + delay;
            state.remove(&key);
            self.lmdb.put(&entry)?;
            state.insert(key, entry);
        }
        Ok(())
    }

    /// Deletes and returns every entry whose `retries >= max_retries`.
    pub fn purge_exceeded(&self, max_retries: u32) -> Vec<QueueEntry> {
        let mut state = self.state.lock();
        let exceeded: Vec<Key> = state
            .by_key
            .iter()
            .filter(|(_, e)| e.retries >= max_retries)
            .map(|(k, _)| k.clone())
            .collect();
        let mut purged = Vec::with_capacity(exceeded.len());
        for key in exceeded {
            if let Some(entry) = state.remove(&key) {
                let _ = self.lmdb.delete(entry.id);
                purged.push(entry);
            }
        }
        purged
    }
}

enum Coalesced {
    Write(Method, bool),
    Remove,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> PathKey {
        PathKey::new(s, hybridfs_config::UnicodeNormalizeForm::Nfc)
    }

    fn queue() -> (tempfile::TempDir, RequestQueue) {
        let dir = tempfile::tempdir().unwrap();
        let queue = RequestQueue::open(dir.path(), ShareBus::new(), hybridfs_config::UnicodeNormalizeForm::Nfc).unwrap();
        (dir, queue)
    }

    fn put(q: &RequestQueue, parent: &str, name: &str, method: Method, now: SystemTime) {
        q.enqueue(key(parent), name.to_string(), method, key("/local"), key("/remote"), now)
            .unwrap();
    }

    #[test]
    fn dotted_segment_is_rejected() {
        let (_d, q) = queue();
        let now = SystemTime::now();
        let err = q
            .enqueue(key("/.git"), "config".to_string(), Method::Put, key("/local"), key("/remote"), now)
            .unwrap_err();
        assert_eq!(err.kind(), rq_error::ErrorKind::NotSupported);
    }

    #[test]
    fn empty_plus_post_is_post() {
        let (_d, q) = queue();
        let now = SystemTime::now();
        put(&q, "/", "a.txt", Method::Post, now);
        assert_eq!(q.get(&key("/"), "a.txt").unwrap().method, Method::Post);
    }

    #[test]
    fn post_then_delete_cancels_to_nothing() {
        let (_d, q) = queue();
        let now = SystemTime::now();
        put(&q, "/", "b.txt", Method::Post, now);
        put(&q, "/", "b.txt", Method::Delete, now);
        assert!(q.get(&key("/"), "b.txt").is_none());
    }

    #[test]
    fn delete_then_post_becomes_post() {
        let (_d, q) = queue();
        let now = SystemTime::now();
        put(&q, "/", "c.txt", Method::Delete, now);
        put(&q, "/", "c.txt", Method::Post, now);
        let entry = q.get(&key("/"), "c.txt").unwrap();
        assert_eq!(entry.method, Method::Post);
    }

    #[test]
    fn put_then_delete_coalesces_to_delete() {
        let (_d, q) = queue();
        let now = SystemTime::now();
        put(&q, "/", "d.txt", Method::Post, now);
        q.complete(q.get(&key("/"), "d.txt").unwrap().id).unwrap();
        // Simulate a Put queued directly (e.g. after a download + local modification).
        let mut state = q.state.lock();
        let key_tuple = (key("/"), "d.txt".to_string());
        state.insert(
            key_tuple.clone(),
            QueueEntry {
                id: 999,
                method: Method::Put,
                parent_path: key("/"),
                name: "d.txt".to_string(),
                dest_parent_path: None,
                dest_name: None,
                local_prefix: key("/local"),
                remote_prefix: key("/remote"),
                enqueued_at: now,
                ready_at: now,
                retries: 0,
                replace: false,
            },
        );
        drop(state);
        put(&q, "/", "d.txt", Method::Delete, now);
        assert_eq!(q.get(&key("/"), "d.txt").unwrap().method, Method::Delete);
    }

    #[test]
    fn queue_uniqueness_holds_after_repeated_coalescing() {
        let (_d, q) = queue();
        let now = SystemTime::now();
        for _ in 0..5 {
            put(&q, "/", "e.txt", Method::Put, now);
            put(&q, "/", "e.txt", Method::Post, now);
        }
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn next_ready_respects_retry_ceiling() {
        let (_d, q) = queue();
        let now = SystemTime::now();
        put(&q, "/", "f.txt", Method::Post, now);
        let entry = q.get(&key("/"), "f.txt").unwrap();
        for _ in 0..3 {
            q.increment_retries(entry.id, Duration::ZERO, now).unwrap();
        }
        assert!(q.next_ready(now, 3).is_none());
        assert!(q.next_ready(now, 4).is_some());
    }

    #[test]
    fn purge_exceeded_removes_and_returns_entries() {
        let (_d, q) = queue();
        let now = SystemTime::now();
        put(&q, "/", "g.txt", Method::Post, now);
        let entry = q.get(&key("/"), "g.txt").unwrap();
        q.increment_retries(entry.id, Duration::ZERO, now).unwrap();
        q.increment_retries(entry.id, Duration::ZERO, now).unwrap();
        q.increment_retries(entry.id, Duration::ZERO, now).unwrap();
        let purged = q.purge_exceeded(3);
        assert_eq!(purged.len(), 1);
        assert!(q.get(&key("/"), "g.txt").is_none());
    }

    #[test]
    fn rename_path_rewrites_prefix() {
        let (_d, q) = queue();
        let now = SystemTime::now();
        put(&q, "/old/dir", "a.txt", Method::Post, now);
        q.rename_path(&key("/old/dir"), &key("/new/dir"), now);
        assert!(q.get(&key("/old/dir"), "a.txt").is_none());
        assert!(q.get(&key("/new/dir"), "a.txt").is_some());
    }

    #[test]
    fn copy_path_mirrors_entries_leaving_source_intact() {
        let (_d, q) = queue();
        let now = SystemTime::now();
        put(&q, "/old/dir", "a.txt", Method::Put, now);
        q.copy_path(&key("/old/dir"), &key("/new/dir"), now);

        assert!(q.get(&key("/old/dir"), "a.txt").is_some());
        let mirrored = q.get(&key("/new/dir"), "a.txt").unwrap();
        assert_eq!(mirrored.method, Method::Post);
    }

    #[test]
    fn recovers_from_disk_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        {
            let q = RequestQueue::open(dir.path(), ShareBus::new(), hybridfs_config::UnicodeNormalizeForm::Nfc).unwrap();
            put(&q, "/", "h.txt", Method::Post, now);
        }
        let q2 = RequestQueue::open(dir.path(), ShareBus::new(), hybridfs_config::UnicodeNormalizeForm::Nfc).unwrap();
        assert!(q2.get(&key("/"), "h.txt").is_some());
    }
}
