// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! ContentCache: in-memory, TTL-bounded store of directory listings and per-entity metadata.
//!
//! Grounded on the teacher's in-memory LRU layer in `fs/store/src/local.rs` for the
//! shape (a `parking_lot::Mutex`-guarded map, a single critical section for multi-entry
//! population) but keyed by path rather than digest, and TTL-based rather than size-bounded,
//! since there is no content-addressed digest to evict by here.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hybridfs_config::UnicodeNormalizeForm;
use model::{DirectoryListing, EntityMetadata};
use parking_lot::Mutex;
use path_key::PathKey;

struct Cached<T> {
    value: T,
    fetched_at: Instant,
    pinned: bool,
}

struct State {
    entities: HashMap<PathKey, Cached<EntityMetadata>>,
    listings: HashMap<PathKey, Cached<DirectoryListing>>,
    all_cache_cleared_at: Instant,
}

pub struct ContentCache {
    content_ttl: Duration,
    all_cache_ttl: Duration,
    unicode_form: UnicodeNormalizeForm,
    state: Mutex<State>,
}

fn is_strict_descendant(candidate: &PathKey, prefix: &PathKey) -> bool {
    candidate.as_str() != prefix.as_str() && candidate.is_under_or_equal(prefix)
}

impl ContentCache {
    pub fn new(content_ttl: Duration, all_cache_ttl: Duration, unicode_form: UnicodeNormalizeForm) -> Self {
        ContentCache {
            content_ttl,
            all_cache_ttl,
            unicode_form,
            state: Mutex::new(State {
                entities: HashMap::new(),
                listings: HashMap::new(),
                all_cache_cleared_at: Instant::now(),
            }),
        }
    }

    /// Drops every entry if the global epoch has expired; called at the top of every read.
    fn maybe_flush_all(&self, state: &mut State, now: Instant) {
        if now.duration_since(state.all_cache_cleared_at) > self.all_cache_ttl {
            log::debug!("content_cache: all-cache TTL exceeded, dropping every entry");
            state.entities.clear();
            state.listings.clear();
            state.all_cache_cleared_at = now;
        }
    }

    fn fresh<T>(&self, cached: &Cached<T>, now: Instant) -> bool {
        cached.pinned || now.duration_since(cached.fetched_at) <= self.content_ttl
    }

    pub fn get_entity(&self, path: &PathKey) -> Option<EntityMetadata> {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.maybe_flush_all(&mut state, now);
        match state.entities.get(path) {
            Some(cached) if self.fresh(cached, now) => Some(cached.value.clone()),
            Some(_) => {
                state.entities.remove(path);
                None
            }
            None => None,
        }
    }

    pub fn get_listing(&self, path: &PathKey) -> Option<DirectoryListing> {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.maybe_flush_all(&mut state, now);
        match state.listings.get(path) {
            Some(cached) if self.fresh(cached, now) => Some(cached.value.clone()),
            Some(_) => {
                state.listings.remove(path);
                None
            }
            None => None,
        }
    }

    pub fn put_entity(&self, path: PathKey, metadata: EntityMetadata) {
        let now = Instant::now();
        let pinned = path.is_root();
        let mut state = self.state.lock();
        state.entities.insert(
            path,
            Cached {
                value: metadata,
                fetched_at: now,
                pinned,
            },
        );
    }

    /// Populates the listing for `path` and, in the same critical section, a metadata entry for
    /// every child the listing names.
    pub fn put_listing(&self, path: PathKey, listing: DirectoryListing) {
        let now = Instant::now();
        let pinned = path.is_root();
        let mut state = self.state.lock();
        for (name, meta) in &listing.children {
            let child = path.child(name, self.unicode_form);
            state.entities.insert(
                child,
                Cached {
                    value: meta.clone(),
                    fetched_at: now,
                    pinned: false,
                },
            );
        }
        state.listings.insert(
            path,
            Cached {
                value: listing,
                fetched_at: now,
                pinned,
            },
        );
    }

    pub fn invalidate(&self, path: &PathKey, deep: bool) {
        let mut state = self.state.lock();
        let had_entity = state.entities.remove(path).is_some();
        state.listings.remove(path);
        if had_entity && !path.is_root() {
            state.listings.remove(&path.parent());
        }
        if deep {
            state.entities.retain(|k, _| !is_strict_descendant(k, path));
            state.listings.retain(|k, _| !is_strict_descendant(k, path));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hybridfs_config::UnicodeNormalizeForm;
    use std::time::SystemTime;

    fn key(s: &str) -> PathKey {
        PathKey::new(s, UnicodeNormalizeForm::Nfc)
    }

    fn meta() -> EntityMetadata {
        let now = SystemTime::now();
        EntityMetadata {
            kind: model::EntityKind::File,
            size: 3,
            created: now,
            last_modified: now,
            read_only: false,
            checked_out_by: None,
            etag: None,
        }
    }

    #[test]
    fn entry_expires_after_content_ttl() {
        let cache = ContentCache::new(Duration::from_millis(0), Duration::from_secs(3600), UnicodeNormalizeForm::Nfc);
        let p = key("/a.txt");
        cache.put_entity(p.clone(), meta());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get_entity(&p).is_none());
    }

    #[test]
    fn root_listing_never_expires() {
        let cache = ContentCache::new(Duration::from_millis(0), Duration::from_secs(3600), UnicodeNormalizeForm::Nfc);
        let root = PathKey::root();
        cache.put_listing(root.clone(), DirectoryListing::new());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get_listing(&root).is_some());
    }

    #[test]
    fn put_listing_populates_child_metadata() {
        let cache = ContentCache::new(Duration::from_secs(60), Duration::from_secs(3600), UnicodeNormalizeForm::Nfc);
        let mut listing = DirectoryListing::new();
        listing.insert("child.txt", meta());
        cache.put_listing(key("/dir"), listing);
        assert!(cache.get_entity(&key("/dir/child.txt")).is_some());
    }

    #[test]
    fn invalidate_drops_parent_listing_for_entity() {
        let cache = ContentCache::new(Duration::from_secs(60), Duration::from_secs(3600), UnicodeNormalizeForm::Nfc);
        cache.put_listing(key("/dir"), DirectoryListing::new());
        cache.put_entity(key("/dir/child.txt"), meta());
        cache.invalidate(&key("/dir/child.txt"), false);
        assert!(cache.get_listing(&key("/dir")).is_none());
    }

    #[test]
    fn deep_invalidate_drops_descendants() {
        let cache = ContentCache::new(Duration::from_secs(60), Duration::from_secs(3600), UnicodeNormalizeForm::Nfc);
        cache.put_entity(key("/dir/a.txt"), meta());
        cache.put_entity(key("/dir/sub/b.txt"), meta());
        cache.put_entity(key("/other.txt"), meta());
        cache.invalidate(&key("/dir"), true);
        assert!(cache.get_entity(&key("/dir/a.txt")).is_none());
        assert!(cache.get_entity(&key("/dir/sub/b.txt")).is_none());
        assert!(cache.get_entity(&key("/other.txt")).is_some());
    }
}
