// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! The entities shared across multiple components: `EntityMetadata`,
//! `DirectoryListing`, and `CacheInfo`. `QueueEntry` lives in `request_queue` and
//! `ContentCacheEntry`/`BinaryCacheEntry` live in their respective cache crates, since those are
//! private to a single component's storage format.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum EntityKind {
    File,
    Folder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub kind: EntityKind,
    /// Always 0 for folders.
    pub size: u64,
    pub created: SystemTime,
    pub last_modified: SystemTime,
    pub read_only: bool,
    pub checked_out_by: Option<String>,
    pub etag: Option<String>,
}

impl EntityMetadata {
    pub fn folder(created: SystemTime, last_modified: SystemTime) -> Self {
        EntityMetadata {
            kind: EntityKind::Folder,
            size: 0,
            created,
            last_modified,
            read_only: false,
            checked_out_by: None,
            etag: None,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, EntityKind::Folder)
    }

    pub fn is_locked(&self) -> bool {
        self.checked_out_by.is_some()
    }
}

/// A directory listing, indexed by normalized child name. Uniqueness of `(parent, name)` is
/// guaranteed by construction: the map key *is* the normalized name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub children: BTreeMap<String, EntityMetadata>,
}

impl DirectoryListing {
    pub fn new() -> Self {
        DirectoryListing::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, metadata: EntityMetadata) {
        self.children.insert(name.into(), metadata);
    }

    pub fn remove(&mut self, name: &str) -> Option<EntityMetadata> {
        self.children.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&EntityMetadata> {
        self.children.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(|s| s.as_str())
    }
}

/// Sidecar metadata describing a cached local file's relation to the remote. Persisted
/// out-of-band from the file itself, under the local store's parallel `.work/` subtree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInfo {
    pub remote_path: String,
    pub remote_last_modified: SystemTime,
    pub downloaded_at: SystemTime,
    pub created_locally: bool,
    pub last_sync_at: Option<SystemTime>,
}

impl CacheInfo {
    pub fn for_download(remote_path: impl Into<String>, remote_last_modified: SystemTime, now: SystemTime) -> Self {
        CacheInfo {
            remote_path: remote_path.into(),
            remote_last_modified,
            downloaded_at: now,
            created_locally: false,
            last_sync_at: None,
        }
    }

    pub fn mark_synced(&mut self, remote_last_modified: SystemTime, now: SystemTime) {
        self.remote_last_modified = remote_last_modified;
        self.last_sync_at = Some(now);
        self.created_locally = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folder_metadata_has_zero_size() {
        let now = SystemTime::now();
        let folder = EntityMetadata::folder(now, now);
        assert_eq!(folder.size, 0);
        assert!(folder.is_folder());
    }

    #[test]
    fn directory_listing_uniqueness_by_name() {
        let now = SystemTime::now();
        let mut listing = DirectoryListing::new();
        listing.insert("a.txt", EntityMetadata::folder(now, now));
        listing.insert("a.txt", EntityMetadata::folder(now, now));
        assert_eq!(listing.children.len(), 1);
    }
}
