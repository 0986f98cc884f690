// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! ShareBus: the named events subscribable by external consumers of a mounted share.
//!
//! Grounded on `workunit_store`'s role in the teacher crate (the process-scoped event/metrics
//! sink every other component reports into) but generalized to a small, closed event taxonomy
//! and built on `tokio::sync::broadcast` rather than a bespoke channel, since this crate has no
//! analogue of pants' workunit tree to maintain.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use path_key::PathKey;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum ShareEvent {
    SyncFileStart { path: PathKey, method: &'static str },
    SyncFileProgress {
        path: PathKey,
        read: u64,
        total: u64,
        rate: u64,
        elapsed: Duration,
    },
    SyncFileEnd { path: PathKey, method: &'static str },
    SyncFileErr { path: PathKey, message: String, immediate_fail: bool },
    SyncFileAbort { path: PathKey },
    DownloadStart { path: PathKey },
    DownloadProgress { path: PathKey, read: u64, total: u64 },
    DownloadEnd { path: PathKey },
    DownloadErr { path: PathKey, message: String },
    DownloadAbort { path: PathKey },
    LongDownload { path: PathKey, elapsed: Duration },
    SyncConflict { path: PathKey },
    SyncPurged { paths: Vec<PathKey> },
    QueueChanged,
    ItemUpdated { path: PathKey },
    RequestChanged {
        path: PathKey,
        method: Option<&'static str>,
        timestamp: Option<Instant>,
        removed: bool,
    },
    PathUpdated { prefix: PathKey },
    NetworkLoss,
    NetworkRestored,
    CacheSize { bytes: u64, forced: bool },
}

impl ShareEvent {
    /// The event's name, used as one half of the `EventRateLimiter` key.
    fn name(&self) -> &'static str {
        match self {
            ShareEvent::SyncFileStart { .. } => "syncFileStart",
            ShareEvent::SyncFileProgress { .. } => "syncFileProgress",
            ShareEvent::SyncFileEnd { .. } => "syncFileEnd",
            ShareEvent::SyncFileErr { .. } => "syncFileErr",
            ShareEvent::SyncFileAbort { .. } => "syncFileAbort",
            ShareEvent::DownloadStart { .. } => "downloadStart",
            ShareEvent::DownloadProgress { .. } => "downloadProgress",
            ShareEvent::DownloadEnd { .. } => "downloadEnd",
            ShareEvent::DownloadErr { .. } => "downloadErr",
            ShareEvent::DownloadAbort { .. } => "downloadAbort",
            ShareEvent::LongDownload { .. } => "longDownload",
            ShareEvent::SyncConflict { .. } => "syncConflict",
            ShareEvent::SyncPurged { .. } => "syncPurged",
            ShareEvent::QueueChanged => "queueChanged",
            ShareEvent::ItemUpdated { .. } => "itemUpdated",
            ShareEvent::RequestChanged { .. } => "requestChanged",
            ShareEvent::PathUpdated { .. } => "pathUpdated",
            ShareEvent::NetworkLoss => "networkLoss",
            ShareEvent::NetworkRestored => "networkRestored",
            ShareEvent::CacheSize { .. } => "cacheSize",
        }
    }

    /// A best-effort "describer" distinguishing events of the same name about different
    /// subjects, for the rate limiter's `(eventName, describer)` key.
    fn describer(&self) -> String {
        match self {
            ShareEvent::SyncFileStart { path, .. }
            | ShareEvent::SyncFileEnd { path, .. }
            | ShareEvent::SyncFileErr { path, .. }
            | ShareEvent::SyncFileAbort { path }
            | ShareEvent::DownloadStart { path }
            | ShareEvent::DownloadEnd { path }
            | ShareEvent::DownloadErr { path, .. }
            | ShareEvent::DownloadAbort { path }
            | ShareEvent::LongDownload { path, .. }
            | ShareEvent::SyncConflict { path }
            | ShareEvent::ItemUpdated { path }
            | ShareEvent::RequestChanged { path, .. } => path.as_str().to_string(),
            ShareEvent::SyncFileProgress { path, .. } | ShareEvent::DownloadProgress { path, .. } => {
                path.as_str().to_string()
            }
            ShareEvent::PathUpdated { prefix } => prefix.as_str().to_string(),
            _ => String::new(),
        }
    }
}

/// Wraps any emitter and enforces a minimum spacing between events sharing an
/// `(eventName, describer)` key, e.g. `longDownload`'s "threshold 3s, min spacing 30s".
pub struct EventRateLimiter {
    last_emitted_at: Mutex<HashMap<(&'static str, String), Instant>>,
    min_spacing: Duration,
}

impl EventRateLimiter {
    pub fn new(min_spacing: Duration) -> Self {
        EventRateLimiter {
            last_emitted_at: Mutex::new(HashMap::new()),
            min_spacing,
        }
    }

    /// Returns true iff the event should be emitted (and records that it was).
    pub fn should_emit(&self, event: &ShareEvent, now: Instant) -> bool {
        let key = (event.name(), event.describer());
        let mut guard = self.last_emitted_at.lock();
        match guard.get(&key) {
            Some(last) if now.duration_since(*last) < self.min_spacing => false,
            _ => {
                guard.insert(key, now);
                true
            }
        }
    }
}

#[derive(Clone)]
pub struct ShareBus {
    sender: broadcast::Sender<ShareEvent>,
}

impl Default for ShareBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ShareBus {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(1024);
        ShareBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShareEvent> {
        self.sender.subscribe()
    }

    /// Publish unconditionally. A dropped result (no subscribers) is not an error.
    pub fn publish(&self, event: ShareEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(s: &str) -> PathKey {
        PathKey::new(s, hybridfs_config::UnicodeNormalizeForm::Nfc)
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = ShareBus::new();
        let mut rx = bus.subscribe();
        bus.publish(ShareEvent::QueueChanged);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ShareEvent::QueueChanged));
    }

    #[test]
    fn rate_limiter_suppresses_rapid_repeats_for_same_key() {
        let limiter = EventRateLimiter::new(Duration::from_secs(30));
        let t0 = Instant::now();
        let ev = ShareEvent::LongDownload {
            path: path("/a/big.bin"),
            elapsed: Duration::from_secs(4),
        };
        assert!(limiter.should_emit(&ev, t0));
        assert!(!limiter.should_emit(&ev, t0 + Duration::from_secs(5)));
        assert!(limiter.should_emit(&ev, t0 + Duration::from_secs(31)));
    }

    #[test]
    fn rate_limiter_keys_are_per_describer() {
        let limiter = EventRateLimiter::new(Duration::from_secs(30));
        let t0 = Instant::now();
        let a = ShareEvent::LongDownload {
            path: path("/a.bin"),
            elapsed: Duration::from_secs(4),
        };
        let b = ShareEvent::LongDownload {
            path: path("/b.bin"),
            elapsed: Duration::from_secs(4),
        };
        assert!(limiter.should_emit(&a, t0));
        assert!(limiter.should_emit(&b, t0));
    }
}
