// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! RemoteShare: composes `RemoteTransport`, `ContentCache`, and `BinaryCache` into the operations
//! `HybridTree` needs against the remote asset API.
//!
//! Grounded on `fs/store/src/remote.rs`'s role in the teacher crate (the component that turns a
//! transport plus caches into a coherent "fetch this digest" API), generalized from
//! content-addressed digests to path-addressed JCR-style entities and a JSON wire format instead
//! of protobuf-over-gRPC.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use binary_cache::BinaryCache;
use bytes::Bytes;
use content_cache::ContentCache;
use hybridfs_config::Config;
use model::{CacheInfo, EntityKind, EntityMetadata};
use path_key::PathKey;
use remote_transport::{MultipartForm, ProgressCallback, RemoteTransport, RequestBody, TransportRequest};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use rq_error::{Error, Result};
use serde::Deserialize;
use share_bus::{ShareBus, ShareEvent};
use tokio_util::sync::CancellationToken;

/// What a metadata fetch returns once parsed: a leaf's metadata, or a folder's metadata plus the
/// listing of its immediate children.
#[derive(Debug, Clone)]
pub enum RemoteContent {
    Entity(EntityMetadata),
    Listing(EntityMetadata, model::DirectoryListing),
}

#[derive(Deserialize)]
struct JcrProperties {
    #[serde(default)]
    name: String,
    #[serde(rename = "jcr:created")]
    jcr_created: i64,
    #[serde(rename = "jcr:lastModified")]
    jcr_last_modified: i64,
    #[serde(rename = "asset:size", default)]
    asset_size: u64,
    #[serde(rename = "asset:readonly", default)]
    asset_readonly: bool,
    #[serde(rename = "cq:drivelock", default)]
    cq_drivelock: Option<String>,
}

#[derive(Deserialize)]
struct JcrEntity {
    class: String,
    properties: JcrProperties,
    #[serde(default)]
    entities: Vec<JcrEntity>,
}

fn millis_to_system_time(millis: i64) -> SystemTime {
    if millis >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_millis(millis as u64)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_millis((-millis) as u64)
    }
}

fn entity_metadata_of(raw: &JcrEntity) -> EntityMetadata {
    let kind = if raw.class == "folder" { EntityKind::Folder } else { EntityKind::File };
    EntityMetadata {
        kind,
        size: if kind == EntityKind::Folder { 0 } else { raw.properties.asset_size },
        created: millis_to_system_time(raw.properties.jcr_created),
        last_modified: millis_to_system_time(raw.properties.jcr_last_modified),
        read_only: raw.properties.asset_readonly,
        checked_out_by: raw.properties.cq_drivelock.clone(),
        etag: None,
    }
}

fn parse_metadata_response(body: &[u8], deep: bool) -> Result<RemoteContent> {
    let raw: JcrEntity =
        serde_json::from_slice(body).map_err(|e| Error::remote_error(format!("malformed metadata payload: {e}")))?;
    let metadata = entity_metadata_of(&raw);
    if deep && metadata.is_folder() {
        let mut listing = model::DirectoryListing::new();
        for child in &raw.entities {
            listing.insert(child.properties.name.clone(), entity_metadata_of(child));
        }
        Ok(RemoteContent::Listing(metadata, listing))
    } else {
        Ok(RemoteContent::Entity(metadata))
    }
}

pub struct RemoteShare {
    transport: Arc<dyn RemoteTransport>,
    content_cache: Arc<ContentCache>,
    binary_cache: Arc<BinaryCache>,
    config: Arc<Config>,
    bus: ShareBus,
}

impl RemoteShare {
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        content_cache: Arc<ContentCache>,
        binary_cache: Arc<BinaryCache>,
        config: Arc<Config>,
        bus: ShareBus,
    ) -> Self {
        RemoteShare {
            transport,
            content_cache,
            binary_cache,
            config,
            bus,
        }
    }

    fn remote_url(&self, path: &PathKey) -> String {
        format!("{}{}", self.config.base_url(), path.as_str())
    }

    fn intent_header(deep: bool) -> HeaderValue {
        HeaderValue::from_static(if deep { "folderList" } else { "entityInfo" })
    }

    /// Consults `ContentCache`; on miss, issues a metadata fetch at the requested depth. A 404
    /// is a structured absent, not an error.
    pub async fn get_content(&self, path: &PathKey, deep: bool) -> Result<Option<RemoteContent>> {
        if deep {
            if let Some(listing) = self.content_cache.get_listing(path) {
                let entity = self
                    .content_cache
                    .get_entity(path)
                    .unwrap_or_else(|| EntityMetadata::folder(SystemTime::now(), SystemTime::now()));
                return Ok(Some(RemoteContent::Listing(entity, listing)));
            }
        } else if let Some(entity) = self.content_cache.get_entity(path) {
            return Ok(Some(RemoteContent::Entity(entity)));
        }

        log::debug!("remote_share: content cache miss for {path}, fetching (deep={deep})");
        let mut headers = HeaderMap::new();
        headers.insert(HeaderName::from_static("x-intent"), Self::intent_header(deep));
        let url = format!("{}.json?limit=9999&showProperty=*", self.remote_url(path));
        let request = TransportRequest::new(url, Method::GET).with_headers(headers);
        let response = self.transport.submit(request, None).await?;

        if response.is_not_found() {
            return Ok(None);
        }
        if !response.is_success() {
            return Err(Error::remote_error(format!("metadata fetch for {path} returned {}", response.status)));
        }

        let content = parse_metadata_response(&response.body, deep)?;
        match &content {
            RemoteContent::Entity(meta) => self.content_cache.put_entity(path.clone(), meta.clone()),
            RemoteContent::Listing(meta, listing) => {
                self.content_cache.put_entity(path.clone(), meta.clone());
                self.content_cache.put_listing(path.clone(), listing.clone());
            }
        }
        Ok(Some(content))
    }

    /// Downloads (once, via `BinaryCache`) and returns the local path holding `path`'s current
    /// remote bytes.
    pub async fn fetch_binary(&self, path: &PathKey, remote_last_modified: SystemTime) -> Result<PathBuf> {
        let bus = self.bus.clone();
        let transport = self.transport.clone();
        let url = self.remote_url(path);
        let event_path = path.clone();
        bus.publish(ShareEvent::DownloadStart { path: event_path.clone() });
        let result = self
            .binary_cache
            .checkout(path, remote_last_modified, move || async move {
                let request = TransportRequest::new(url, Method::GET);
                let progress_path = event_path.clone();
                let progress_bus = bus.clone();
                let progress: ProgressCallback = Arc::new(move |read, total| {
                    progress_bus.publish(ShareEvent::DownloadProgress {
                        path: progress_path.clone(),
                        read,
                        total,
                    });
                });
                let response = transport.submit(request, Some(progress)).await?;
                if !response.is_success() {
                    return Err(Error::remote_error(format!("download returned {}", response.status)));
                }
                Ok(response.body)
            })
            .await;

        match &result {
            Ok(_) => self.bus.publish(ShareEvent::DownloadEnd { path: path.clone() }),
            Err(e) => self.bus.publish(ShareEvent::DownloadErr {
                path: path.clone(),
                message: e.to_string(),
            }),
        }
        result
    }

    fn invalidate_parent(&self, path: &PathKey) {
        self.content_cache.invalidate(&path.parent(), false);
    }

    /// Drops the cached entry (and, if `deep`, every descendant) for `path`. Used by callers that
    /// mutate the tree without an immediate remote round trip (e.g. a deferred local create),
    /// where no response arrives to drive the usual post-mutation invalidation.
    pub fn invalidate(&self, path: &PathKey, deep: bool) {
        self.content_cache.invalidate(path, deep);
    }

    /// Drops `path`'s parent listing only, for callers that changed `path` itself without
    /// touching its own cached entry.
    pub fn invalidate_parent_listing(&self, path: &PathKey) {
        self.invalidate_parent(path);
    }

    fn emit_sync(&self, path: &PathKey, method: &'static str, result: &Result<()>) {
        match result {
            Ok(()) => self.bus.publish(ShareEvent::SyncFileEnd { path: path.clone(), method }),
            Err(e) => self.bus.publish(ShareEvent::SyncFileErr {
                path: path.clone(),
                message: e.to_string(),
                immediate_fail: !e.kind().is_retryable(),
            }),
        }
    }

    /// Creates or overwrites a remote file. Files larger than the configured chunk size are split
    /// into sequential `createasset` posts, only the first of which carries the chunking headers.
    pub async fn put_file(&self, parent: &PathKey, name: &str, contents: Bytes, replace: bool) -> Result<()> {
        self.put_file_with_progress(parent, name, contents, replace, None, CancellationToken::new())
            .await
    }

    /// As `put_file`, but accepting a `CancellationToken` the caller can cancel mid-upload (used
    /// by the processor's abort-on-mutation path) and an optional progress callback.
    pub async fn put_file_with_progress(
        &self,
        parent: &PathKey,
        name: &str,
        contents: Bytes,
        replace: bool,
        progress: Option<ProgressCallback>,
        cancellation: CancellationToken,
    ) -> Result<()> {
        let path = parent.child(name, self.config.unicode_normalize_form);
        self.bus.publish(ShareEvent::SyncFileStart {
            path: path.clone(),
            method: if replace { "PUT" } else { "POST" },
        });
        let result = self
            .put_file_inner(parent, name, &path, contents, replace, progress, cancellation)
            .await;
        self.emit_sync(&path, if replace { "PUT" } else { "POST" }, &result);
        if result.is_ok() {
            self.invalidate_parent(&path);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn put_file_inner(
        &self,
        parent: &PathKey,
        name: &str,
        path: &PathKey,
        contents: Bytes,
        replace: bool,
        progress: Option<ProgressCallback>,
        cancellation: CancellationToken,
    ) -> Result<()> {
        let chunk_size = self.config.chunk_upload_size_bytes();
        let url = format!("{}.createasset.html", self.remote_url(parent));
        let total_len = contents.len() as u64;

        if total_len <= chunk_size {
            let form = MultipartForm::new()
                .text("file@Length", total_len.to_string())
                .text("chunk@Length", total_len.to_string())
                .file("file", name.to_string(), contents)
                .maybe_replace(replace);
            let request = TransportRequest::new(url, Method::POST)
                .with_body(RequestBody::Multipart(form))
                .with_cancellation(cancellation);
            let response = self.transport.submit(request, progress).await?;
            return Self::check_mutation_response(path, &response);
        }

        let mut offset = 0u64;
        let mut first = true;
        while offset < total_len {
            let end = (offset + chunk_size).min(total_len);
            let chunk = contents.slice(offset as usize..end as usize);
            let completed = end == total_len;
            let mut form = MultipartForm::new()
                .text("file@Length", chunk.len().to_string())
                .text("chunk@Length", total_len.to_string())
                .text("file@Offset", offset.to_string())
                .file("file", name.to_string(), chunk)
                .maybe_replace(replace);
            if completed {
                form = form.text("file@Completed", "true");
            }
            let mut headers = HeaderMap::new();
            if first {
                headers.insert(
                    HeaderName::from_static("x-chunked-content-type"),
                    HeaderValue::from_static("application/octet-stream"),
                );
                headers.insert(
                    HeaderName::from_static("x-chunked-total-size"),
                    HeaderValue::from_str(&total_len.to_string())
                        .map_err(|e| Error::io(format!("invalid total size header: {e}")))?,
                );
            }
            let request = TransportRequest::new(url.clone(), Method::POST)
                .with_headers(headers)
                .with_body(RequestBody::Multipart(form))
                .with_cancellation(cancellation.clone());
            let response = self.transport.submit(request, progress.clone()).await?;
            Self::check_mutation_response(path, &response)?;
            offset = end;
            first = false;
        }
        Ok(())
    }

    pub async fn create_folder(&self, parent: &PathKey, name: &str) -> Result<()> {
        let path = parent.child(name, self.config.unicode_normalize_form);
        self.bus.publish(ShareEvent::SyncFileStart { path: path.clone(), method: "MKCOL" });
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("content-type"),
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        let body = Bytes::from_static(b"{}");
        let request = TransportRequest::new(self.remote_url(&path), mkcol())
            .with_headers(headers)
            .with_body(RequestBody::Bytes(body));
        let response = self.transport.submit(request, None).await;
        let result = response.and_then(|r| Self::check_mutation_response(&path, &r));
        self.emit_sync(&path, "MKCOL", &result);
        if result.is_ok() {
            self.invalidate_parent(&path);
        }
        result
    }

    pub async fn delete(&self, path: &PathKey) -> Result<()> {
        self.delete_with_cancellation(path, CancellationToken::new()).await
    }

    /// As `delete`, but accepting a `CancellationToken` so the processor can abort a queued
    /// delete that's racing a mutation of the same path.
    pub async fn delete_with_cancellation(&self, path: &PathKey, cancellation: CancellationToken) -> Result<()> {
        log::debug!("remote_share: deleting {path}");
        self.bus.publish(ShareEvent::SyncFileStart { path: path.clone(), method: "DELETE" });
        let url = format!("{}/bin/wcmcommand", self.config.base_url());
        let form = MultipartForm::new()
            .text("cmd", "deletePage")
            .text("path", path.as_str())
            .text("force", "true")
            .text("_charset_", "utf-8");
        let request = TransportRequest::new(url, Method::POST)
            .with_body(RequestBody::Multipart(form))
            .with_cancellation(cancellation);
        let response = self.transport.submit(request, None).await;
        let result = response.and_then(|r| Self::check_mutation_response(path, &r));
        self.emit_sync(path, "DELETE", &result);
        if result.is_ok() {
            self.invalidate_parent(path);
            self.content_cache.invalidate(path, true);
        }
        result
    }

    pub async fn rename(&self, from: &PathKey, to: &PathKey, replace: bool) -> Result<()> {
        self.bus.publish(ShareEvent::SyncFileStart { path: from.clone(), method: "MOVE" });
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-destination"),
            HeaderValue::from_str(to.as_str()).map_err(|e| Error::io(format!("invalid destination header: {e}")))?,
        );
        headers.insert(HeaderName::from_static("x-depth"), HeaderValue::from_static("infinity"));
        headers.insert(
            HeaderName::from_static("x-overwrite"),
            HeaderValue::from_static(if replace { "T" } else { "F" }),
        );
        let request = TransportRequest::new(self.remote_url(from), move_method()).with_headers(headers);
        let response = self.transport.submit(request, None).await;
        let result = response.and_then(|r| Self::check_mutation_response(from, &r));
        self.emit_sync(from, "MOVE", &result);
        if result.is_ok() {
            self.invalidate_parent(from);
            self.invalidate_parent(to);
        }
        result
    }

    fn check_mutation_response(path: &PathKey, response: &remote_transport::TransportResponse) -> Result<()> {
        if response.is_success() {
            Ok(())
        } else if response.status == 423 {
            Err(Error::access_denied(format!("{path} is locked")))
        } else if response.status == 409 {
            Err(Error::already_exists(format!("{path} already exists remotely")))
        } else if response.status >= 500 && response.status != 500 {
            Err(Error::network(format!("remote mutation for {path} returned {}", response.status)))
        } else {
            Err(Error::remote_error(format!("remote mutation for {path} returned {}", response.status)))
        }
    }

    /// Builds the `CacheInfo` a successful upload/download should persist against the local
    /// sidecar, given the remote's reported `lastModified`.
    pub fn cache_info_for(&self, path: &PathKey, remote_last_modified: SystemTime, now: SystemTime) -> CacheInfo {
        CacheInfo::for_download(path.as_str(), remote_last_modified, now)
    }
}

trait MaybeReplace {
    fn maybe_replace(self, replace: bool) -> Self;
}

impl MaybeReplace for MultipartForm {
    fn maybe_replace(self, replace: bool) -> Self {
        if replace {
            self.text("replaceAsset", "true")
        } else {
            self
        }
    }
}

fn mkcol() -> Method {
    Method::from_bytes(b"MKCOL").expect("MKCOL is a valid HTTP method token")
}

fn move_method() -> Method {
    Method::from_bytes(b"MOVE").expect("MOVE is a valid HTTP method token")
}
