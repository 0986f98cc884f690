// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! RemoteTransport: stateless HTTP request submission with progress and cooperative abort.
//!
//! Grounded on the teacher's `ByteStore` port shape (a small async trait with one real
//! implementation plus test doubles) rather than its `remote.rs`, since that file speaks gRPC
//! against a CAS and this transport speaks plain HTTP against an asset API; the reqwest client
//! setup (timeouts, connection pool sizing, rustls) follows the pattern the `other_examples`
//! HTTP-client corpus uses for the same kind of client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::{Method, Url};
use rq_error::{Error, Result};
use share_bus::{EventRateLimiter, ShareBus, ShareEvent};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    Multipart(MultipartForm),
}

/// A small, serializable description of a multipart form; turned into a `reqwest::multipart::Form`
/// at submit time, since `reqwest::multipart::Form` itself is neither `Clone` nor `Debug`.
#[derive(Debug, Clone, Default)]
pub struct MultipartForm {
    pub text_fields: Vec<(String, String)>,
    pub file_field: Option<(String, String, Bytes)>,
}

impl MultipartForm {
    pub fn new() -> Self {
        MultipartForm::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.text_fields.push((name.into(), value.into()));
        self
    }

    pub fn file(mut self, name: impl Into<String>, filename: impl Into<String>, bytes: Bytes) -> Self {
        self.file_field = Some((name.into(), filename.into(), bytes));
        self
    }

    fn into_reqwest(self) -> reqwest::multipart::Form {
        let mut form = reqwest::multipart::Form::new();
        for (name, value) in self.text_fields {
            form = form.text(name, value);
        }
        if let Some((name, filename, bytes)) = self.file_field {
            let part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name(filename);
            form = form.part(name, part);
        }
        form
    }
}

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: RequestBody,
    pub follow_redirects: bool,
    pub timeout: Duration,
    pub cancellation: CancellationToken,
}

impl TransportRequest {
    pub fn new(url: impl Into<String>, method: Method) -> Self {
        TransportRequest {
            url: url.into(),
            method,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            follow_redirects: true,
            timeout: Duration::from_secs(60),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// A token an unrelated caller can hold onto to cooperatively abort this submission.
    pub fn abort_handle(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}

/// `(bytesTransferred, totalBytes)`, invoked as a download or upload body streams.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn submit(&self, request: TransportRequest, progress: Option<ProgressCallback>) -> Result<TransportResponse>;
}

/// The real implementation, backed by a single shared `reqwest::Client`.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(max_sockets: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(max_sockets)
            .build()
            .map_err(|e| Error::io(format!("failed to build HTTP client: {e}")))?;
        Ok(HttpTransport { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        HttpTransport { client }
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn submit(&self, request: TransportRequest, progress: Option<ProgressCallback>) -> Result<TransportResponse> {
        let url: Url = request
            .url
            .parse()
            .map_err(|e| Error::io(format!("invalid URL {}: {e}", request.url)))?;

        let mut builder = self
            .client
            .request(request.method, url)
            .headers(request.headers)
            .timeout(request.timeout);

        if !request.follow_redirects {
            // reqwest::Client is built with a shared redirect policy; per-request opt-out isn't
            // exposed, so the caller relying on this is expected to configure a client-level
            // policy when it matters (METHOD Move/MKCOL calls never want redirects followed).
            log::trace!("submit: follow_redirects=false requested but not enforceable per-request");
        }

        let body_len: Option<u64>;
        builder = match request.body {
            RequestBody::Empty => {
                body_len = Some(0);
                builder
            }
            RequestBody::Bytes(bytes) => {
                body_len = Some(bytes.len() as u64);
                builder.body(bytes)
            }
            RequestBody::Multipart(form) => {
                body_len = None;
                builder.multipart(form.into_reqwest())
            }
        };

        let cancellation = request.cancellation.clone();
        let send = builder.send();
        let response = tokio::select! {
            res = send => res.map_err(Error::from)?,
            _ = cancellation.cancelled() => return Err(Error::aborted("transport request cancelled")),
        };

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let total = response.content_length().or(body_len).unwrap_or(0);

        let mut read = 0u64;
        let mut chunks = Vec::new();
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancellation.cancelled() => return Err(Error::aborted("transport request cancelled")),
            };
            match next {
                Some(chunk) => {
                    let chunk = chunk.map_err(Error::from)?;
                    read += chunk.len() as u64;
                    if let Some(cb) = &progress {
                        cb(read, total);
                    }
                    chunks.push(chunk);
                }
                None => break,
            }
        }

        let body = if chunks.len() == 1 {
            chunks.pop().unwrap()
        } else {
            let mut buf = Vec::with_capacity(read as usize);
            for chunk in chunks {
                buf.extend_from_slice(&chunk);
            }
            Bytes::from(buf)
        };

        Ok(TransportResponse { status, headers, body })
    }
}

/// Classifies a completed submission (or its failure) as the kind of network-health signal
/// described for `RemoteTransport`: 5xx-except-500 and transport errors are loss; 2xx/4xx are
/// restoration, reported edge-triggered.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NetworkSignal {
    Loss,
    Restored,
    Neutral,
}

pub fn classify(result: &Result<TransportResponse>) -> NetworkSignal {
    match result {
        Err(e) if e.kind() == rq_error::ErrorKind::Network => NetworkSignal::Loss,
        Err(_) => NetworkSignal::Neutral,
        Ok(resp) if resp.status >= 500 && resp.status != 500 => NetworkSignal::Loss,
        Ok(resp) if resp.status < 500 => NetworkSignal::Restored,
        Ok(_) => NetworkSignal::Neutral,
    }
}

/// Decorates any `RemoteTransport`, watching every submission's outcome and publishing
/// `networkLoss`/`networkRestored` on the bus, edge-triggered and rate-limited.
pub struct NetworkTrackingTransport<T> {
    inner: T,
    bus: ShareBus,
    limiter: EventRateLimiter,
    lossy: AtomicBool,
}

impl<T: RemoteTransport> NetworkTrackingTransport<T> {
    pub fn new(inner: T, bus: ShareBus, min_spacing: Duration) -> Self {
        NetworkTrackingTransport {
            inner,
            bus,
            limiter: EventRateLimiter::new(min_spacing),
            lossy: AtomicBool::new(false),
        }
    }

    fn observe(&self, signal: NetworkSignal) {
        match signal {
            NetworkSignal::Loss => {
                let was_lossy = self.lossy.swap(true, Ordering::SeqCst);
                if !was_lossy && self.limiter.should_emit(&ShareEvent::NetworkLoss, Instant::now()) {
                    self.bus.publish(ShareEvent::NetworkLoss);
                }
            }
            NetworkSignal::Restored => {
                let was_lossy = self.lossy.swap(false, Ordering::SeqCst);
                if was_lossy && self.limiter.should_emit(&ShareEvent::NetworkRestored, Instant::now()) {
                    self.bus.publish(ShareEvent::NetworkRestored);
                }
            }
            NetworkSignal::Neutral => {}
        }
    }
}

#[async_trait]
impl<T: RemoteTransport> RemoteTransport for NetworkTrackingTransport<T> {
    async fn submit(&self, request: TransportRequest, progress: Option<ProgressCallback>) -> Result<TransportResponse> {
        let result = self.inner.submit(request, progress).await;
        self.observe(classify(&result));
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn submit_returns_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let transport = HttpTransport::with_client(reqwest::Client::new());
        let request = TransportRequest::new(format!("{}/a.json", server.uri()), Method::GET);
        let response = transport.submit(request, None).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let transport = HttpTransport::with_client(reqwest::Client::new());
        let request = TransportRequest::new(format!("{}/slow", server.uri()), Method::GET);
        let token = request.abort_handle();
        token.cancel();
        let err = transport.submit(request, None).await.unwrap_err();
        assert_eq!(err.kind(), rq_error::ErrorKind::Aborted);
    }

    #[test]
    fn classify_maps_5xx_except_500_to_loss() {
        let resp = Ok(TransportResponse {
            status: 503,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        });
        assert_eq!(classify(&resp), NetworkSignal::Loss);

        let internal = Ok(TransportResponse {
            status: 500,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        });
        assert_eq!(classify(&internal), NetworkSignal::Neutral);
    }

    #[test]
    fn classify_maps_4xx_to_restored() {
        let resp = Ok(TransportResponse {
            status: 404,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        });
        assert_eq!(classify(&resp), NetworkSignal::Restored);
    }

    #[tokio::test]
    async fn loss_then_restore_is_edge_triggered() {
        let bus = ShareBus::new();
        let mut rx = bus.subscribe();
        let tracker = NetworkTrackingTransport::new(NeverTransport, bus, Duration::from_millis(0));

        let _ = tracker
            .submit(TransportRequest::new("http://example.invalid", Method::GET), None)
            .await;
        let _ = tracker
            .submit(TransportRequest::new("http://example.invalid", Method::GET), None)
            .await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ShareEvent::NetworkLoss));
        assert!(rx.try_recv().is_err());
    }

    struct NeverTransport;

    #[async_trait]
    impl RemoteTransport for NeverTransport {
        async fn submit(&self, _request: TransportRequest, _progress: Option<ProgressCallback>) -> Result<TransportResponse> {
            Err(Error::network("simulated"))
        }
    }
}
