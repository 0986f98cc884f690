// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

use bytes::Bytes;
use hybridfs::{MountPaths, Share};
use hybridfs_config::{Auth, Config, ProcessorConfig, Protocol, RemoteApi, UnicodeNormalizeForm};
use path_key::{PathKey, TempPredicate};
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

fn share(server: &MockServer) -> (Share, tempfile::TempDir, tempfile::TempDir) {
    let cache_dir = tempfile::tempdir().unwrap();
    let work_dir = tempfile::tempdir().unwrap();
    let share = Share::open(
        config(&server.uri()),
        MountPaths::new(cache_dir.path(), work_dir.path()),
        TempPredicate::never(),
    )
    .unwrap();
    (share, cache_dir, work_dir)
}

/// Scenario 2: create-then-delete collapses, so the remote never sees a request.
#[tokio::test]
async fn create_then_delete_never_reaches_remote() {
    let _ = env_logger::try_init();
    let server = MockServer::start().await;
    // Any call to either endpoint fails the test by construction: `.expect(0)`.
    Mock::given(method("POST"))
        .and(wm_path("/.createasset.html"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(wm_path("/bin/wcmcommand"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (share, _cache, _work) = share(&server);
    share.create_file(&key("/"), "b.txt").await.unwrap();
    share.write(&key("/b.txt"), Bytes::from_static(b"hi")).await.unwrap();
    share.delete(&key("/b.txt")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!share.exists(&key("/b.txt")).await.unwrap());

    share.shutdown(Duration::from_millis(200)).await;
    server.verify().await;
}

/// Scenario 4: rename onto an existing destination fails without `replace`, and succeeds with
/// it, ending up with the source's bytes at the destination.
#[tokio::test]
async fn rename_without_replace_then_with_replace() {
    let _ = env_logger::try_init();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(wm_path("/d1.txt.json"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(wm_path("/d2.txt.json"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let (share, _cache, _work) = share(&server);
    share.create_file(&key("/"), "d1.txt").await.unwrap();
    share.write(&key("/d1.txt"), Bytes::from_static(b"src")).await.unwrap();
    share.create_file(&key("/"), "d2.txt").await.unwrap();
    share.write(&key("/d2.txt"), Bytes::from_static(b"dst")).await.unwrap();

    let err = share.rename(&key("/d1.txt"), &key("/d2.txt"), false).await.unwrap_err();
    assert_eq!(err.kind(), rq_error::ErrorKind::AlreadyExists);

    share.rename(&key("/d1.txt"), &key("/d2.txt"), true).await.unwrap();
    assert!(!share.exists(&key("/d1.txt")).await.unwrap());
    assert_eq!(share.read(&key("/d2.txt")).await.unwrap(), Bytes::from_static(b"src"));

    share.shutdown(Duration::from_millis(200)).await;
}
