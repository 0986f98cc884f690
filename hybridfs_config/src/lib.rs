// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]

//! The enumerated configuration surface for a mounted share: remote endpoint, auth, cache TTLs,
//! and processor tuning, collected into one flat, `serde`-deserializable struct.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteApi {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub base_path: String,
}

#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Auth {
    Basic { user: String, pass: String },
    Bearer { bearer: String },
}

#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum UnicodeNormalizeForm {
    Nfc,
    Nfd,
    Nfkc,
    Nfkd,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorConfig {
    #[serde(default)]
    pub expiration_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_frequency_ms")]
    pub frequency_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    5_000
}
fn default_frequency_ms() -> u64 {
    1_000
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            expiration_ms: 0,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            frequency_ms: default_frequency_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub remote: RemoteApi,
    pub auth: Auth,

    #[serde(default = "default_max_sockets")]
    pub max_sockets: usize,

    #[serde(default = "default_all_cache_ttl_ms")]
    pub all_cache_ttl_ms: u64,
    #[serde(default = "default_content_cache_ttl_ms")]
    pub content_cache_ttl_ms: u64,
    #[serde(default = "default_bin_cache_ttl_ms")]
    pub bin_cache_ttl_ms: u64,

    #[serde(default = "default_chunk_upload_size_mb")]
    pub chunk_upload_size_mb: u64,

    #[serde(default)]
    pub processor: ProcessorConfig,

    #[serde(default = "default_unicode_form")]
    pub unicode_normalize_form: UnicodeNormalizeForm,

    #[serde(default)]
    pub allow_non_empty_dir_delete: bool,

    #[serde(default)]
    pub preserve_cache_files: Vec<String>,
}

fn default_max_sockets() -> usize {
    32
}
fn default_all_cache_ttl_ms() -> u64 {
    1_800_000
}
fn default_content_cache_ttl_ms() -> u64 {
    30_000
}
fn default_bin_cache_ttl_ms() -> u64 {
    300_000
}
fn default_chunk_upload_size_mb() -> u64 {
    10
}
fn default_unicode_form() -> UnicodeNormalizeForm {
    UnicodeNormalizeForm::Nfc
}

impl Config {
    pub fn chunk_upload_size_bytes(&self) -> u64 {
        self.chunk_upload_size_mb * 1024 * 1024
    }

    pub fn base_url(&self) -> String {
        let scheme = match self.remote.protocol {
            Protocol::Http => "http",
            Protocol::Https => "https",
        };
        format!(
            "{scheme}://{}:{}{}",
            self.remote.host, self.remote.port, self.remote.base_path
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied_when_omitted() {
        let json = r#"{
            "remote": {"host": "example.com", "port": 443, "protocol": "https", "basePath": "/content/dam"},
            "auth": {"bearer": "token"}
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_sockets, 32);
        assert_eq!(config.all_cache_ttl_ms, 1_800_000);
        assert_eq!(config.content_cache_ttl_ms, 30_000);
        assert_eq!(config.bin_cache_ttl_ms, 300_000);
        assert_eq!(config.chunk_upload_size_mb, 10);
        assert_eq!(config.processor.max_retries, 3);
        assert_eq!(
            config.base_url(),
            "https://example.com:443/content/dam"
        );
    }

    #[test]
    fn auth_deserializes_both_credential_shapes() {
        let bearer: Auth = serde_json::from_str(r#"{"bearer": "token"}"#).unwrap();
        assert!(matches!(bearer, Auth::Bearer { bearer } if bearer == "token"));

        let basic: Auth = serde_json::from_str(r#"{"user": "alice", "pass": "secret"}"#).unwrap();
        assert!(matches!(basic, Auth::Basic { user, pass } if user == "alice" && pass == "secret"));
    }
}
