// Licensed under the Apache License, Version 2.0 (see LICENSE).
#![deny(warnings)]
#![allow(clippy::new_without_default)]

//! The closed error taxonomy shared by every `hybridfs` crate.
//!
//! Mirrors the shape of `sharded_lmdb::StoreError` / `process_execution::ProcessError` in the
//! crate this workspace is grounded on: a plain enum, manual `Display`, manual `From` impls for
//! the handful of upstream error types each component actually produces. No `thiserror`.

use std::fmt;

/// Closed taxonomy of failures. Each kind has a fixed, stable mapping to a wire status code so
/// that a front end (e.g. an SMB server) can translate it without depending on this crate's
/// internals.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    NotSupported,
    AccessDenied,
    Conflict,
    Network,
    RemoteError,
    Io,
    Aborted,
    Corruption,
}

impl ErrorKind {
    /// The wire-layer status code for this kind. The SMB front end (out of scope here) maps
    /// these onto its own protocol's NT status codes; this is the lingua franca in between.
    pub fn status_code(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "no-such-file",
            ErrorKind::AlreadyExists => "name-collision",
            ErrorKind::NotSupported => "not-supported",
            ErrorKind::AccessDenied => "access-denied",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Network => "network",
            ErrorKind::RemoteError => "remote-error",
            ErrorKind::Io => "io",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Corruption => "corruption",
        }
    }

    /// Whether the background processor should retry an operation that failed with this kind.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Network | ErrorKind::RemoteError)
    }
}

/// An error carrying its `ErrorKind` plus free-form context, the way `StoreError`/`ProcessError`
/// pair a variant with a `String` message rather than a typed payload.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: String,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported, message)
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AccessDenied, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn remote_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RemoteError, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Aborted, message)
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Corruption, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
            _ => ErrorKind::Io,
        };
        Error::new(kind, err.to_string())
    }
}

impl From<lmdb::Error> for Error {
    fn from(err: lmdb::Error) -> Self {
        match err {
            lmdb::Error::NotFound => Error::not_found(err.to_string()),
            other => Error::io(format!("lmdb: {other}")),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Error::network(err.to_string())
        } else if let Some(status) = err.status() {
            if status.as_u16() == 423 {
                Error::access_denied(err.to_string())
            } else if status.is_server_error() && status.as_u16() != 500 {
                Error::network(err.to_string())
            } else {
                Error::remote_error(err.to_string())
            }
        } else {
            Error::network(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_stable() {
        assert_eq!(ErrorKind::NotFound.status_code(), "no-such-file");
        assert_eq!(ErrorKind::AlreadyExists.status_code(), "name-collision");
    }

    #[test]
    fn retryable_kinds() {
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::RemoteError.is_retryable());
        assert!(!ErrorKind::AccessDenied.is_retryable());
        assert!(!ErrorKind::NotSupported.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
    }

    #[test]
    fn io_not_found_maps_to_not_found_kind() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
