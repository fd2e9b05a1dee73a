//! Remote control-plane state API for Liftoff.
//!
//! [`HttpStateBackend`] implements `StateBackend` against the v1 REST API
//! described in [`protocol`]; `liftoff-server` is the reference server.
//! [`RemoteConfig`] holds the endpoint, bearer token, and tenant account id.

pub mod config;
pub mod http;
pub mod protocol;

pub use config::RemoteConfig;
pub use http::HttpStateBackend;
pub use protocol::{AcquireLock, ErrorBody, Route};

/// Protocol version sent as `X-Liftoff-Protocol` header on all HTTP requests.
pub const PROTOCOL_VERSION: u32 = 1;

use liftoff_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("remote config error: {0}")]
    Config(String),
}

impl From<RemoteError> for StoreError {
    fn from(e: RemoteError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_becomes_backend_error() {
        let e: StoreError = RemoteError::Http("connection refused".to_owned()).into();
        assert!(matches!(e, StoreError::Backend(ref m) if m.contains("connection refused")));
    }
}
