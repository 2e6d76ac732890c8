//! Error types, one per fallible operation.

use thiserror::Error;

/// Configuration could not be loaded. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Talking to the purifier failed. The current decision cycle is aborted.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no reply from device within {0} ms")]
    Timeout(u64),

    #[error("malformed packet: {0}")]
    Protocol(String),

    #[error("device returned error: {0}")]
    Rpc(String),

    #[error("property {siid}/{piid} failed with code {code}")]
    Property { siid: u32, piid: u32, code: i64 },
}

/// An inbound sensor message could not be understood. The message is dropped.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(String),

    #[error("invalid value at {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// A push notification could not be delivered. Always swallowed by the sender.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notification endpoint answered HTTP {0}")]
    Status(u16),
}
