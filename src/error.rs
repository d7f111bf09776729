//! Crate-wide error taxonomy.
//!
//! Each variant maps to exactly one HTTP status and one family-shaped error body, computed in
//! `handlers::respond_error`. Kept as a flat `thiserror` enum rather than per-module error types
//! because every one of these has to cross the handler boundary and pick a status code; splitting
//! it up would just move the same match arms somewhere else.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("malformed Forwarded header: {0}")]
    Routing(String),

    #[error("unknown system id '{0}'")]
    UnknownSystem(String),

    #[error("missing or malformed auth context: {0}")]
    AuthContext(String),

    #[error("policy engine request failed: {0}")]
    PolicyTransport(#[from] reqwest::Error),

    #[error("policy engine returned malformed response: {0}")]
    PolicyDecode(#[from] serde_json::Error),

    #[error("policy denied: {0}")]
    PolicyDenied(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("url not permitted")]
    UrlNotPermitted,

    #[error("ledger operation failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("quota exceeded")]
    QuotaExceeded,

    #[error("ownership check failed: {0}")]
    OwnershipDenied(&'static str),

    #[error("upstream array request failed: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("request body error: {0}")]
    Body(String),

    #[error("storage pool lookup failed: {0}")]
    PoolLookup(String),

    #[error("operation canceled")]
    Canceled,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger store transport error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("ledger script returned malformed data: {0}")]
    Decode(String),

    #[error("operation canceled while waiting on the ledger")]
    Canceled,
}

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("failed to reach backend array: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to build proxied request: {0}")]
    Build(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The shape of the body written back to the client, per family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorBodyShape {
    /// `{"errorCode":<int>,"httpStatusCode":<int>,"message":"..."}` (PowerFlex, PowerMax).
    CodeMessage,
    /// `{"errors":[{"code":"<int-as-string>","message":"..."}]}` (PowerScale).
    ErrorsArray,
}

impl ProxyError {
    /// The HTTP status this error should be surfaced as.
    pub fn status(&self) -> http::StatusCode {
        use http::StatusCode as S;
        match self {
            ProxyError::Routing(_) => S::BAD_GATEWAY,
            ProxyError::UnknownSystem(_) => S::BAD_GATEWAY,
            ProxyError::AuthContext(_) => S::INTERNAL_SERVER_ERROR,
            ProxyError::PolicyTransport(_) => S::INTERNAL_SERVER_ERROR,
            ProxyError::PolicyDecode(_) => S::INTERNAL_SERVER_ERROR,
            ProxyError::PolicyDenied(_) => S::BAD_REQUEST,
            ProxyError::Unauthorized(_) => S::UNAUTHORIZED,
            ProxyError::UrlNotPermitted => S::NOT_FOUND,
            ProxyError::Ledger(_) => S::INTERNAL_SERVER_ERROR,
            ProxyError::QuotaExceeded => S::INSUFFICIENT_STORAGE,
            ProxyError::OwnershipDenied(_) => S::FORBIDDEN,
            ProxyError::Upstream(_) => S::BAD_GATEWAY,
            ProxyError::Body(_) => S::BAD_REQUEST,
            ProxyError::PoolLookup(_) => S::INTERNAL_SERVER_ERROR,
            ProxyError::Canceled => S::INTERNAL_SERVER_ERROR,
        }
    }

    /// The message placed in the family-shaped error body.
    pub fn message(&self) -> String {
        match self {
            ProxyError::OwnershipDenied(msg) => msg.to_string(),
            other => other.to_string(),
        }
    }
}
