//! Reverse-proxy forwarding to backend arrays.
//!
//! A thin wrapper over a `reqwest::Client` that does one HTTP round trip and hands back a typed
//! result, rather than a raw hyper-to-hyper streaming proxy -- bodies are already fully buffered
//! by the time a handler gets here, so there is no streaming benefit to give up.

use bytes::Bytes;

use crate::error::{ProxyError, UpstreamError};
use crate::handlers::BackendSystem;
use crate::session::SessionManager;

/// The result of forwarding one request, with just enough detail for callers to decide whether
/// to publish a ledger state transition.
pub struct ProxiedResponse {
    pub status: http::StatusCode,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

impl ProxiedResponse {
    pub fn is_success(&self) -> bool {
        self.status == http::StatusCode::OK
    }
}

/// Forward `method url` (relative to `system.entry.endpoint`) with `body`, substituting
/// credentials via the system's session manager.
pub async fn forward(
    system: &BackendSystem,
    method: http::Method,
    path_and_query: &str,
    headers: http::HeaderMap,
    body: Bytes,
) -> Result<ProxiedResponse, ProxyError> {
    let url = format!("{}{}", system.entry.endpoint.trim_end_matches('/'), path_and_query);

    let mut builder = system
        .client
        .request(method, &url)
        .body(body);

    for (name, value) in headers.iter() {
        builder = builder.header(name, value);
    }

    builder = system
        .session
        .prepare(builder)
        .await?;

    let resp = builder
        .send()
        .await
        .map_err(|e| ProxyError::Upstream(UpstreamError::Transport(e)))?;

    let status = resp.status();
    let headers = resp.headers().clone();
    let body = resp
        .bytes()
        .await
        .map_err(|e| ProxyError::Upstream(UpstreamError::Transport(e)))?;

    Ok(ProxiedResponse { status, headers, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_only_plain_200() {
        let resp = ProxiedResponse {
            status: http::StatusCode::OK,
            headers: http::HeaderMap::new(),
            body: Bytes::new(),
        };
        assert!(resp.is_success());

        let resp = ProxiedResponse {
            status: http::StatusCode::CREATED,
            headers: http::HeaderMap::new(),
            body: Bytes::new(),
        };
        assert!(!resp.is_success());
    }
}
