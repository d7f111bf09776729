//! The Backend Session Manager: per-array credential acquisition, one dialect per
//! storage family, plus the synthetic "spoofed" responders that satisfy a driver's login/session
//! handshake without ever reaching the array.
//!
//! Outside-world session state that must be prepared before use and torn down on removal sits
//! behind a trait, so the rest of the pipeline doesn't need to know which dialect it's talking to.

pub mod basic;
pub mod cookie;
pub mod token;

use async_trait::async_trait;

use crate::error::ProxyError;

/// Attaches whatever credentials a backend family needs to an outgoing proxied request.
/// Implementors own any session state (tokens, cookies) and refresh it as their dialect
/// requires; `prepare` never blocks on a refresh longer than reusing an already-cached value.
#[async_trait]
pub trait SessionManager: Send + Sync {
    async fn prepare(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, ProxyError>;

    /// Called once, synchronously, when the owning `BackendSystem` is dropped on a config
    /// reload. Default no-op: only dialects that hold a background task (`token::TokenSession`)
    /// need to override it.
    fn shut_down(&self) {}
}

/// The synthetic login body PowerFlex's driver expects in place of a real `/api/login/`
/// round-trip.
pub const POWERFLEX_SPOOFED_LOGIN_BODY: &str = "hellofromkaravi";

/// Build the synthetic 200 response for a PowerFlex `POST /api/login/` request.
pub fn spoofed_powerflex_login() -> http::Response<bytes::Bytes> {
    http::Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(bytes::Bytes::from_static(POWERFLEX_SPOOFED_LOGIN_BODY.as_bytes()))
        .expect("building a static response cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spoofed_login_carries_expected_body() {
        let resp = spoofed_powerflex_login();
        assert_eq!(resp.status(), http::StatusCode::OK);
        assert_eq!(resp.body(), &bytes::Bytes::from_static(b"hellofromkaravi"));
    }
}
