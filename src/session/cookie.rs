//! Session cookie + CSRF (PowerScale dialect): probe the stored session, log in on a 401, and
//! carry the resulting `isisessid`/`isicsrf` pair on every forwarded request.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::SessionManager;
use crate::error::{ProxyError, UpstreamError};

#[derive(Debug, Clone, Default)]
struct SessionTokens {
    isisessid: String,
    isicsrf: String,
}

pub struct CookieSession {
    client: reqwest::Client,
    endpoint: String,
    user: String,
    password: String,
    tokens: Arc<RwLock<Option<SessionTokens>>>,
}

impl CookieSession {
    pub fn new(
        client: reqwest::Client,
        endpoint: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        CookieSession {
            client,
            endpoint: endpoint.into(),
            user: user.into(),
            password: password.into(),
            tokens: Arc::new(RwLock::new(None)),
        }
    }

    /// Probe `GET /session/1/session` with whatever cookie we're currently holding; if that
    /// comes back `401`, log in fresh and store the new pair.
    async fn ensure_session(&self) -> Result<SessionTokens, ProxyError> {
        if let Some(tokens) = self.tokens.read().await.clone() {
            let probe_url = format!("{}/session/1/session", self.endpoint);
            let probe = self
                .client
                .get(&probe_url)
                .header(http::header::COOKIE, format!("isisessid={}", tokens.isisessid))
                .send()
                .await
                .map_err(|e| ProxyError::Upstream(UpstreamError::Transport(e)))?;
            if probe.status() != http::StatusCode::UNAUTHORIZED {
                return Ok(tokens);
            }
        }

        let login_url = format!("{}/session/1/session", self.endpoint);
        let resp = self
            .client
            .post(&login_url)
            .json(&serde_json::json!({
                "username": self.user,
                "password": self.password,
                "services": ["platform", "namespace"],
            }))
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(UpstreamError::Transport(e)))?;

        let fresh = parse_set_cookie(resp.headers())
            .ok_or_else(|| ProxyError::AuthContext("powerscale login did not return session cookies".into()))?;

        *self.tokens.write().await = Some(fresh.clone());
        Ok(fresh)
    }
}

/// Pull `isisessid=...;` and `isicsrf=...;` out of the response's `Set-Cookie` headers.
fn parse_set_cookie(headers: &http::HeaderMap) -> Option<SessionTokens> {
    let mut tokens = SessionTokens::default();
    let mut found = false;

    for value in headers.get_all(http::header::SET_COOKIE) {
        let Ok(value) = value.to_str() else { continue };
        let first_segment = value.split(';').next().unwrap_or("");
        if let Some((key, val)) = first_segment.split_once('=') {
            match key.trim() {
                "isisessid" => {
                    tokens.isisessid = val.trim().to_string();
                    found = true;
                }
                "isicsrf" => {
                    tokens.isicsrf = val.trim().to_string();
                    found = true;
                }
                _ => {}
            }
        }
    }

    found.then_some(tokens)
}

/// Hop-by-hop and forwarding headers that must never leak from the client request into the
/// array request, stripped *before* session headers are attached.
const STRIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "forwarded",
    "cookie",
    "x-csrf-token",
    "referer",
    "host",
    "authorization",
];

pub fn strip_client_headers(headers: &mut http::HeaderMap) {
    for name in STRIPPED_HEADERS {
        headers.remove(*name);
    }
}

#[async_trait]
impl SessionManager for CookieSession {
    async fn prepare(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, ProxyError> {
        let tokens = self.ensure_session().await?;
        let host = self
            .endpoint
            .parse::<http::Uri>()
            .ok()
            .and_then(|u| u.host().map(str::to_string))
            .unwrap_or_default();

        Ok(builder
            .header(
                http::header::COOKIE,
                format!("isisessid={}; isicsrf={}", tokens.isisessid, tokens.isicsrf),
            )
            .header("X-CSRF-Token", tokens.isicsrf)
            .header(http::header::REFERER, format!("https://{host}/"))
            .header(http::header::HOST, host))
    }
}

/// Synthetic response for a client `GET /session/1/session/` probe, so the driver believes it
/// already has a live session without us round-tripping to the array.
pub fn spoofed_session_get() -> http::Response<bytes::Bytes> {
    http::Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(bytes::Bytes::from_static(b"{}"))
        .expect("building a static response cannot fail")
}

/// Synthetic response for a client `POST /session/1/session/` login, carrying the cookies the
/// driver expects to see on a real login: a 201 with `Set-Cookie` headers attached.
pub fn spoofed_session_post() -> http::Response<bytes::Bytes> {
    http::Response::builder()
        .status(http::StatusCode::CREATED)
        .header(http::header::CONTENT_TYPE, "application/json")
        .header(http::header::SET_COOKIE, "isisessid=spoofed; Path=/")
        .header(http::header::SET_COOKIE, "isicsrf=spoofed; Path=/")
        .body(bytes::Bytes::from_static(b"{}"))
        .expect("building a static response cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_cookie_names() {
        let mut headers = http::HeaderMap::new();
        headers.append(http::header::SET_COOKIE, "isisessid=abc123; Path=/".parse().unwrap());
        headers.append(http::header::SET_COOKIE, "isicsrf=xyz789; Path=/".parse().unwrap());
        let tokens = parse_set_cookie(&headers).unwrap();
        assert_eq!(tokens.isisessid, "abc123");
        assert_eq!(tokens.isicsrf, "xyz789");
    }

    #[test]
    fn missing_set_cookie_yields_none() {
        let headers = http::HeaderMap::new();
        assert!(parse_set_cookie(&headers).is_none());
    }

    #[test]
    fn strips_hop_by_hop_and_forwarded_headers() {
        let mut headers = http::HeaderMap::new();
        headers.insert(http::header::COOKIE, "leftover=1".parse().unwrap());
        headers.insert(http::header::FORWARDED, "by=isilon".parse().unwrap());
        headers.insert(http::header::HOST, "client-sent-host".parse().unwrap());
        headers.insert(http::header::AUTHORIZATION, "Bearer tenant-token".parse().unwrap());
        strip_client_headers(&mut headers);
        assert!(headers.get(http::header::COOKIE).is_none());
        assert!(headers.get(http::header::FORWARDED).is_none());
        assert!(headers.get(http::header::HOST).is_none());
        assert!(headers.get(http::header::AUTHORIZATION).is_none());
    }

    #[test]
    fn spoofed_session_post_carries_both_cookies() {
        let resp = spoofed_session_post();
        assert_eq!(resp.status(), http::StatusCode::CREATED);
        assert_eq!(resp.headers().get_all(http::header::SET_COOKIE).iter().count(), 2);
    }
}
