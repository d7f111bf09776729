//! Backend Handlers: one per storage family, each owning a live `{system_id ->
//! BackendSystem}` table and composing a reverse proxy with a family-specific router.
//!
//! `BackendSystem` and `UpdateSystems` wrap background state (a live session manager, a
//! reconnect/refresh task) behind a small owned struct, with the whole `{system_id ->
//! BackendSystem}` table rebuilt wholesale and diffed against the previous one on every reload.

pub mod powerflex;
pub mod powermax;
pub mod powerscale;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

use crate::config::{SystemConfig, SystemEntry};
use crate::error::{ErrorBodyShape, ProxyError};
use crate::ledger::SharedLedger;
use crate::policy::PolicyClient;
use crate::pool_cache::PoolNameCache;
use crate::session::{basic::BasicAuthSession, cookie::CookieSession, token::TokenSession, SessionManager};

/// Per-array runtime state: the configured entry, a ready HTTP client for reaching it, and its
/// session manager. Owned exclusively by the handler that built it.
pub struct BackendSystem {
    pub entry: SystemEntry,
    pub client: reqwest::Client,
    pub session: Arc<dyn SessionManager>,
}

impl BackendSystem {
    fn build_client(entry: &SystemEntry) -> Result<reqwest::Client, ProxyError> {
        reqwest::Client::builder()
            .danger_accept_invalid_certs(entry.insecure)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ProxyError::Upstream(crate::error::UpstreamError::Transport(e)))
    }
}

pub type SystemsTable = Mutex<HashMap<String, Arc<BackendSystem>>>;

/// Common handler contract: every family's `serve` takes the raw forwarded-to endpoint/system
/// id the dispatcher already resolved, plus the inbound request, and returns a complete response.
#[async_trait]
pub trait BackendHandler: Send + Sync {
    async fn serve(
        &self,
        system_id: &str,
        req: http::Request<hyper::Body>,
    ) -> http::Response<hyper::Body>;

    /// Decode a fresh `SystemConfig` slice for this family and reconcile the live table
    /// against it.
    async fn update_systems(&self, config: &SystemConfig);
}

/// Build a fresh `BackendSystem` for one family/dialect, logging (not failing the whole reload)
/// on a per-system construction error -- failures on individual systems are logged and skipped.
pub fn build_powerflex_system(entry: SystemEntry, log: &slog::Logger) -> Option<Arc<BackendSystem>> {
    let client = match BackendSystem::build_client(&entry) {
        Ok(c) => c,
        Err(e) => {
            slog::error!(log, "failed to build http client for powerflex system"; "error" => e.to_string());
            return None;
        }
    };
    let session = TokenSession::spawn(
        client.clone(),
        entry.endpoint.clone(),
        entry.user.clone(),
        entry.password.clone(),
        log.clone(),
    );
    Some(Arc::new(BackendSystem {
        entry,
        client,
        session: Arc::new(session),
    }))
}

pub fn build_powermax_system(entry: SystemEntry, log: &slog::Logger) -> Option<Arc<BackendSystem>> {
    let client = match BackendSystem::build_client(&entry) {
        Ok(c) => c,
        Err(e) => {
            slog::error!(log, "failed to build http client for powermax system"; "error" => e.to_string());
            return None;
        }
    };
    let session = BasicAuthSession::new(entry.user.clone(), entry.password.clone());
    Some(Arc::new(BackendSystem {
        entry,
        client,
        session: Arc::new(session),
    }))
}

pub fn build_powerscale_system(entry: SystemEntry, log: &slog::Logger) -> Option<Arc<BackendSystem>> {
    let client = match BackendSystem::build_client(&entry) {
        Ok(c) => c,
        Err(e) => {
            slog::error!(log, "failed to build http client for powerscale system"; "error" => e.to_string());
            return None;
        }
    };
    let session = CookieSession::new(client.clone(), entry.endpoint.clone(), entry.user.clone(), entry.password.clone());
    Some(Arc::new(BackendSystem {
        entry,
        client,
        session: Arc::new(session),
    }))
}

/// Reconcile a family's live table against a fresh config slice: drop removed ids (shutting
/// down their session manager first), build new/changed ones via `build`, leave unchanged ones
/// alone.
pub async fn reconcile_systems(
    table: &SystemsTable,
    fresh: &HashMap<String, SystemEntry>,
    build: impl Fn(SystemEntry, &slog::Logger) -> Option<Arc<BackendSystem>>,
    log: &slog::Logger,
) {
    let mut table = table.lock().await;

    table.retain(|id, existing| {
        let keep = fresh.get(id) == Some(&existing.entry);
        if !keep {
            existing.session.shut_down();
        }
        keep
    });

    for (id, entry) in fresh {
        if table.contains_key(id) {
            continue;
        }
        if let Some(system) = build(entry.clone(), log) {
            table.insert(id.clone(), system);
        }
    }
}

/// Render a `ProxyError` into the family-shaped error body plus its status code.
pub fn respond_error(err: &ProxyError, shape: ErrorBodyShape) -> http::Response<hyper::Body> {
    let status = err.status();
    let message = err.message();

    let body = match shape {
        ErrorBodyShape::CodeMessage => serde_json::json!({
            "errorCode": status.as_u16(),
            "httpStatusCode": status.as_u16(),
            "message": message,
        }),
        ErrorBodyShape::ErrorsArray => serde_json::json!({
            "errors": [{ "code": status.as_u16().to_string(), "message": message }],
        }),
    };

    http::Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(hyper::Body::from(body.to_string()))
        .unwrap_or_else(|_| {
            let mut resp = http::Response::new(hyper::Body::from(message));
            *resp.status_mut() = status;
            resp
        })
}

/// Convert a buffered upstream reverse-proxy response into a `hyper::Response`, unchanged --
/// response bodies are never transformed.
pub fn passthrough_response(status: http::StatusCode, headers: http::HeaderMap, body: Bytes) -> http::Response<hyper::Body> {
    let mut builder = http::Response::builder().status(status);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    builder
        .body(hyper::Body::from(body))
        .unwrap_or_else(|_| http::Response::new(hyper::Body::empty()))
}
