//! Periodic token refresh (PowerFlex dialect): a background task refreshes a bearer token every
//! 5 minutes from the array's login endpoint; forwarded requests carry it as HTTP Basic with an
//! empty username.
//!
//! A long-lived tokio task owning state behind a lock, spawned at construction and torn down by
//! an explicit cancellation signal rather than by `Drop`, so teardown happens exactly when
//! `UpdateSystems` notices the owning `BackendSystem` is gone, not whenever the allocator
//! happens to run destructors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::SessionManager;
use crate::error::ProxyError;

const REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

pub struct TokenSession {
    token: Arc<RwLock<Option<String>>>,
    cancel: CancellationToken,
}

impl TokenSession {
    /// Spawn the refresh loop and return a handle to it. The loop keeps running, re-logging in
    /// every `REFRESH_INTERVAL`, until `shut_down` is called.
    pub fn spawn(
        client: reqwest::Client,
        endpoint: String,
        user: String,
        password: String,
        log: slog::Logger,
    ) -> Self {
        let token = Arc::new(RwLock::new(None));
        let cancel = CancellationToken::new();

        let task_token = token.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                match login(&client, &endpoint, &user, &password).await {
                    Ok(fresh) => {
                        *task_token.write().await = Some(fresh);
                    }
                    Err(e) => {
                        slog::warn!(log, "powerflex token refresh failed"; "endpoint" => &endpoint, "error" => e.to_string());
                    }
                }

                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
                }
            }
        });

        TokenSession { token, cancel }
    }
}

async fn login(
    client: &reqwest::Client,
    endpoint: &str,
    user: &str,
    password: &str,
) -> Result<String, ProxyError> {
    let url = format!("{endpoint}/api/login");
    let resp = client
        .get(&url)
        .basic_auth(user, Some(password))
        .send()
        .await
        .map_err(|e| ProxyError::Upstream(crate::error::UpstreamError::Transport(e)))?;
    let text = resp
        .text()
        .await
        .map_err(|e| ProxyError::Upstream(crate::error::UpstreamError::Transport(e)))?;
    Ok(text.trim_matches('"').to_string())
}

#[async_trait]
impl SessionManager for TokenSession {
    async fn prepare(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, ProxyError> {
        let current = self.token.read().await.clone().unwrap_or_default();
        Ok(builder.basic_auth("", Some(current)))
    }

    fn shut_down(&self) {
        self.cancel.cancel();
    }
}
