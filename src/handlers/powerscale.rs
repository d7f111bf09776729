//! PowerScale backend handler.
//!
//! Create/delete interception exists in older revisions of this dialect but is deliberately
//! disabled here: every path other than the session handshake is a bare proxy, with the
//! client's cookie/forwarded headers stripped before the array's session headers are attached.

use async_trait::async_trait;

use crate::config::SystemConfig;
use crate::enforcement::read_bounded_body;
use crate::error::{ErrorBodyShape, ProxyError};
use crate::ledger::SharedLedger;
use crate::policy::PolicyClient;
use crate::proxy;
use crate::session::cookie::{spoofed_session_get, spoofed_session_post, strip_client_headers};

use super::{build_powerscale_system, reconcile_systems, respond_error, BackendHandler, BackendSystem, SystemsTable};

const FAMILY: &str = "powerscale";
const BODY_SHAPE: ErrorBodyShape = ErrorBodyShape::ErrorsArray;

pub struct PowerScaleHandler {
    systems: SystemsTable,
    #[allow(dead_code)]
    ledger: SharedLedger,
    policy: PolicyClient,
    log: slog::Logger,
}

impl PowerScaleHandler {
    pub fn new(ledger: SharedLedger, policy: PolicyClient, log: slog::Logger) -> Self {
        PowerScaleHandler {
            systems: SystemsTable::default(),
            ledger,
            policy,
            log,
        }
    }
}

#[async_trait]
impl BackendHandler for PowerScaleHandler {
    async fn serve(&self, system_id: &str, req: http::Request<hyper::Body>) -> http::Response<hyper::Body> {
        let system = {
            let table = self.systems.lock().await;
            match table.get(system_id) {
                Some(s) => s.clone(),
                None => return respond_error(&ProxyError::UnknownSystem(system_id.to_string()), BODY_SHAPE),
            }
        };

        let method = req.method().clone();
        let uri = req.uri().clone();
        let path = uri.path().to_string();

        match self
            .policy
            .check_url("/karavi/authz/url", method.as_str(), &uri.to_string())
            .await
        {
            Err(e) => return respond_error(&e, BODY_SHAPE),
            Ok(decision) if !decision.allow => {
                return respond_error(&ProxyError::UrlNotPermitted, BODY_SHAPE)
            }
            Ok(_) => {}
        }

        if path == "/session/1/session/" {
            let resp = if method == http::Method::GET {
                spoofed_session_get()
            } else {
                spoofed_session_post()
            };
            return resp.map(hyper::Body::from);
        }

        self.bare_proxy(&system, req).await
    }

    async fn update_systems(&self, config: &SystemConfig) {
        let fresh = crate::config::systems_for_family(config, FAMILY);
        reconcile_systems(&self.systems, &fresh, build_powerscale_system, &self.log).await;
    }
}

impl PowerScaleHandler {
    async fn bare_proxy(&self, system: &BackendSystem, req: http::Request<hyper::Body>) -> http::Response<hyper::Body> {
        let method = req.method().clone();
        let path_and_query = req.uri().path_and_query().map(|p| p.as_str().to_string()).unwrap_or_default();
        let mut headers = req.headers().clone();
        strip_client_headers(&mut headers);
        let body = match read_bounded_body(req.into_body(), None).await {
            Ok(b) => b,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        match proxy::forward(system, method, &path_and_query, headers, body).await {
            Ok(resp) => super::passthrough_response(resp.status, resp.headers, resp.body),
            Err(e) => respond_error(&e, BODY_SHAPE),
        }
    }
}
