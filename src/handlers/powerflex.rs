//! PowerFlex backend handler.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::claims;
use crate::config::SystemConfig;
use crate::enforcement::{join_deny_reasons, read_bounded_body, strip_inbound_authorization, volume_name_from_headers};
use crate::error::{ErrorBodyShape, ProxyError};
use crate::ledger::{Ledger, QuotaRequest, SharedLedger};
use crate::policy::{PolicyClient, ProvisioningInput};
use crate::pool_cache::{PoolLoader, PoolNameCache};
use crate::proxy;

use super::{build_powerflex_system, reconcile_systems, respond_error, BackendHandler, BackendSystem, SystemsTable};

const FAMILY: &str = "powerflex";
const BODY_SHAPE: ErrorBodyShape = ErrorBodyShape::CodeMessage;

pub struct PowerFlexHandler {
    systems: SystemsTable,
    ledger: SharedLedger,
    policy: PolicyClient,
    pool_cache: PoolNameCache,
    log: slog::Logger,
}

impl PowerFlexHandler {
    pub fn new(ledger: SharedLedger, policy: PolicyClient, log: slog::Logger) -> Self {
        PowerFlexHandler {
            systems: SystemsTable::default(),
            ledger,
            policy,
            pool_cache: PoolNameCache::new(),
            log,
        }
    }
}

#[async_trait]
impl BackendHandler for PowerFlexHandler {
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

        // The array's real login endpoint is a GET (ScaleIO API convention); tolerate the
        // trailing-slash POST form too rather than picking one and failing the other.
        if path.trim_end_matches('/') == "/api/login" {
            let resp = crate::session::spoofed_powerflex_login();
            return resp.map(hyper::Body::from);
        }

        if method == http::Method::POST && path.contains("/action/queryIdByKey/") {
            return self.bare_proxy(&system, req).await;
        }

        if method == http::Method::POST
            && path.starts_with("/api/types/Volume/instances")
            && !path.contains("/action/")
        {
            return self.volume_create(&system, system_id, req).await;
        }

        if method == http::Method::POST && path.contains("/action/removeVolume/") {
            return self.volume_delete(&system, system_id, &path, req).await;
        }

        if method == http::Method::POST && path.contains("/action/addMappedSdc/") {
            return self.volume_map_unmap(&system, system_id, &path, req, "map denied").await;
        }

        if method == http::Method::POST && path.contains("/action/removeMappedSdc/") {
            return self.volume_map_unmap(&system, system_id, &path, req, "unmap denied").await;
        }

        self.bare_proxy(&system, req).await
    }

    async fn update_systems(&self, config: &SystemConfig) {
        let fresh = crate::config::systems_for_family(config, FAMILY);
        reconcile_systems(&self.systems, &fresh, build_powerflex_system, &self.log).await;
    }
}

struct ArrayPoolLoader<'a> {
    system: &'a BackendSystem,
}

#[async_trait]
impl<'a> PoolLoader for ArrayPoolLoader<'a> {
    async fn load_pools(&self) -> Result<Vec<(String, String)>, ProxyError> {
        let url = format!(
            "{}/api/types/StoragePool/instances",
            self.system.entry.endpoint.trim_end_matches('/')
        );
        let builder = self.system.client.get(&url);
        let builder = self.system.session.prepare(builder).await?;
        let resp = builder
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(crate::error::UpstreamError::Transport(e)))?;
        let pools: Vec<Value> = resp
            .json()
            .await
            .map_err(|e| ProxyError::Upstream(crate::error::UpstreamError::Transport(e)))?;

        Ok(pools
            .iter()
            .filter_map(|p| {
                let id = p.get("id")?.as_str()?.to_string();
                let name = p.get("name")?.as_str()?.to_string();
                Some((id, name))
            })
            .collect())
    }
}

impl PowerFlexHandler {
    async fn bare_proxy(&self, system: &BackendSystem, req: http::Request<hyper::Body>) -> http::Response<hyper::Body> {
        let method = req.method().clone();
        let path_and_query = req.uri().path_and_query().map(|p| p.as_str().to_string()).unwrap_or_default();
        let mut headers = req.headers().clone();
        strip_inbound_authorization(&mut headers);
        let body = match read_bounded_body(req.into_body(), None).await {
            Ok(b) => b,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        match proxy::forward(system, method, &path_and_query, headers, body).await {
            Ok(resp) => super::passthrough_response(resp.status, resp.headers, resp.body),
            Err(e) => respond_error(&e, BODY_SHAPE),
        }
    }

    async fn volume_create(
        &self,
        system: &BackendSystem,
        system_id: &str,
        req: http::Request<hyper::Body>,
    ) -> http::Response<hyper::Body> {
        let mut headers = req.headers().clone();
        strip_inbound_authorization(&mut headers);
        let extensions = req.extensions().clone();
        let path_and_query = req.uri().path_and_query().map(|p| p.as_str().to_string()).unwrap_or_default();
        let body = match read_bounded_body(req.into_body(), None).await {
            Ok(b) => b,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        let request_json: Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => return respond_error(&ProxyError::Body(e.to_string()), BODY_SHAPE),
        };

        let storage_pool_id = request_json
            .get("storagePoolId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let volume_size_kb = request_json
            .get("volumeSizeInKb")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let volume_name = volume_name_from_headers(&headers);

        let loader = ArrayPoolLoader { system };
        let storage_pool_name = match self.pool_cache.resolve(system_id, &storage_pool_id, &loader).await {
            Ok(name) => name,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        let (_tenant, caller_claims) = match claims::extract(&extensions) {
            Ok(v) => v,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        let input = ProvisioningInput {
            claims: &caller_claims,
            request: &request_json,
            storagepool: &storage_pool_name,
            storagesystemid: system_id,
            systemtype: FAMILY,
        };
        let input_json = match serde_json::to_value(&input) {
            Ok(v) => v,
            Err(e) => return respond_error(&ProxyError::PolicyDecode(e), BODY_SHAPE),
        };

        let decision = match self.policy.query("/karavi/volumes/create", &input_json).await {
            Ok(envelope) => match envelope.decode_provisioning() {
                Ok(d) => d,
                Err(e) => return respond_error(&e, BODY_SHAPE),
            },
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        if !decision.allow {
            return respond_error(
                &ProxyError::PolicyDenied(join_deny_reasons(&decision.deny)),
                BODY_SHAPE,
            );
        }

        let max_quota_kb = decision.max_quota_kb(false);

        let quota_request = QuotaRequest {
            system_type: FAMILY.to_string(),
            system_id: system_id.to_string(),
            storage_pool_id: storage_pool_name,
            group: caller_claims.group.clone(),
            volume_name,
            capacity: Decimal::from(volume_size_kb),
        };

        let cancel = tokio_util::sync::CancellationToken::new();
        let approved = match self.ledger.approve_request(&quota_request, max_quota_kb, &cancel).await {
            Ok(v) => v,
            Err(e) => return respond_error(&ProxyError::Ledger(e), BODY_SHAPE),
        };
        if !approved {
            return respond_error(&ProxyError::QuotaExceeded, BODY_SHAPE);
        }

        let upstream = match proxy::forward(system, http::Method::POST, &path_and_query, headers, body).await {
            Ok(r) => r,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        if upstream.is_success() {
            if let Err(e) = self.ledger.publish_created(&quota_request).await {
                slog::error!(self.log, "failed to publish created after successful create"; "error" => e.to_string());
            }
        }

        super::passthrough_response(upstream.status, upstream.headers, upstream.body)
    }

    /// Extract the bare numeric/hex volume id out of `/api/instances/Volume::{id}/action/...`.
    fn volume_id_from_path(path: &str) -> Option<String> {
        path.split('/')
            .find_map(|segment| segment.strip_prefix("Volume::"))
            .map(str::to_string)
    }

    async fn lookup_volume(
        &self,
        system: &BackendSystem,
        volume_id: &str,
    ) -> Result<(String, String), ProxyError> {
        let url = format!(
            "{}/api/instances/Volume::{}",
            system.entry.endpoint.trim_end_matches('/'),
            volume_id
        );
        let builder = system.client.get(&url);
        let builder = system.session.prepare(builder).await?;
        let resp = builder
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(crate::error::UpstreamError::Transport(e)))?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProxyError::Upstream(crate::error::UpstreamError::Transport(e)))?;

        let name = body.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
        let pool_id = body
            .get("storagePoolId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok((name, pool_id))
    }

    async fn volume_delete(
        &self,
        system: &BackendSystem,
        system_id: &str,
        path: &str,
        req: http::Request<hyper::Body>,
    ) -> http::Response<hyper::Body> {
        let Some(volume_id) = Self::volume_id_from_path(path) else {
            return respond_error(&ProxyError::Routing("missing Volume:: segment".into()), BODY_SHAPE);
        };

        let (volume_name, pool_id) = match self.lookup_volume(system, &volume_id).await {
            Ok(v) => v,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        let loader = ArrayPoolLoader { system };
        let pool_name = match self.pool_cache.resolve(system_id, &pool_id, &loader).await {
            Ok(name) => name,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        let mut headers = req.headers().clone();
        strip_inbound_authorization(&mut headers);
        let extensions = req.extensions().clone();
        let path_and_query = req.uri().path_and_query().map(|p| p.as_str().to_string()).unwrap_or_default();
        let body = match read_bounded_body(req.into_body(), None).await {
            Ok(b) => b,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        let (_tenant, caller_claims) = match claims::extract(&extensions) {
            Ok(v) => v,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        let input = serde_json::json!({ "claims": caller_claims.group });
        let decision = match self.policy.query("/karavi/volumes/delete", &input).await {
            Ok(envelope) => match envelope.decode_legacy() {
                Ok(d) => d,
                Err(e) => return respond_error(&e, BODY_SHAPE),
            },
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        if !decision.response.allowed {
            let status_err = if decision.claims.group.is_empty() {
                http::StatusCode::UNAUTHORIZED
            } else {
                http::StatusCode::BAD_REQUEST
            };
            return respond_error(&denial_error(status_err, decision.response.status.reason), BODY_SHAPE);
        }

        let quota_request = QuotaRequest {
            system_type: FAMILY.to_string(),
            system_id: system_id.to_string(),
            storage_pool_id: pool_name,
            group: caller_claims.group.clone(),
            volume_name,
            capacity: Decimal::ZERO,
        };

        let owned = match self.ledger.delete_request(&quota_request).await {
            Ok(v) => v,
            Err(e) => return respond_error(&ProxyError::Ledger(e), BODY_SHAPE),
        };
        if !owned {
            return respond_error(&ProxyError::OwnershipDenied("request denied"), BODY_SHAPE);
        }

        let upstream = match proxy::forward(system, http::Method::POST, &path_and_query, headers, body).await {
            Ok(r) => r,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        if upstream.is_success() {
            if let Err(e) = self.ledger.publish_deleted(&quota_request).await {
                slog::error!(self.log, "failed to publish deleted after successful delete"; "error" => e.to_string());
            }
        }

        super::passthrough_response(upstream.status, upstream.headers, upstream.body)
    }

    async fn volume_map_unmap(
        &self,
        system: &BackendSystem,
        system_id: &str,
        path: &str,
        req: http::Request<hyper::Body>,
        denial_message: &'static str,
    ) -> http::Response<hyper::Body> {
        let Some(volume_id) = Self::volume_id_from_path(path) else {
            return respond_error(&ProxyError::Routing("missing Volume:: segment".into()), BODY_SHAPE);
        };

        let (volume_name, pool_id) = match self.lookup_volume(system, &volume_id).await {
            Ok(v) => v,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        let loader = ArrayPoolLoader { system };
        let pool_name = match self.pool_cache.resolve(system_id, &pool_id, &loader).await {
            Ok(name) => name,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        let mut headers = req.headers().clone();
        strip_inbound_authorization(&mut headers);
        let extensions = req.extensions().clone();
        let path_and_query = req.uri().path_and_query().map(|p| p.as_str().to_string()).unwrap_or_default();
        let body = match read_bounded_body(req.into_body(), None).await {
            Ok(b) => b,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        let (_tenant, caller_claims) = match claims::extract(&extensions) {
            Ok(v) => v,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        let policy_path = if denial_message == "map denied" {
            "/karavi/volumes/map"
        } else {
            "/karavi/volumes/unmap"
        };
        let input = serde_json::json!({ "claims": caller_claims.group });
        let decision = match self.policy.query(policy_path, &input).await {
            Ok(envelope) => match envelope.decode_legacy() {
                Ok(d) => d,
                Err(e) => return respond_error(&e, BODY_SHAPE),
            },
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        if !decision.response.allowed {
            let status_err = if decision.claims.group.is_empty() {
                http::StatusCode::UNAUTHORIZED
            } else {
                http::StatusCode::BAD_REQUEST
            };
            return respond_error(&denial_error(status_err, decision.response.status.reason), BODY_SHAPE);
        }

        let quota_request = QuotaRequest {
            system_type: FAMILY.to_string(),
            system_id: system_id.to_string(),
            storage_pool_id: pool_name,
            group: caller_claims.group.clone(),
            volume_name,
            capacity: Decimal::ZERO,
        };

        let owned = match self.ledger.validate_ownership(&quota_request).await {
            Ok(v) => v,
            Err(e) => return respond_error(&ProxyError::Ledger(e), BODY_SHAPE),
        };
        if !owned {
            return respond_error(&ProxyError::OwnershipDenied(denial_message), BODY_SHAPE);
        }

        match proxy::forward(system, http::Method::POST, &path_and_query, headers, body).await {
            Ok(resp) => super::passthrough_response(resp.status, resp.headers, resp.body),
            Err(e) => respond_error(&e, BODY_SHAPE),
        }
    }
}

fn denial_error(status: http::StatusCode, reason: String) -> ProxyError {
    if status == http::StatusCode::UNAUTHORIZED {
        ProxyError::Unauthorized(reason)
    } else {
        ProxyError::PolicyDenied(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_from_path_strips_prefix() {
        let path = "/api/instances/Volume::000000000000001/action/removeVolume";
        assert_eq!(
            PowerFlexHandler::volume_id_from_path(path),
            Some("000000000000001".to_string())
        );
    }

    #[test]
    fn volume_id_from_path_none_when_absent() {
        assert_eq!(PowerFlexHandler::volume_id_from_path("/api/version/"), None);
    }
}
