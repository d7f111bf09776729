//! PowerMax backend handler.
//!
//! PowerMax's REST dialect folds volume creation into a storage-group *expand* call rather than
//! a dedicated create endpoint, and folds deletion into a volume *rename* (to a `_DEL*` prefix)
//! rather than a dedicated delete endpoint -- both sub-routers below exist to recognize those
//! shapes inside an otherwise-generic `PUT`.

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

use super::{build_powermax_system, reconcile_systems, respond_error, BackendHandler, BackendSystem, SystemsTable};

const FAMILY: &str = "powermax";
const BODY_SHAPE: ErrorBodyShape = ErrorBodyShape::CodeMessage;
/// Body bytes read before decoding.
const BODY_LIMIT: usize = 1024;
/// Bytes per cylinder, used to convert PowerMax's CYL-denominated volume size into kilobytes.
const BYTES_PER_CYLINDER: i64 = 1_966_080;

pub struct PowerMaxHandler {
    systems: SystemsTable,
    ledger: SharedLedger,
    policy: PolicyClient,
    pool_cache: PoolNameCache,
    log: slog::Logger,
}

impl PowerMaxHandler {
    pub fn new(ledger: SharedLedger, policy: PolicyClient, log: slog::Logger) -> Self {
        PowerMaxHandler {
            systems: SystemsTable::default(),
            ledger,
            policy,
            pool_cache: PoolNameCache::new(),
            log,
        }
    }
}

#[async_trait]
impl BackendHandler for PowerMaxHandler {
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
                return respond_error(&ProxyError::PolicyDenied("url not permitted".into()), BODY_SHAPE)
            }
            Ok(_) => {}
        }

        if method == http::Method::PUT && path.contains("/storagegroup/") {
            return self.edit_storage_group(&system, system_id, req).await;
        }

        if method == http::Method::PUT && path.contains("/volume/") {
            return self.volume_modify(&system, system_id, &path, req).await;
        }

        self.bare_proxy(&system, req).await
    }

    async fn update_systems(&self, config: &SystemConfig) {
        let fresh = crate::config::systems_for_family(config, FAMILY);
        reconcile_systems(&self.systems, &fresh, build_powermax_system, &self.log).await;
    }
}

struct ArrayPoolLoader<'a> {
    system: &'a BackendSystem,
    system_id: &'a str,
}

#[async_trait]
impl<'a> PoolLoader for ArrayPoolLoader<'a> {
    async fn load_pools(&self) -> Result<Vec<(String, String)>, ProxyError> {
        let url = format!(
            "{}/univmax/restapi/90/sloprovisioning/symmetrix/{}/srp",
            self.system.entry.endpoint.trim_end_matches('/'),
            self.system_id
        );
        let builder = self.system.client.get(&url);
        let builder = self.system.session.prepare(builder).await?;
        let resp = builder
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(crate::error::UpstreamError::Transport(e)))?;
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ProxyError::Upstream(crate::error::UpstreamError::Transport(e)))?;

        Ok(body
            .get("srpList")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|srp| {
                let name = srp.get("srpId").and_then(Value::as_str)?.to_string();
                Some((name.clone(), name))
            })
            .collect())
    }
}

impl PowerMaxHandler {
    async fn bare_proxy(&self, system: &BackendSystem, req: http::Request<hyper::Body>) -> http::Response<hyper::Body> {
        let method = req.method().clone();
        let path_and_query = req.uri().path_and_query().map(|p| p.as_str().to_string()).unwrap_or_default();
        let mut headers = req.headers().clone();
        strip_inbound_authorization(&mut headers);
        // The 1024-byte cap applies only to the volumeCreate/volumeModify decode step (§4.5 step
        // 1); a bare pass-through forwards the body unchanged, so it reads the whole thing.
        let body = match read_bounded_body(req.into_body(), None).await {
            Ok(b) => b,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        match proxy::forward(system, method, &path_and_query, headers, body).await {
            Ok(resp) => super::passthrough_response(resp.status, resp.headers, resp.body),
            Err(e) => respond_error(&e, BODY_SHAPE),
        }
    }

    fn storage_group_from_path(path: &str) -> Option<String> {
        path.split('/')
            .skip_while(|s| *s != "storagegroup")
            .nth(1)
            .map(str::to_string)
    }

    fn volume_id_from_path(path: &str) -> Option<String> {
        path.split('/')
            .skip_while(|s| *s != "volume")
            .nth(1)
            .map(str::to_string)
    }

    /// Fetch the first storage group owning `volume_id`, the PowerMax equivalent of the other
    /// families' volume-to-pool-id lookup, adapted to PowerMax's volume/storage-group REST shape.
    async fn lookup_volume_storage_group(
        &self,
        system: &BackendSystem,
        system_id: &str,
        volume_id: &str,
    ) -> Result<String, ProxyError> {
        let url = format!(
            "{}/univmax/restapi/90/sloprovisioning/symmetrix/{}/volume/{}/",
            system.entry.endpoint.trim_end_matches('/'),
            system_id,
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

        body.get("storageGroupId")
            .and_then(Value::as_array)
            .and_then(|sgs| sgs.first())
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProxyError::PoolLookup(format!("volume '{volume_id}' has no storage group")))
    }

    /// `PUT .../storagegroup/:storagegroup/` -- delegates to `volume_create` when the body is an
    /// expand-by-size request, otherwise passes through unchanged.
    async fn edit_storage_group(
        &self,
        system: &BackendSystem,
        system_id: &str,
        req: http::Request<hyper::Body>,
    ) -> http::Response<hyper::Body> {
        let mut headers = req.headers().clone();
        strip_inbound_authorization(&mut headers);
        let extensions = req.extensions().clone();
        let path = req.uri().path().to_string();
        let path_and_query = req.uri().path_and_query().map(|p| p.as_str().to_string()).unwrap_or_default();
        let body = match read_bounded_body(req.into_body(), Some(BODY_LIMIT)).await {
            Ok(b) => b,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        let request_json: Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(e) => return respond_error(&ProxyError::Body(e.to_string()), BODY_SHAPE),
        };

        let expand = request_json
            .pointer("/editStorageGroupActionParam/expandStorageGroupParam");

        let is_create = match expand {
            Some(expand) => expand.get("addSpecificVolumeParam").is_none(),
            None => false,
        };

        if !is_create {
            return match proxy::forward(system, http::Method::PUT, &path_and_query, headers, body).await {
                Ok(resp) => super::passthrough_response(resp.status, resp.headers, resp.body),
                Err(e) => respond_error(&e, BODY_SHAPE),
            };
        }

        let expand = expand.unwrap();
        let storage_group = Self::storage_group_from_path(&path).unwrap_or_default();
        let cylinder_count = expand
            .pointer("/addVolumeParam/volumeAttribute/volume_size")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let volume_size_kb = cylinder_count * BYTES_PER_CYLINDER / 1024;
        let volume_name = volume_name_from_headers(&headers);

        let loader = ArrayPoolLoader { system, system_id };
        // PowerMax's SRP acts as the quota pool; resolve it by calling the array for the storage
        // group and taking its SRP, via the same name cache every other family uses.
        let storage_pool_name = match self.pool_cache.resolve(system_id, &storage_group, &loader).await {
            Ok(name) => name,
            Err(_) => storage_group.clone(),
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

        let decision = match self.policy.query("/karavi/volumes/powermax/create", &input_json).await {
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

        // PowerMax's special rule: any permitted role with a 0 quota short-circuits to
        // infinite.
        let max_quota_kb = decision.max_quota_kb(true);

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

        let upstream = match proxy::forward(system, http::Method::PUT, &path_and_query, headers, body).await {
            Ok(r) => r,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        if upstream.is_success() {
            if let Err(e) = self.ledger.publish_created(&quota_request).await {
                slog::error!(self.log, "failed to publish created after successful expand"; "error" => e.to_string());
            }
        }

        super::passthrough_response(upstream.status, upstream.headers, upstream.body)
    }

    /// `PUT .../volume/:volumeid/` -- a rename to a `_DEL*`-prefixed identifier marks the volume
    /// deleted in the ledger once the array confirms the rename.
    async fn volume_modify(
        &self,
        system: &BackendSystem,
        system_id: &str,
        path: &str,
        req: http::Request<hyper::Body>,
    ) -> http::Response<hyper::Body> {
        let mut headers = req.headers().clone();
        strip_inbound_authorization(&mut headers);
        let extensions = req.extensions().clone();
        let path_and_query = req.uri().path_and_query().map(|p| p.as_str().to_string()).unwrap_or_default();
        let body = match read_bounded_body(req.into_body(), Some(BODY_LIMIT)).await {
            Ok(b) => b,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        let request_json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
        let new_identifier = request_json
            .pointer("/editVolumeActionParam/modifyVolumeIdentifierParam/volume_identifier/identifier_name")
            .and_then(Value::as_str)
            .map(str::to_string);

        let Some(new_identifier) = new_identifier else {
            return match proxy::forward(system, http::Method::PUT, &path_and_query, headers, body).await {
                Ok(resp) => super::passthrough_response(resp.status, resp.headers, resp.body),
                Err(e) => respond_error(&e, BODY_SHAPE),
            };
        };

        let Some(volume_id) = Self::volume_id_from_path(path) else {
            return respond_error(&ProxyError::Routing("missing volume segment".into()), BODY_SHAPE);
        };

        let (_tenant, caller_claims) = match claims::extract(&extensions) {
            Ok(v) => v,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        // The ownership check's data key must land on the same key `edit_storage_group` wrote
        // at create time, which is keyed by the volume's storage group (resolved the same way,
        // falling back to the storage group's own name on a pool-cache miss).
        let storage_group = match self.lookup_volume_storage_group(system, system_id, &volume_id).await {
            Ok(sg) => sg,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };
        let loader = ArrayPoolLoader { system, system_id };
        let storage_pool_name = match self.pool_cache.resolve(system_id, &storage_group, &loader).await {
            Ok(name) => name,
            Err(_) => storage_group.clone(),
        };

        // Keyed the same way `edit_storage_group` keys it at create time -- the PV-name header,
        // not the symmetrix volume id -- or `validate_ownership` checks a key the create path
        // never wrote and every legitimate rename-to-`_DEL*` is denied.
        let volume_name = volume_name_from_headers(&headers);

        let quota_request = QuotaRequest {
            system_type: FAMILY.to_string(),
            system_id: system_id.to_string(),
            storage_pool_id: storage_pool_name,
            group: caller_claims.group.clone(),
            volume_name,
            capacity: Decimal::ZERO,
        };

        let owned = match self.ledger.validate_ownership(&quota_request).await {
            Ok(v) => v,
            Err(e) => return respond_error(&ProxyError::Ledger(e), BODY_SHAPE),
        };
        if !owned {
            return respond_error(&ProxyError::OwnershipDenied("request denied"), BODY_SHAPE);
        }

        let upstream = match proxy::forward(system, http::Method::PUT, &path_and_query, headers, body).await {
            Ok(r) => r,
            Err(e) => return respond_error(&e, BODY_SHAPE),
        };

        if upstream.is_success() && new_identifier.starts_with("_DEL") {
            if let Err(e) = self.ledger.publish_deleted(&quota_request).await {
                slog::error!(self.log, "failed to publish deleted after rename-to-_DEL"; "error" => e.to_string());
            }
        }

        super::passthrough_response(upstream.status, upstream.headers, upstream.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_group_from_path_extracts_segment() {
        let path = "/univmax/restapi/90/sloprovisioning/symmetrix/000/storagegroup/mygroup/";
        assert_eq!(
            PowerMaxHandler::storage_group_from_path(path),
            Some("mygroup".to_string())
        );
    }

    #[test]
    fn volume_id_from_path_extracts_segment() {
        let path = "/univmax/restapi/90/sloprovisioning/symmetrix/000/volume/00001/";
        assert_eq!(PowerMaxHandler::volume_id_from_path(path), Some("00001".to_string()));
    }
}
