//! The external policy engine client and its typed decision shapes.
//!
//! A small struct wrapping a shared client handle plus a logger, the same way this crate's
//! other external collaborators are wrapped, backed by a cloneable `reqwest::Client` since the
//! collaborator here is reached over HTTP.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProxyError;

#[derive(Debug, Clone)]
pub struct PolicyClient {
    client: reqwest::Client,
    host: String,
    log: slog::Logger,
}

impl PolicyClient {
    pub fn new(host: impl Into<String>, log: slog::Logger) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build policy engine http client");
        PolicyClient {
            client,
            host: host.into(),
            log,
        }
    }

    /// `POST {opa_host}/v1/data{policy_path}` with `{"input": input}`.
    pub async fn query(
        &self,
        policy_path: &str,
        input: &Value,
    ) -> Result<PolicyResponseEnvelope, ProxyError> {
        let url = format!("{}/v1/data{}", self.host, policy_path);
        slog::debug!(self.log, "querying policy engine"; "url" => &url);

        let body = serde_json::json!({ "input": input });
        let resp = self.client.post(&url).json(&body).send().await?;
        let text = resp.text().await?;

        slog::debug!(self.log, "policy engine response"; "body" => &text);

        let envelope: PolicyResponseEnvelope = serde_json::from_str(&text)?;
        Ok(envelope)
    }

    /// Run the binary URL-admission query used by every backend handler before dispatch.
    pub async fn check_url(
        &self,
        policy_path: &str,
        method: &str,
        url: &str,
    ) -> Result<BinaryDecision, ProxyError> {
        let input = serde_json::json!({ "method": method, "url": url });
        let envelope = self.query(policy_path, &input).await?;
        envelope.result.decode_binary()
    }
}

/// `{"result": {...}}`, the outer shape every OPA-style response takes.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyResponseEnvelope {
    #[serde(default)]
    pub result: Value,
}

impl PolicyResponseEnvelope {
    fn decode_binary(self) -> Result<BinaryDecision, ProxyError> {
        serde_json::from_value(self.result).map_err(ProxyError::PolicyDecode)
    }
}

/// `{ allow: bool }`.
#[derive(Debug, Clone, Deserialize)]
pub struct BinaryDecision {
    #[serde(default)]
    pub allow: bool,
}

/// `{ allow, deny, permitted_roles }`, used for create.
#[derive(Debug, Clone, Deserialize)]
pub struct ProvisioningDecision {
    #[serde(default)]
    pub allow: bool,
    #[serde(default)]
    pub deny: Vec<String>,
    #[serde(default)]
    pub permitted_roles: HashMap<String, i64>,
}

impl ProvisioningDecision {
    /// The maximum quota (kb) granted across permitted roles, with the PowerMax rule that any
    /// `0` short-circuits to `0` (infinite).
    pub fn max_quota_kb(&self, zero_is_infinite_shortcircuit: bool) -> i64 {
        if zero_is_infinite_shortcircuit && self.permitted_roles.values().any(|v| *v == 0) {
            return 0;
        }
        self.permitted_roles.values().copied().max().unwrap_or(0)
    }
}

impl PolicyResponseEnvelope {
    pub fn decode_provisioning(self) -> Result<ProvisioningDecision, ProxyError> {
        serde_json::from_value(self.result).map_err(ProxyError::PolicyDecode)
    }

    pub fn decode_legacy(self) -> Result<LegacyDecision, ProxyError> {
        serde_json::from_value(self.result).map_err(ProxyError::PolicyDecode)
    }
}

/// `{ response: { allowed, status: { reason } }, claims: { group }, quota }`, used for
/// delete/map/unmap.
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyDecision {
    #[serde(default)]
    pub response: LegacyResponse,
    #[serde(default)]
    pub claims: LegacyClaims,
    #[serde(default)]
    pub quota: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyResponse {
    #[serde(default)]
    pub allowed: bool,
    #[serde(default)]
    pub status: LegacyStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyStatus {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyClaims {
    #[serde(default)]
    pub group: String,
}

/// Input payload shape for the provisioning query.
#[derive(Debug, Serialize)]
pub struct ProvisioningInput<'a> {
    pub claims: &'a crate::claims::Claims,
    pub request: &'a Value,
    pub storagepool: &'a str,
    pub storagesystemid: &'a str,
    pub systemtype: &'a str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_quota_kb_without_shortcircuit() {
        let d = ProvisioningDecision {
            allow: true,
            deny: vec![],
            permitted_roles: HashMap::from([("r1".to_string(), 2001), ("r2".to_string(), 500)]),
        };
        assert_eq!(d.max_quota_kb(true), 2001);
    }

    #[test]
    fn max_quota_kb_zero_shortcircuits_when_enabled() {
        let d = ProvisioningDecision {
            allow: true,
            deny: vec![],
            permitted_roles: HashMap::from([("r1".to_string(), 2001), ("r2".to_string(), 0)]),
        };
        assert_eq!(d.max_quota_kb(true), 0);
        assert_eq!(d.max_quota_kb(false), 2001);
    }

    #[test]
    fn max_quota_kb_empty_roles_is_zero() {
        let d = ProvisioningDecision {
            allow: false,
            deny: vec!["no".into()],
            permitted_roles: HashMap::new(),
        };
        assert_eq!(d.max_quota_kb(true), 0);
    }

    #[test]
    fn decodes_legacy_shape() {
        let raw = serde_json::json!({
            "response": {"allowed": false, "status": {"reason": "nope"}},
            "claims": {"group": "TestingGroup"},
            "quota": 100,
        });
        let envelope = PolicyResponseEnvelope { result: raw };
        let decision = envelope.decode_legacy().unwrap();
        assert!(!decision.response.allowed);
        assert_eq!(decision.response.status.reason, "nope");
        assert_eq!(decision.claims.group, "TestingGroup");
        assert_eq!(decision.quota, 100);
    }
}
