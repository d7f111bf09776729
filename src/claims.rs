//! Caller identity.
//!
//! The upstream authentication middleware that produces these is out of scope, but
//! its contract -- what it deposits into the request, and under which keys -- is part of this
//! system's external interface and is honored exactly. We model "request context" the way
//! `http`/`hyper` model it: a typed extension map hung off the request (`Request::extensions`),
//! rather than a side-table keyed by request id, since every request we see already carries one.

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// The decoded identity of the caller. `Serialize` is needed to re-send the claims as
/// part of a policy query's `input`; `Deserialize` is needed to decode them
/// out of the upstream middleware's token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Tenant name. Referred to as "group" throughout the policy wire shapes.
    #[serde(rename = "group")]
    pub group: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub sub: String,
    #[serde(default)]
    pub aud: String,
    #[serde(default)]
    pub iss: String,
    #[serde(default)]
    pub exp: i64,
}

/// The token handle deposited by the upstream auth middleware under the `JWT-token` context
/// key. Its only contractual behavior is producing `Claims` on demand.
#[derive(Debug, Clone)]
pub struct TokenHandle(pub Claims);

impl TokenHandle {
    pub fn claims(&self) -> Claims {
        self.0.clone()
    }
}

/// The tenant name deposited directly by the upstream auth middleware under the
/// `JWT-tenant-name` context key.
#[derive(Debug, Clone)]
pub struct TenantName(pub String);

/// Extract the tenant name and derived claims from a request's context: the tenant name from
/// the `JWT-tenant-name` context value, the token handle from the `JWT-token` context value.
/// Failure of either extraction is a 500.
pub fn extract(extensions: &http::Extensions) -> Result<(String, Claims), ProxyError> {
    let tenant = extensions
        .get::<TenantName>()
        .ok_or_else(|| ProxyError::AuthContext("missing JWT-tenant-name context value".into()))?
        .0
        .clone();

    let claims = extensions
        .get::<TokenHandle>()
        .ok_or_else(|| ProxyError::AuthContext("missing JWT-token context value".into()))?
        .claims();

    Ok((tenant, claims))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_claims(group: &str) -> Claims {
        Claims {
            group: group.to_string(),
            roles: vec!["admin".into()],
            sub: "sub-1".into(),
            aud: "aud-1".into(),
            iss: "iss-1".into(),
            exp: 0,
        }
    }

    #[test]
    fn extract_succeeds_when_both_keys_present() {
        let mut ext = http::Extensions::new();
        ext.insert(TenantName("TestingGroup".into()));
        ext.insert(TokenHandle(sample_claims("TestingGroup")));

        let (tenant, claims) = extract(&ext).unwrap();
        assert_eq!(tenant, "TestingGroup");
        assert_eq!(claims.group, "TestingGroup");
    }

    #[test]
    fn extract_fails_when_tenant_missing() {
        let mut ext = http::Extensions::new();
        ext.insert(TokenHandle(sample_claims("g")));
        assert!(extract(&ext).is_err());
    }

    #[test]
    fn extract_fails_when_token_missing() {
        let mut ext = http::Extensions::new();
        ext.insert(TenantName("g".into()));
        assert!(extract(&ext).is_err());
    }
}
